// src/runtime.rs
//
// =============================================================================
// STRATUS: CONTAINER RUNTIME ADAPTER
// =============================================================================
//
// Thin seam over the Docker Engine API (bollard), shared by the worker
// (run-to-completion), the log bridge (follow by name), and delete
// (cleanup verification).
//
// The adapter owns the redelivery quirks so callers stay linear:
// - create on an existing name (409) adopts that container instead of
//   failing; the name is derived from (owner, task) so a same-name
//   container IS this unit of work.
// - start on an already-started container (304) is a no-op.
// - remove of a missing container (404) is a no-op.

use crate::core::MOUNT_POINT;
use anyhow::{Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;

pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogOutput, DockerError>> + Send>>;

/// What the worker asks for; translated into the engine's host config.
pub struct ContainerSpec {
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: Vec<String>,
    /// `<host_workspace>:/workspaces:rw`
    pub bind: String,
    pub cpu_cores: u32,
    pub gpu: bool,
}

#[derive(Debug, Clone)]
pub struct FoundContainer {
    pub id: String,
    pub running: bool,
}

#[derive(Clone)]
pub struct ContainerRuntime {
    docker: Docker,
}

impl ContainerRuntime {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to reach container runtime")?;
        Ok(Self { docker })
    }

    /// Create and start a container under the given name, returning its id.
    pub async fn create_and_start(&self, name: &str, spec: ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            binds: Some(vec![spec.bind]),
            nano_cpus: Some(spec.cpu_cores as i64 * 1_000_000_000),
            device_requests: if spec.gpu {
                Some(vec![DeviceRequest {
                    driver: None,
                    count: Some(1),
                    device_ids: None,
                    capabilities: Some(vec![vec!["gpu".to_string()]]),
                    options: None,
                }])
            } else {
                None
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image),
            cmd: spec.command,
            env: Some(spec.env),
            working_dir: Some(MOUNT_POINT.to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let id = match self.docker.create_container(Some(options), config).await {
            Ok(created) => created.id,
            // Redelivered payload: the previous delivery already created
            // this container. Adopt it.
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => self
                .docker
                .inspect_container(name, None)
                .await
                .context("Name conflict but container not inspectable")?
                .id
                .context("Runtime returned a container without an id")?,
            Err(e) => return Err(e.into()),
        };

        match self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(id)
    }

    /// Follow the container's combined stdout/stderr stream.
    pub fn log_stream(&self, id_or_name: &str) -> LogStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        Box::pin(self.docker.logs(id_or_name, Some(options)))
    }

    /// Block until the container exits; returns its exit code. The engine
    /// reports non-zero exits either in the wait body or as a wait error.
    pub async fn wait_exit(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(resp)) => Ok(resp.status_code),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => anyhow::bail!("Container wait stream ended without a status"),
        }
    }

    /// Force-remove; a container that is already gone is fine.
    pub async fn remove(&self, id_or_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id_or_name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Exact-name lookup across all containers (running or not).
    pub async fn find_by_name(&self, name: &str) -> Result<Option<FoundContainer>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;

        // The engine's name filter is a substring match; pin it down.
        let wanted = format!("/{}", name);
        for summary in summaries {
            let names = summary.names.unwrap_or_default();
            if names.iter().any(|n| n == &wanted) {
                if let Some(id) = summary.id {
                    let running = summary.state.as_deref() == Some("running");
                    return Ok(Some(FoundContainer { id, running }));
                }
            }
        }
        Ok(None)
    }
}
