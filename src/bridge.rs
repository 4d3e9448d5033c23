// src/bridge.rs
//
// =============================================================================
// STRATUS: LOG STREAMING BRIDGE
// =============================================================================
//
// Forwards a running container's log stream to one WebSocket subscriber,
// frame by frame, until either side closes.
//
// Lookup is by the deterministic container name, so the bridge needs no
// channel to the worker: any process that can see the runtime can serve a
// subscriber. A foreign task id answers exactly like a missing one.

use crate::core::{container_name, Principal};
use crate::runtime::ContainerRuntime;
use crate::store::TaskStore;

use axum::extract::ws::{Message, WebSocket};
use futures_util::StreamExt;
use std::sync::Arc;

pub async fn stream_task_logs(
    store: Arc<TaskStore>,
    principal: Principal,
    task_id: i64,
    mut socket: WebSocket,
) {
    let task = match store.get_task(task_id) {
        Ok(Some(task)) if task.user_id == principal.id => task,
        _ => {
            let _ = socket.send(Message::Text("Task not found".into())).await;
            let _ = socket.close().await;
            return;
        }
    };

    let runtime = match ContainerRuntime::connect() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::warn!("Runtime unreachable for log stream of task {}: {}", task_id, e);
            let _ = socket.send(Message::Text("Container not running".into())).await;
            let _ = socket.close().await;
            return;
        }
    };

    let name = container_name(task.user_id, task.id);
    let container = match runtime.find_by_name(&name).await {
        Ok(Some(container)) if container.running => container,
        _ => {
            let _ = socket.send(Message::Text("Container not running".into())).await;
            let _ = socket.close().await;
            return;
        }
    };

    log::debug!("Streaming logs of {} to user {}", name, principal.id);
    let mut frames = runtime.log_stream(&container.id);

    loop {
        tokio::select! {
            frame = frames.next() => {
                match frame {
                    Some(Ok(output)) => {
                        let line = String::from_utf8_lossy(&output.into_bytes())
                            .trim()
                            .to_string();
                        if socket.send(Message::Text(line)).await.is_err() {
                            // Subscriber went away; the container is unaffected.
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Log stream for task {} dropped: {}", task_id, e);
                        break;
                    }
                    // Container exited.
                    None => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
                    // Pings and stray frames are not ours to answer.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = socket.close().await;
}
