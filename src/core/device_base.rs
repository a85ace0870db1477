//! TCP Device Base (spec.md 4.1): connection management, line-framed send,
//! and the reply-dispatch entry point shared by all three concrete devices.
//!
//! Concrete devices (`devices::scale`, `devices::tcs`, `devices::m2`) embed a
//! `DeviceBase` by value and implement `ReplyHandler` on an `Arc<Self>` so
//! the background reader task spawned by `connect()` can call back into
//! device-specific reply parsing while still sharing the base's queue
//! admission/advancement machinery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::core::command::{CommandState, DeviceCommandHandle};
use crate::core::queue::CommandQueue;
use crate::core::transport::{LineTransport, TransportError};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Derived devices override `handle_reply` to parse device-specific status
/// lines and drive their own command-completion logic; `on_connected` is
/// called once after a successful `connect()` so the device can enqueue its
/// `init()` sequence (spec.md 4.1: "on successful connect, schedule init()").
#[async_trait]
pub trait ReplyHandler: Send + Sync {
    async fn handle_reply(&self, line: String);
    async fn on_connected(&self);
}

pub struct DeviceBase {
    pub name: String,
    pub transport: Arc<dyn LineTransport>,
    queue: Mutex<CommandQueue>,
}

impl DeviceBase {
    pub fn new(name: impl Into<String>, transport: Arc<dyn LineTransport>, queue: CommandQueue) -> Self {
        Self {
            name: name.into(),
            transport,
            queue: Mutex::new(queue),
        }
    }

    pub async fn connect(self: &Arc<Self>, handler: Arc<dyn ReplyHandler>) -> Result<(), TransportError> {
        self.transport.connect().await?;
        self.spawn_reader(handler.clone());
        handler.on_connected().await;
        Ok(())
    }

    /// Idempotent: every queued command fails with "Not connected"; new
    /// commands may still be enqueued afterwards and will fail immediately
    /// (via `start`) until a reconnect.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.transport.disconnect().await?;
        let mut queue = self.queue.lock().await;
        if let Some(running) = queue.running() {
            running.complete(CommandState::Failed, Some("Not connected".into()));
        }
        queue.on_running_complete();
        while let Some(next) = queue.try_start_next() {
            // Nothing is actually connected; fail it immediately rather than
            // attempting I/O, same as `start` would do.
            next.complete(CommandState::Failed, Some("Not connected".into()));
            queue.on_running_complete();
        }
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>, handler: Arc<dyn ReplyHandler>) {
        let base = self.clone();
        tokio::spawn(async move {
            loop {
                match base.transport.recv_line(None).await {
                    Ok(line) => handler.handle_reply(line).await,
                    Err(TransportError::ConnectionLost(_)) | Err(TransportError::NotConnected) => {
                        warn!("{}: connection lost, stopping reader", base.name);
                        break;
                    }
                    Err(e) => {
                        error!("{}: receive error: {e}", base.name);
                        break;
                    }
                }
            }
        });
    }

    /// Enqueue `cmd` and, if nothing else is running, start it immediately.
    pub async fn enqueue(self: &Arc<Self>, cmd: DeviceCommandHandle) {
        let next = {
            let mut queue = self.queue.lock().await;
            queue.add(cmd);
            queue.try_start_next()
        };
        if let Some(next) = next {
            self.start(next).await;
        }
    }

    async fn start(self: &Arc<Self>, cmd: DeviceCommandHandle) {
        if let Some(deadline) = cmd.deadline() {
            let base = self.clone();
            let cmd_for_timeout = cmd.clone();
            tokio::spawn(async move {
                let now = std::time::Instant::now();
                if deadline > now {
                    tokio::time::sleep(deadline - now).await;
                }
                if cmd_for_timeout.state() == CommandState::Running {
                    cmd_for_timeout.complete(CommandState::Failed, Some("timeout".into()));
                    base.advance().await;
                }
            });
        }

        match self.transport.write_line(&cmd.command_text).await {
            Ok(()) => {}
            Err(_) => {
                cmd.complete(CommandState::Failed, Some("Not connected".into()));
                self.advance().await;
            }
        }
    }

    /// Called once the currently-running command has reached a terminal
    /// state, to pop and start the next Ready command (if any).
    pub async fn advance(self: &Arc<Self>) {
        let next = {
            let mut queue = self.queue.lock().await;
            queue.on_running_complete();
            queue.try_start_next()
        };
        if let Some(next) = next {
            self.start(next).await;
        }
    }

    pub async fn current_running(&self) -> Option<DeviceCommandHandle> {
        self.queue.lock().await.running()
    }

    pub async fn is_busy(&self) -> bool {
        self.queue.lock().await.is_busy()
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }
}
