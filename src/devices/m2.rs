//! M2 Device (spec.md 4.5): secondary-mirror orientation and focus. Wire
//! syntax is opaque, same as the TCS device; only the orientation/focus
//! bookkeeping and the busy flag are load-bearing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::command::{CommandState, DeviceCommand};
use crate::core::device_base::{DeviceBase, ReplyHandler, DEFAULT_COMMAND_TIMEOUT};
use crate::core::operator_command::OperatorCommandHandle;
use crate::core::queue::CommandQueue;
use crate::core::transport::{LineTransport, TransportError};

/// `(focus, tiltX, tiltY, transX, transY)`.
pub type Orientation = [f64; 5];

pub struct M2Device {
    base: Arc<DeviceBase>,
    orientation: Mutex<Orientation>,
    sec_focus: Mutex<f64>,
}

impl M2Device {
    pub fn new(transport: Arc<dyn LineTransport>) -> Arc<Self> {
        let queue = CommandQueue::new(std::collections::HashMap::new(), 1, Vec::new());
        Arc::new(Self {
            base: Arc::new(DeviceBase::new("m2", transport, queue)),
            orientation: Mutex::new([0.0; 5]),
            sec_focus: Mutex::new(0.0),
        })
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        let handler: Arc<dyn ReplyHandler> = self.clone();
        self.base.connect(handler).await
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.base.disconnect().await
    }

    pub async fn is_busy(&self) -> bool {
        self.base.is_busy().await
    }

    pub async fn orientation(&self) -> Orientation {
        *self.orientation.lock().await
    }

    pub async fn sec_focus(&self) -> f64 {
        *self.sec_focus.lock().await
    }

    /// Attempting to move while busy is the caller's responsibility to
    /// check first (spec.md 4.5: enforced by the set-scale/collimation
    /// handlers, not this device, so the failure message can name the
    /// pairing that was attempted).
    pub async fn move_to(self: &Arc<Self>, orient: Orientation, op: OperatorCommandHandle) {
        let text = format!(
            "move {:.6} {:.6} {:.6} {:.6} {:.6}",
            orient[0], orient[1], orient[2], orient[3], orient[4]
        );
        let cmd = DeviceCommand::new("move", text, Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        op.link(cmd.clone());
        {
            let mut current = self.orientation.lock().await;
            *current = orient;
        }
        self.base.enqueue(cmd).await;
    }

    /// `delta_um`: either an absolute target focus or an offset added to
    /// the current `secFocus`, per `offset`.
    pub async fn focus(self: &Arc<Self>, delta_um: f64, offset: bool, op: OperatorCommandHandle) {
        let target = if offset {
            *self.sec_focus.lock().await + delta_um
        } else {
            delta_um
        };
        let cmd = DeviceCommand::new("focus", format!("focus {target:.4}"), Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        op.link(cmd.clone());
        {
            let mut focus = self.sec_focus.lock().await;
            *focus = target;
        }
        {
            let mut orient = self.orientation.lock().await;
            orient[0] = target;
        }
        self.base.enqueue(cmd).await;
    }

    pub async fn get_status(self: &Arc<Self>, op: OperatorCommandHandle) {
        let cmd = DeviceCommand::new("status", "status", Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        op.link(cmd.clone());
        self.base.enqueue(cmd).await;
    }
}

#[async_trait]
impl ReplyHandler for M2Device {
    async fn on_connected(&self) {}

    async fn handle_reply(&self, line: String) {
        let trimmed = line.trim().to_string();
        if trimmed.is_empty() {
            return;
        }
        let Some(current) = self.base.current_running().await else {
            tracing::debug!(target: "m2", "unsolicited reply dropped: {trimmed}");
            return;
        };
        if current.state() != CommandState::Running {
            return;
        }
        let lower = trimmed.to_lowercase();

        if lower == "ok" {
            current.complete(CommandState::Done, None);
            self.base.advance().await;
            return;
        }
        if lower == current.command_text.to_lowercase() {
            return;
        }
        if lower.contains("error") {
            current.complete(CommandState::Failed, Some(trimmed));
            self.base.advance().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::TcpLineTransport;

    fn fresh_device() -> Arc<M2Device> {
        M2Device::new(Arc::new(TcpLineTransport::new("127.0.0.1", 0)))
    }

    #[tokio::test]
    async fn focus_offset_adds_to_current_sec_focus() {
        let m2 = fresh_device();
        {
            let mut focus = m2.sec_focus.lock().await;
            *focus = 10.0;
        }
        let op = crate::core::operator_command::OperatorCommand::new_user_initiated("set focus", "set focus=5/incremental");
        m2.focus(5.0, true, op).await;
        assert_eq!(m2.sec_focus().await, 15.0);
    }

    #[tokio::test]
    async fn move_replaces_orientation() {
        let m2 = fresh_device();
        let op = crate::core::operator_command::OperatorCommand::new_user_initiated("collimate", "collimate");
        m2.move_to([1.0, 2.0, 3.0, 4.0, 5.0], op).await;
        assert_eq!(m2.orientation().await, [1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
