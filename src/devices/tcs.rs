//! TCS Device (spec.md 4.4): pointing, tracking, offset and status over a
//! single opaque line protocol. The wire syntax itself is not specified by
//! the reference ("treat as an opaque line protocol"); only the status
//! fields, the derived axis predicates, and the completion semantics of
//! `track`/`offset` are load-bearing and implemented faithfully below.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::command::{CommandState, DeviceCommand};
use crate::core::device_base::{DeviceBase, ReplyHandler, DEFAULT_COMMAND_TIMEOUT};
use crate::core::operator_command::{OperatorCommand, OperatorCommandHandle, OperatorCommandId};
use crate::core::queue::CommandQueue;
use crate::core::transport::{LineTransport, TransportError};

/// How long `track()` polls status waiting for both axes to read
/// "Tracking" before giving up (spec.md 4.4: "operator-visible definition
/// of done... is that both RA and Dec axes have reached state Tracking").
const TRACK_POLL_TIMEOUT: Duration = Duration::from_secs(120);
const TRACK_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct TcsStatus {
    /// Per-axis state strings, at least 2 entries (RA, Dec); element i in
    /// {"Halted", "Slewing", "Tracking", ...}.
    pub state: Vec<String>,
    pub st: Option<f64>,
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub inpra: Option<f64>,
    pub inpdc: Option<f64>,
    pub pos: Option<(f64, f64)>,
    pub truss_temp: Option<f64>,
}

impl TcsStatus {
    fn parse_line(&mut self, line: &str) {
        let line = line.trim().to_lowercase();
        let Some((key, rest)) = line.split_once(char::is_whitespace) else {
            return;
        };
        let rest = rest.trim();
        match key {
            "state" => self.state = rest.split_whitespace().map(str::to_string).collect(),
            "st" => self.st = rest.parse().ok(),
            "ra" => self.ra = rest.parse().ok(),
            "dec" => self.dec = rest.parse().ok(),
            "inpra" => self.inpra = rest.parse().ok(),
            "inpdc" => self.inpdc = rest.parse().ok(),
            "trusstemp" => self.truss_temp = rest.parse().ok(),
            "pos" => {
                let parts: Vec<f64> = rest.split_whitespace().filter_map(|t| t.parse().ok()).collect();
                if parts.len() == 2 {
                    self.pos = Some((parts[0], parts[1]));
                }
            }
            _ => {}
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.state.len() >= 2 && self.state[0] == "tracking" && self.state[1] == "tracking"
    }

    pub fn is_slewing(&self) -> bool {
        self.state.len() >= 2 && (self.state[0] == "slewing" || self.state[1] == "slewing")
    }

    pub fn axis_halted(&self) -> bool {
        self.state.len() >= 2 && (self.state[0] == "halted" || self.state[1] == "halted")
    }

    /// `(ha, dec)` for the collimation loop: target coordinates while
    /// slewing, current `pos` otherwise (spec.md 4.6 step 4).
    pub fn collimation_coords(&self) -> Option<(f64, f64)> {
        if self.is_slewing() {
            let ha = self.st? - self.inpra?;
            Some((ha, self.inpdc?))
        } else {
            self.pos
        }
    }
}

pub struct TcsDevice {
    base: Arc<DeviceBase>,
    status: Mutex<TcsStatus>,
}

impl TcsDevice {
    pub fn new(transport: Arc<dyn LineTransport>) -> Arc<Self> {
        let queue = CommandQueue::new(std::collections::HashMap::new(), 1, Vec::new());
        Arc::new(Self {
            base: Arc::new(DeviceBase::new("tcs", transport, queue)),
            status: Mutex::new(TcsStatus::default()),
        })
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        let handler: Arc<dyn ReplyHandler> = self.clone();
        self.base.connect(handler).await
    }

    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.base.disconnect().await
    }

    pub async fn status(&self) -> TcsStatus {
        self.status.lock().await.clone()
    }

    pub async fn is_tracking(&self) -> bool {
        self.status.lock().await.is_tracking()
    }

    pub async fn is_slewing(&self) -> bool {
        self.status.lock().await.is_slewing()
    }

    pub async fn get_status(self: &Arc<Self>, op: OperatorCommandHandle) {
        {
            let mut status = self.status.lock().await;
            status.state.clear();
        }
        let cmd = DeviceCommand::new("status", "status", Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        op.link(cmd.clone());
        self.base.enqueue(cmd).await;
    }

    /// Enqueues `track <ra> <dec>`, then -- once that device command has
    /// gone Done -- polls status until both axes read "Tracking" or
    /// `TRACK_POLL_TIMEOUT` elapses, finishing `op` directly rather than
    /// through the link-set (spec.md 4.4).
    pub async fn track(self: &Arc<Self>, ra: f64, dec: f64, op: OperatorCommandHandle) {
        let cmd = DeviceCommand::new("track", format!("track {ra:.6} {dec:.6}"), Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        op.link(cmd.clone());
        self.base.enqueue(cmd.clone()).await;

        let dev = self.clone();
        tokio::spawn(async move {
            match cmd.wait_terminal().await {
                CommandState::Done => {}
                CommandState::Cancelled => {
                    op.cancel(cmd.message().unwrap_or_else(|| "track cancelled".into()));
                    return;
                }
                _ => {
                    op.fail(cmd.message().unwrap_or_else(|| "track command failed".into()));
                    return;
                }
            }
            let deadline = tokio::time::Instant::now() + TRACK_POLL_TIMEOUT;
            loop {
                let poll_op =
                    OperatorCommand::new_internal("status", OperatorCommandId(0));
                dev.get_status(poll_op.clone()).await;
                poll_op.await_links().await;
                if dev.is_tracking().await {
                    op.succeed();
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    op.fail("track did not reach Tracking on both axes before timeout");
                    return;
                }
                tokio::time::sleep(TRACK_POLL_INTERVAL).await;
            }
        });
    }

    /// Offsets are applied with sign inversion relative to operator input
    /// (site convention, spec.md 4.4) -- but only for `arc` offsets, per the
    /// narrower rule in spec.md 4.7 ("dispatch to TCS offset with sign
    /// inversion for arc offsets"); rotator/calibration offsets pass through
    /// unchanged.
    pub async fn offset(self: &Arc<Self>, kind: &str, values: &[f64], op: OperatorCommandHandle) {
        let sign = if kind.eq_ignore_ascii_case("arc") { -1.0 } else { 1.0 };
        let inverted: Vec<String> = values.iter().map(|v| format!("{:.6}", v * sign)).collect();
        let text = format!("offset {kind} {}", inverted.join(" "));
        let cmd = DeviceCommand::new("offset", text, Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        op.link(cmd.clone());
        self.base.enqueue(cmd).await;
    }
}

#[async_trait]
impl ReplyHandler for TcsDevice {
    async fn on_connected(&self) {}

    async fn handle_reply(&self, line: String) {
        let trimmed = line.trim().to_string();
        if trimmed.is_empty() {
            return;
        }
        let Some(current) = self.base.current_running().await else {
            tracing::debug!(target: "tcs", "unsolicited reply dropped: {trimmed}");
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
            return;
        }
        if current.verb == "status" {
            self.status.lock().await.parse_line(&trimmed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_predicates_read_first_two_state_entries() {
        let mut status = TcsStatus::default();
        status.state = vec!["tracking".into(), "tracking".into()];
        assert!(status.is_tracking());
        assert!(!status.is_slewing());

        status.state = vec!["slewing".into(), "tracking".into()];
        assert!(status.is_slewing());
        assert!(!status.is_tracking());

        status.state = vec!["halted".into(), "tracking".into()];
        assert!(status.axis_halted());
    }

    #[test]
    fn collimation_coords_use_target_while_slewing() {
        let mut status = TcsStatus::default();
        status.state = vec!["slewing".into(), "tracking".into()];
        status.st = Some(100.0);
        status.inpra = Some(40.0);
        status.inpdc = Some(-10.0);
        status.pos = Some((1.0, 2.0));
        assert_eq!(status.collimation_coords(), Some((60.0, -10.0)));
    }

    #[test]
    fn collimation_coords_use_current_pos_when_not_slewing() {
        let mut status = TcsStatus::default();
        status.state = vec!["tracking".into(), "tracking".into()];
        status.pos = Some((3.0, 4.0));
        assert_eq!(status.collimation_coords(), Some((3.0, 4.0)));
    }

    #[tokio::test]
    async fn arc_offset_inverts_sign_other_kinds_pass_through() {
        let dev = TcsDevice::new(Arc::new(crate::core::transport::TcpLineTransport::new("127.0.0.1", 0)));
        let op = OperatorCommand::new_user_initiated("offset", "offset arc 5,5");
        dev.offset("arc", &[5.0, 5.0], op.clone()).await;
        assert_eq!(op.links()[0].command_text, "offset arc -5.000000 -5.000000");

        let op2 = OperatorCommand::new_user_initiated("offset", "offset rotator 3");
        dev.offset("rotator", &[3.0], op2.clone()).await;
        assert_eq!(op2.links()[0].command_text, "offset rotator 3.000000");
    }
}
