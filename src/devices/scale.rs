//! Scale Device (spec.md 4.3): the scaling ring controller. Owns the
//! thread-ring/lock-ring/winch axis status parser, the move/home/stop/speed
//! command set, and the scale<->mm conversions used by `set scaleFactor`.
//!
//! The wire grammar below is line-oriented and stateful: `ID_SW`/`POS_SW`
//! announce that the *next* line carries the values (the controller splits
//! what is logically one key-value pair across two lines), and every other
//! status line belongs to whichever `*_AXIS` header was last seen.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::command::{CommandState, DeviceCommand};
use crate::core::device_base::{DeviceBase, ReplyHandler, DEFAULT_COMMAND_TIMEOUT};
use crate::core::keywords::KeywordDict;
use crate::core::operator_command::OperatorCommandHandle;
use crate::core::queue::{CommandQueue, KillAction, KillRule};
use crate::core::transport::LineTransport;

pub const MAX_SPEED: f64 = 0.1;
pub const NOM_SPEED: f64 = 0.1;
pub const SCALE_PER_MM: f64 = 8.45e-5;
pub const ZERO_POINT: f64 = 20.0;
pub const LOCKED_SETPOINT: f64 = 25.0;
pub const MOVE_RANGE: (f64, f64) = (0.0, 40.0);
pub const MOVE_TOLERANCE_MM: f64 = 10.0 / 1000.0;
/// Display bound for the iteration counter in the `ThreadRingState` keyword
/// (spec.md 3: "max-iteration bound (3)"). Distinct from `STATUS_MAX_RETRY`:
/// the reference implementation reuses one attribute name for both, which
/// made the display bound silently track whatever the last status retry set
/// it to -- kept apart here on purpose (see DESIGN.md).
pub const RING_DISPLAY_MAX_ITER: u32 = 3;
pub const STATUS_MAX_RETRY: u32 = 4;
pub const POLL_IDLE: Duration = Duration::from_secs(4);
pub const POLL_ACTIVE: Duration = Duration::from_secs(1);

/// scale = 1 - (pos - zero) * alpha
pub fn mm2scale(pos_mm: f64) -> f64 {
    1.0 - (pos_mm - ZERO_POINT) * SCALE_PER_MM
}

/// pos = -(scale - 1) / alpha + zero
pub fn scale2mm(scale: f64) -> f64 {
    -(scale - 1.0) / SCALE_PER_MM + ZERO_POINT
}

/// Round-trip through scale space: pos -> scale -> scale*mult -> pos.
/// Loses precision for `mult` near 1 because it differences two numbers
/// close to `ZERO_POINT / SCALE_PER_MM`; kept alongside
/// `scale_mult2mm_stable` for that comparison's own sake (spec.md 8).
pub fn scale_mult2mm(current_pos_mm: f64, mult: f64) -> f64 {
    scale2mm(mm2scale(current_pos_mm) * mult)
}

/// Algebraically identical to `scale_mult2mm` but rearranged to avoid
/// subtracting two large, nearly-equal terms: expanding
/// `scale2mm(mm2scale(p)*m)` gives `m*(p-z) - (m-1)/alpha + z`, with no
/// intermediate scale-space value near 1 to difference against 1 at
/// `1/alpha` amplification.
pub fn scale_mult2mm_stable(current_pos_mm: f64, mult: f64) -> f64 {
    mult * (current_pos_mm - ZERO_POINT) - (mult - 1.0) / SCALE_PER_MM + ZERO_POINT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    ThreadRing,
    LockRing,
    Winch,
}

#[derive(Debug, Clone, Default)]
pub struct AxisStatus {
    pub actual_position: Option<f64>,
    pub target_position: Option<f64>,
    pub drive_speed: Option<f64>,
    pub open_setpoint: Option<f64>,
    pub up_setpoint: Option<f64>,
    pub move_range: Option<(f64, f64)>,
    pub hardware_fault: Option<i64>,
    pub instruction_fault: Option<i64>,
    pub overtravel: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Done,
    Moving,
    Homing,
    NotHomed,
    Failed,
}

impl RingState {
    fn as_str(self) -> &'static str {
        match self {
            RingState::Done => "Done",
            RingState::Moving => "Moving",
            RingState::Homing => "Homing",
            RingState::NotHomed => "NotHomed",
            RingState::Failed => "Failed",
        }
    }
}

struct RingStateInfo {
    state: RingState,
    curr_iter: u32,
    total_time: Option<Duration>,
    started: Instant,
}

impl RingStateInfo {
    fn display(&self) -> String {
        let remaining = self
            .total_time
            .map(|total| total.saturating_sub(self.started.elapsed()).as_secs_f64())
            .unwrap_or(0.0);
        let total = self.total_time.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        format!(
            "{}, {}, {}, {:.1}, {:.1}",
            self.state.as_str(),
            self.curr_iter,
            RING_DISPLAY_MAX_ITER,
            remaining.max(0.0),
            total
        )
    }
}

/// Parser + accumulated fields for one `status` reply (spec.md 4.3). Mirrors
/// `ScaleDevice.Status` in the reference grammar: `POS_SW`/`ID_SW` headers
/// flip a "next line is the value" flag, `*_AXIS` headers switch which
/// per-axis dict subsequent `key value` lines land in, and `checkFullStatus`
/// is only satisfied once all three axis headers have been seen at least
/// once since the last `flush`.
pub struct ScaleStatus {
    pub thread_ring: AxisStatus,
    pub lock_ring: AxisStatus,
    pub winch: AxisStatus,
    pub pos_sw: Option<[i32; 3]>,
    pub id_sw: Option<[i32; 9]>,
    pub cartridge_id: Option<i32>,
    pub gang_connector_sw: Option<bool>,
    pub gang_stowed_sw: Option<bool>,
    current_axis: Axis,
    pos_sw_next: bool,
    id_sw_next: bool,
    got_thread_ring: bool,
    got_lock_ring: bool,
    got_winch: bool,
    pub n_iter: u32,
}

impl Default for ScaleStatus {
    fn default() -> Self {
        Self {
            thread_ring: AxisStatus::default(),
            lock_ring: AxisStatus::default(),
            winch: AxisStatus::default(),
            pos_sw: None,
            id_sw: None,
            cartridge_id: None,
            gang_connector_sw: None,
            gang_stowed_sw: None,
            current_axis: Axis::ThreadRing,
            pos_sw_next: false,
            id_sw_next: false,
            got_thread_ring: false,
            got_lock_ring: false,
            got_winch: false,
            n_iter: 0,
        }
    }
}

impl ScaleStatus {
    pub fn flush(&mut self) {
        *self = ScaleStatus::default();
    }

    fn axis_mut(&mut self, axis: Axis) -> &mut AxisStatus {
        match axis {
            Axis::ThreadRing => &mut self.thread_ring,
            Axis::LockRing => &mut self.lock_ring,
            Axis::Winch => &mut self.winch,
        }
    }

    /// Feed one reply line into the parser. Unrecognized lines are ignored,
    /// same as the reference's best-effort `parseStatusLine`.
    pub fn parse_line(&mut self, raw: &str) {
        let line = raw.trim().trim_matches('_').to_lowercase().replace(':', "");
        if line.is_empty() {
            return;
        }

        if line.contains("pos_sw") {
            self.pos_sw_next = true;
            return;
        }
        if self.pos_sw_next {
            self.pos_sw_next = false;
            let vals: Vec<i32> = line.split_whitespace().filter_map(|t| t.parse().ok()).collect();
            if vals.len() == 3 {
                self.pos_sw = Some([vals[0], vals[1], vals[2]]);
            }
            return;
        }

        if line.contains("id_sw") {
            self.id_sw_next = true;
            return;
        }
        if self.id_sw_next {
            self.id_sw_next = false;
            let vals: Vec<i32> = line.split_whitespace().filter_map(|t| t.parse().ok()).collect();
            if vals.len() == 9 {
                let mut arr = [0; 9];
                arr.copy_from_slice(&vals);
                self.id_sw = Some(arr);
            }
            return;
        }

        if line.contains("_axis") {
            self.current_axis = match line.as_str() {
                "thread_ring_axis" => {
                    self.got_thread_ring = true;
                    Axis::ThreadRing
                }
                "lock_ring_axis" => {
                    self.got_lock_ring = true;
                    Axis::LockRing
                }
                "winch_axis" => {
                    self.got_winch = true;
                    Axis::Winch
                }
                _ => self.current_axis,
            };
            return;
        }

        if line.contains("overtravel") {
            let on = line.ends_with("on");
            self.axis_mut(self.current_axis).overtravel = Some(on);
            return;
        }

        if line.contains("gang") {
            let on = line.ends_with("on");
            let key = line.trim_end_matches("on").trim_end_matches("off").trim();
            if key.contains("connector") {
                self.gang_connector_sw = Some(on);
            } else if key.contains("stowed") {
                self.gang_stowed_sw = Some(on);
            }
            return;
        }

        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            return;
        };
        let value = value.trim();
        let key_type = key.rsplit('_').next().unwrap_or("");
        let axis = self.current_axis;
        match key_type {
            "position" | "speed" | "setpoint" => {
                if let Ok(v) = value.parse::<f64>() {
                    let target = self.axis_mut(axis);
                    match key {
                        k if k.contains("actual_position") => target.actual_position = Some(v),
                        k if k.contains("target_position") => target.target_position = Some(v),
                        k if k.contains("drive_speed") => target.drive_speed = Some(v),
                        k if k.contains("open_setpoint") => target.open_setpoint = Some(v),
                        k if k.contains("up_setpoint") => target.up_setpoint = Some(v),
                        _ => {}
                    }
                }
            }
            "fault" => {
                if let Ok(v) = value.parse::<i64>() {
                    let target = self.axis_mut(axis);
                    if key.contains("hardware") {
                        target.hardware_fault = Some(v);
                    } else if key.contains("instruction") {
                        target.instruction_fault = Some(v);
                    }
                }
            }
            "range" => {
                let parts: Vec<f64> = value.split('-').filter_map(|t| t.trim().parse().ok()).collect();
                if parts.len() == 2 {
                    self.axis_mut(axis).move_range = Some((parts[0], parts[1]));
                }
            }
            _ if key.contains("cartridge") => {
                self.cartridge_id = value.parse().ok();
            }
            _ => {}
        }
    }

    /// `checkFullStatus`: every axis header must have been seen and every
    /// field in every axis dict (plus the top-level switches) populated.
    /// Raising on a partial status is replaced here by a plain bool -- the
    /// retry loop lives in `ScaleDevice::handle_reply`.
    pub fn is_complete(&self) -> bool {
        if !(self.got_thread_ring && self.got_lock_ring && self.got_winch) {
            return false;
        }
        let thread_ring_ok = self.thread_ring.actual_position.is_some()
            && self.thread_ring.target_position.is_some()
            && self.thread_ring.drive_speed.is_some()
            && self.thread_ring.move_range.is_some()
            && self.thread_ring.hardware_fault.is_some()
            && self.thread_ring.instruction_fault.is_some()
            && self.thread_ring.overtravel.is_some();
        let lock_ring_ok = self.lock_ring.actual_position.is_some()
            && self.lock_ring.target_position.is_some()
            && self.lock_ring.open_setpoint.is_some()
            && self.lock_ring.move_range.is_some()
            && self.lock_ring.hardware_fault.is_some()
            && self.lock_ring.instruction_fault.is_some();
        let winch_ok = self.winch.actual_position.is_some()
            && self.winch.target_position.is_some()
            && self.winch.up_setpoint.is_some()
            && self.winch.move_range.is_some()
            && self.winch.hardware_fault.is_some()
            && self.winch.instruction_fault.is_some();
        thread_ring_ok
            && lock_ring_ok
            && winch_ok
            && self.pos_sw.is_some()
            && self.id_sw.is_some()
            && self.cartridge_id.is_some()
            && self.gang_connector_sw.is_some()
            && self.gang_stowed_sw.is_some()
    }

    /// `loaded`: true iff all three position switches read non-zero.
    pub fn loaded(&self) -> bool {
        self.pos_sw.is_some_and(|sw| sw.iter().all(|&v| v != 0))
    }

    /// `locked`: lock-ring position below the locked setpoint.
    pub fn locked(&self) -> bool {
        self.lock_ring.actual_position.is_some_and(|p| p < LOCKED_SETPOINT)
    }

    pub fn locked_and_loaded(&self) -> bool {
        self.locked() && self.loaded()
    }

    /// Majority vote across the three redundant id-switch triplets; -1 if
    /// no two of the three agree.
    pub fn cart_id(&self) -> i32 {
        let Some(sw) = self.id_sw else { return -1 };
        let triplet = |bits: &[i32]| bits[0] * 4 + bits[1] * 2 + bits[2];
        let vals = [triplet(&sw[0..3]), triplet(&sw[3..6]), triplet(&sw[6..9])];
        let mut counts: Vec<(i32, u32)> = Vec::new();
        for v in vals {
            if let Some(slot) = counts.iter_mut().find(|(val, _)| *val == v) {
                slot.1 += 1;
            } else {
                counts.push((v, 1));
            }
        }
        if counts.len() == 3 {
            return -1;
        }
        let best = counts.iter().max_by_key(|(_, c)| *c).unwrap().0;
        if best > 0 {
            best + 20
        } else {
            best
        }
    }
}

pub struct ScaleDevice {
    base: Arc<DeviceBase>,
    keywords: Arc<KeywordDict>,
    status: Mutex<ScaleStatus>,
    ring: Mutex<RingStateInfo>,
}

impl ScaleDevice {
    pub fn new(transport: Arc<dyn LineTransport>, keywords: Arc<KeywordDict>) -> Arc<Self> {
        let mut priorities = std::collections::HashMap::new();
        for verb in ["stop", "status", "move", "speed", "home"] {
            priorities.insert(verb.to_string(), 1);
        }
        let queue = CommandQueue::new(
            priorities,
            1,
            vec![KillRule::new("stop", "move", KillAction::KillRunning)],
        );
        Arc::new(Self {
            base: Arc::new(DeviceBase::new("scale", transport, queue)),
            keywords,
            status: Mutex::new(ScaleStatus::default()),
            ring: Mutex::new(RingStateInfo {
                state: RingState::NotHomed,
                curr_iter: 0,
                total_time: None,
                started: Instant::now(),
            }),
        })
    }

    /// Connects the transport, starts the reader task, then enqueues
    /// `init()`'s `stop` / `speed` / `status` sequence against a fresh
    /// internally-generated operator command.
    pub async fn connect(self: &Arc<Self>) -> Result<(), crate::core::transport::TransportError> {
        let handler: Arc<dyn ReplyHandler> = self.clone();
        self.base.connect(handler).await?;
        let op = crate::core::operator_command::OperatorCommand::new_internal(
            "init",
            crate::core::operator_command::OperatorCommandId(0),
        );
        self.init(op).await;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), crate::core::transport::TransportError> {
        self.base.disconnect().await
    }

    pub async fn is_moving(&self) -> bool {
        matches!(
            self.base.current_running().await.as_ref().map(|c| c.verb.as_str()),
            Some("move") | Some("home")
        )
    }

    /// Hardcoded true: no absolute encoder is present on the du Pont
    /// scaling ring (spec.md 9, Open Question resolved per spec.md text).
    pub fn is_homed(&self) -> bool {
        true
    }

    async fn set_ring_state(&self, state: RingState, curr_iter: u32, total_time: Option<Duration>) {
        let mut ring = self.ring.lock().await;
        ring.state = state;
        ring.curr_iter = curr_iter;
        ring.total_time = total_time;
        ring.started = Instant::now();
        let display = ring.display();
        drop(ring);
        self.keywords.update("ThreadRingState", display, None, None);
    }

    pub async fn ring_state(&self) -> RingState {
        self.ring.lock().await.state
    }

    async fn motor_pos(&self) -> f64 {
        self.status.lock().await.thread_ring.actual_position.unwrap_or(ZERO_POINT)
    }

    /// Current thread-ring position in mm, for handlers that need to
    /// convert the existing scale factor or compute a paired M2 focus
    /// offset (spec.md 4.7, "set scaleFactor").
    pub async fn current_pos_mm(&self) -> f64 {
        self.motor_pos().await
    }

    async fn motor_speed(&self) -> f64 {
        let speed = self.status.lock().await.thread_ring.drive_speed;
        match speed {
            Some(v) if v.is_finite() && v > 0.0 => v,
            _ => NOM_SPEED,
        }
    }

    /// Enqueue `stop`, `speed <nominal>`, `status` (spec.md 4.3: init
    /// sequence run once after connect).
    pub async fn init(self: &Arc<Self>, op: OperatorCommandHandle) {
        let stop = DeviceCommand::new("stop", "stop", Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        let speed = DeviceCommand::new(
            "speed",
            format!("speed {NOM_SPEED:.6}"),
            Some(DEFAULT_COMMAND_TIMEOUT),
            Some(op.id),
        );
        let status = DeviceCommand::new("status", "status", Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        op.link(stop.clone());
        op.link(speed.clone());
        op.link(status.clone());
        self.base.enqueue(stop).await;
        self.base.enqueue(speed).await;
        {
            let mut status_parser = self.status.lock().await;
            status_parser.flush();
        }
        self.base.enqueue(status).await;
    }

    /// If a move or home is in progress, answer from the cached status
    /// instead of queueing a new `status` command (spec.md 4.3).
    pub async fn get_status(self: &Arc<Self>, op: OperatorCommandHandle) {
        if self.is_moving().await {
            self.write_status_to_users(Some(&op)).await;
            return;
        }
        {
            let mut status = self.status.lock().await;
            status.flush();
        }
        let cmd = DeviceCommand::new("status", "status", Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        op.link(cmd.clone());
        self.base.enqueue(cmd).await;
    }

    pub async fn stop(self: &Arc<Self>, op: OperatorCommandHandle) {
        self.set_ring_state(RingState::Done, 0, None).await;
        let stop = DeviceCommand::new("stop", "stop", Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        let status = DeviceCommand::new("status", "status", Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        op.link(stop.clone());
        op.link(status.clone());
        self.base.enqueue(stop).await;
        {
            let mut status_parser = self.status.lock().await;
            status_parser.flush();
        }
        self.base.enqueue(status).await;
    }

    pub async fn set_speed(self: &Arc<Self>, value_mm_per_sec: f64, op: OperatorCommandHandle) {
        if self.is_moving().await {
            op.fail("Cannot set speed, device is busy moving");
            return;
        }
        if value_mm_per_sec > MAX_SPEED {
            op.fail(format!("Max Speed Exceeded: {value_mm_per_sec:.4} > {MAX_SPEED:.4}"));
            return;
        }
        let speed = DeviceCommand::new(
            "speed",
            format!("speed {value_mm_per_sec:.6}"),
            Some(DEFAULT_COMMAND_TIMEOUT),
            Some(op.id),
        );
        let status = DeviceCommand::new("status", "status", Some(DEFAULT_COMMAND_TIMEOUT), Some(op.id));
        op.link(speed.clone());
        op.link(status.clone());
        self.base.enqueue(speed).await;
        self.base.enqueue(status).await;
    }

    pub async fn home(self: &Arc<Self>, op: OperatorCommandHandle) {
        if self.is_moving().await {
            op.fail("Cannot home, device is busy moving");
            return;
        }
        let current = self.motor_pos().await;
        let speed = self.motor_speed().await;
        let move_time = Duration::from_secs_f64((current.abs() / speed).max(0.0));
        let timeout = move_time + Duration::from_secs(60);
        let cmd = DeviceCommand::new("home", "home", Some(timeout), Some(op.id));
        op.link(cmd.clone());
        self.base.enqueue(cmd.clone()).await;
        self.set_ring_state(RingState::Homing, 0, Some(move_time)).await;

        let dev = self.clone();
        tokio::spawn(async move {
            let terminal = cmd.wait_terminal().await;
            if terminal == CommandState::Done {
                dev.set_ring_state(RingState::Done, 0, None).await;
            } else {
                dev.set_ring_state(RingState::Failed, 0, None).await;
            }
        });
    }

    pub async fn move_to(self: &Arc<Self>, pos_mm: f64, op: OperatorCommandHandle) {
        if !self.is_homed() {
            op.fail("Scaling ring not homed");
            return;
        }
        if self.is_moving().await {
            op.fail("Cannot move, device is busy moving");
            return;
        }
        let (lo, hi) = MOVE_RANGE;
        if !(lo..=hi).contains(&pos_mm) {
            op.fail(format!("Move position {pos_mm:.6} not in range [{lo:.4}, {hi:.4}]"));
            return;
        }
        let current = self.motor_pos().await;
        let speed = self.motor_speed().await;
        let move_time = Duration::from_secs_f64(((pos_mm - current).abs() / speed).max(0.0));
        let timeout = move_time + Duration::from_secs(60);
        let cmd = DeviceCommand::new("move", format!("move {pos_mm:.6}"), Some(timeout), Some(op.id));
        op.link(cmd.clone());
        self.keywords.update("DesThreadRingPos", format!("{pos_mm:.4}"), Some(&op), None);
        self.base.enqueue(cmd.clone()).await;
        self.set_ring_state(RingState::Moving, 1, Some(move_time)).await;

        let dev = self.clone();
        tokio::spawn(async move {
            let terminal = cmd.wait_terminal().await;
            if terminal == CommandState::Done {
                dev.set_ring_state(RingState::Done, 1, None).await;
            } else if terminal == CommandState::Failed {
                dev.set_ring_state(RingState::Failed, 1, None).await;
            }
            // Cancelled (e.g. by a `stop`) already set ring state via stop().
        });
    }

    /// Emit the keyword set an operator sees from a completed status read
    /// (or, while busy, the best-effort cached values) -- the scale-device
    /// subset of spec.md 6's outbound keyword list.
    pub async fn write_status_to_users(&self, op: Option<&OperatorCommandHandle>) {
        let status = self.status.lock().await;
        let pos = status.thread_ring.actual_position.unwrap_or(f64::NAN);
        let des = status.thread_ring.target_position.unwrap_or(f64::NAN);
        let speed = status.thread_ring.drive_speed.unwrap_or(f64::NAN);
        self.keywords.update("ThreadRingMotorPos", format!("{pos:.4}"), op, None);
        // No absolute encoder is present (spec.md 9); the encoder-position
        // keyword is kept for downstream compatibility and mirrors the
        // motor position verbatim.
        self.keywords.update("ThreadRingEncPos", format!("{pos:.4}"), op, None);
        self.keywords.update("DesThreadRingPos", format!("{des:.4}"), op, None);
        self.keywords.update("ThreadRingSpeed", format!("{speed:.4}"), op, None);
        self.keywords.update("ThreadRingMaxSpeed", format!("{MAX_SPEED:.4}"), op, None);
        self.keywords.update("ScaleZeroPos", format!("{ZERO_POINT:.4}"), op, None);
        self.keywords
            .update("ScaleEncHomed", self.is_homed().to_string(), op, None);
        self.keywords
            .update("ScaleFac", format!("{:.6}", mm2scale(pos)), op, None);
        let (lo, hi) = MOVE_RANGE;
        self.keywords.update(
            "ScaleFacRange",
            format!("{:.6}, {:.6}", mm2scale(hi), mm2scale(lo)),
            op,
            None,
        );
        self.keywords
            .update("instrumentNum", status.cart_id().to_string(), op, None);
        self.keywords
            .update("CartLocked", status.locked().to_string(), op, None);
        self.keywords
            .update("CartLoaded", status.loaded().to_string(), op, None);
        let gang = match (status.gang_connector_sw, status.gang_stowed_sw) {
            (Some(connector), Some(stowed)) => format!("{connector}, {stowed}"),
            _ => "NaN, NaN".to_string(),
        };
        self.keywords.update("apogeeGang", gang, op, None);
        let faults = status.thread_ring.hardware_fault.unwrap_or(0) != 0
            || status.thread_ring.instruction_fault.unwrap_or(0) != 0
            || status.lock_ring.hardware_fault.unwrap_or(0) != 0
            || status.lock_ring.instruction_fault.unwrap_or(0) != 0
            || status.winch.hardware_fault.unwrap_or(0) != 0
            || status.winch.instruction_fault.unwrap_or(0) != 0;
        if faults {
            self.keywords.update(
                "ScaleRingFaults",
                "fault bit set",
                op,
                Some(crate::core::keywords::Severity::Warn),
            );
        }
    }

    /// Spawn the forever-running poll loop (spec.md 4.3: 4s idle / 1s
    /// moving-or-homing cadence). Intended to be called once after the
    /// device has connected.
    pub fn start_polling(self: &Arc<Self>) {
        let dev = self.clone();
        tokio::spawn(async move {
            loop {
                let op = crate::core::operator_command::OperatorCommand::new_internal(
                    "status",
                    crate::core::operator_command::OperatorCommandId(0),
                );
                dev.get_status(op.clone()).await;
                op.await_links().await;
                if op.state() == crate::core::operator_command::OperatorState::Done {
                    dev.write_status_to_users(None).await;
                }
                let interval = if dev.is_moving().await || dev.ring_state().await == RingState::Homing {
                    POLL_ACTIVE
                } else {
                    POLL_IDLE
                };
                tokio::time::sleep(interval).await;
            }
        });
    }
}

#[async_trait]
impl ReplyHandler for ScaleDevice {
    /// `init()` needs `Arc<Self>` to enqueue through `DeviceBase`, so
    /// `ScaleDevice::connect` drives it directly rather than through this
    /// hook (see `connect` above).
    async fn on_connected(&self) {}

    async fn handle_reply(&self, line: String) {
        let trimmed = line.trim().to_string();
        if trimmed.is_empty() {
            return;
        }
        let Some(current) = self.base.current_running().await else {
            tracing::debug!(target: "scale", "unsolicited reply dropped: {trimmed}");
            return;
        };
        if current.state() != CommandState::Running {
            return;
        }
        let lower = trimmed.to_lowercase();

        if lower == "ok" {
            if current.verb == "status" {
                let complete = self.status.lock().await.is_complete();
                if !complete {
                    let mut status = self.status.lock().await;
                    status.n_iter += 1;
                    if status.n_iter > STATUS_MAX_RETRY {
                        drop(status);
                        current.complete(CommandState::Failed, Some("status mangled".into()));
                        self.base.advance().await;
                    } else {
                        drop(status);
                        let _ = self.base.transport.write_line("status").await;
                    }
                    return;
                }
            }
            current.complete(CommandState::Done, None);
            self.base.advance().await;
            return;
        }

        if lower == current.command_text.to_lowercase() {
            return; // echo
        }

        if lower.contains("error") {
            current.complete(CommandState::Failed, Some(trimmed));
            self.base.advance().await;
            return;
        }

        if current.verb == "status" {
            self.status.lock().await.parse_line(&trimmed);
        } else if current.verb == "move" {
            if let Some(idx) = lower.find("actual_position") {
                if let Ok(val) = lower[idx + "actual_position".len()..].trim().parse::<f64>() {
                    self.status.lock().await.thread_ring.actual_position = Some(val);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_round_trip() {
        let pos = 23.456;
        let scale = mm2scale(pos);
        assert!((scale2mm(scale) - pos).abs() < 1e-9);
    }

    /// spec.md 8: `mm2scale(scale2mm(s)) = s` to within 1e-12 for every
    /// scale factor in the valid range.
    #[test]
    fn scale_to_mm_round_trip_holds_over_valid_scale_range() {
        for s in [1.0 / 1.02, 0.995, 1.0, 1.005, 1.02] {
            let pos = scale2mm(s);
            assert!((mm2scale(pos) - s).abs() < 1e-12, "s={s}: got {}", mm2scale(pos));
        }
    }

    #[test]
    fn scale_mult_stable_matches_naive_within_tolerance() {
        for pos in [0.0, 18.0, 20.0, 23.456, 40.0] {
            for mult in [0.98, 0.995, 1.0, 1.005, 1.02] {
                let naive = scale_mult2mm(pos, mult);
                let stable = scale_mult2mm_stable(pos, mult);
                assert!(
                    (naive - stable).abs() <= 1e-9,
                    "pos={pos} mult={mult}: {naive} vs {stable}"
                );
            }
        }
    }

    #[test]
    fn status_parses_reference_status_block() {
        let mut status = ScaleStatus::default();
        for line in [
            "THREAD_RING_AXIS:",
            "__ACTUAL_POSITION 0.20000055",
            "__TARGET_POSITION 0.20000000",
            "__DRIVE_SPEED 0.10000000",
            "__MOVE_RANGE 0.0-40.0",
            "__HARDWARE_FAULT 0",
            "__INSTRUCTION_FAULT 0",
            "__OVERTRAVEL OFF",
            "LOCK_RING_AXIS:",
            "__ACTUAL_POSITION 18.0007000",
            "__TARGET_POSITION 18.0000000",
            "__OPEN_SETPOINT: 150.000000",
            "__MOVE_RANGE 0.0-150.0",
            "__HARDWARE_FAULT 0",
            "__INSTRUCTION_FAULT 0",
            "WINCH_AXIS:",
            "__ACTUAL_POSITION -1840.48157",
            "__TARGET_POSITION 1652.00000",
            "__UP_SETPOINT: 23.0000000",
            "__MOVE_RANGE 0.0-4000.0",
            "__HARDWARE_FAULT 0",
            "__INSTRUCTION_FAULT 0",
            "__CARTRIDGE_ID 23",
            "__ID_SW: 0 1 2 3 4 5 6 7 8",
            "         1 0 1 1 0 1 1 0 1",
            "__POS_SW: 1 2 3",
            "          1 1 1",
            "GANG CONNECTOR SW ON",
            "GANG STOWED SW OFF",
        ] {
            status.parse_line(line);
        }
        assert!(status.is_complete());
        assert_eq!(status.thread_ring.actual_position, Some(0.20000055));
        assert_eq!(status.pos_sw, Some([1, 1, 1]));
        assert!(status.loaded());
        assert!(status.locked());
    }

    #[test]
    fn cart_id_is_unknown_when_triplets_disagree() {
        let mut status = ScaleStatus::default();
        status.id_sw = Some([1, 0, 0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(status.cart_id(), -1);
    }

    #[test]
    fn cart_id_takes_majority_vote_and_offsets_by_twenty() {
        let mut status = ScaleStatus::default();
        // 101 = 5 twice, 100 = 4 once -> majority is 5 -> cart id 25.
        status.id_sw = Some([1, 0, 1, 1, 0, 1, 1, 0, 0]);
        assert_eq!(status.cart_id(), 25);
    }
}
