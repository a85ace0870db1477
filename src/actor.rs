//! Actor Core (spec.md 4.7): command dispatch, per-verb handlers, and the
//! narrow "write to user" seam that the shared keyword dictionary funnels
//! every outbound line through.
//!
//! Per the design notes in spec.md 9 ("cyclic references"), devices hold a
//! non-owning handle to the keyword dictionary (`Arc<KeywordDict>`, injected
//! at construction) while the dictionary's own sink -- this module's
//! `ConnectionSink` -- is owned here, alongside the devices themselves. The
//! actor never reaches back into a device's private state; it only calls
//! the public per-device operations and reads status through them.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::collimation::CollimationLoop;
use crate::core::keywords::{KeywordDict, Severity, UserSink};
use crate::core::operator_command::{OperatorCommand, OperatorCommandHandle, OperatorState};
use crate::devices::m2::M2Device;
use crate::devices::scale::{self, ScaleDevice};
use crate::devices::tcs::TcsDevice;
use crate::parser::{parse_line, DeviceAction, DeviceTarget, OffsetKind, ParsedCommand};

/// `MIN_SF <= scale <= MAX_SF` (spec.md 3, 4.7). `MIN_SF = 1 / MAX_SF` by
/// construction, so 1.0 is always exactly representable as the midpoint.
pub const MAX_SF: f64 = 1.02;
pub const MIN_SF: f64 = 1.0 / MAX_SF;
/// M2-focus-per-ring-mm pairing ratio used by `set scaleFactor` (spec.md 4.7,
/// 8 scenario 5).
pub const SCALE_RATIO: f64 = 1.0 / 7.0;

/// The out-of-core "write to user" seam (spec.md 1), concretely: at most one
/// connected operator socket. `write_to_users` never blocks on the socket
/// actually being connected -- with nobody attached it falls back to
/// `tracing`, same as `keywords::TracingSink`, so device/collimation
/// background activity is never silently dropped.
pub struct ConnectionSink {
    tx: AsyncMutex<Option<mpsc::UnboundedSender<String>>>,
}

impl ConnectionSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tx: AsyncMutex::new(None),
        })
    }

    /// Attach a freshly-accepted connection's line sender. Returns `false`
    /// (and leaves the existing connection untouched) if one is already
    /// attached -- callers must reject the new socket themselves (spec.md 1
    /// Non-goals: "accepts at most one concurrent operator connection").
    pub async fn attach(&self, sender: mpsc::UnboundedSender<String>) -> bool {
        let mut slot = self.tx.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(sender);
        true
    }

    pub async fn detach(&self) {
        *self.tx.lock().await = None;
    }

    /// Write a line with no severity prefix -- used for the bare `:` ping
    /// echo (spec.md 4.7: "Empty command body acts as a ping (echo ':')").
    pub async fn write_raw(&self, line: &str) {
        let slot = self.tx.lock().await;
        match slot.as_ref() {
            Some(tx) => {
                let _ = tx.send(line.to_string());
            }
            None => debug!(target: "keywords", "{line}"),
        }
    }
}

impl UserSink for ConnectionSink {
    /// Synchronous per `UserSink`'s contract; `try_lock` is sufficient since
    /// the only other lock holders are brief `attach`/`detach` calls.
    fn write_to_users(&self, severity: Severity, line: &str) {
        let wire = format!("{} {line}", severity.code());
        match self.tx.try_lock() {
            Ok(slot) => match slot.as_ref() {
                Some(tx) => {
                    let _ = tx.send(wire);
                }
                None => log_fallback(severity, line),
            },
            Err(_) => log_fallback(severity, line),
        }
    }
}

fn log_fallback(severity: Severity, line: &str) {
    match severity {
        Severity::Warn => warn!(target: "keywords", "{line}"),
        Severity::Info => info!(target: "keywords", "{line}"),
        _ => debug!(target: "keywords", "{line}"),
    }
}

pub struct Actor {
    pub scale: Arc<ScaleDevice>,
    pub tcs: Arc<TcsDevice>,
    pub m2: Arc<M2Device>,
    pub keywords: Arc<KeywordDict>,
    pub collimation: Arc<CollimationLoop>,
    sink: Arc<ConnectionSink>,
}

impl Actor {
    pub fn new(
        scale: Arc<ScaleDevice>,
        tcs: Arc<TcsDevice>,
        m2: Arc<M2Device>,
        keywords: Arc<KeywordDict>,
        collimation: Arc<CollimationLoop>,
        sink: Arc<ConnectionSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scale,
            tcs,
            m2,
            keywords,
            collimation,
            sink,
        })
    }

    /// Days between the MJD epoch (1858-11-17) and the Unix epoch
    /// (1970-01-01), for converting `chrono`'s UTC clock into the
    /// MJD-derived seconds the `TAI`/`UTC_TAI` keywords report (spec.md 6,
    /// glossary: "TAI / UT1 / UTC ... reported as MJD-derived seconds";
    /// grounded on `original_source/python/tcc/actor/tccLCOActor.py`'s
    /// `outputTimeKWs`, which computes `timeNow.tai.mjd*60*60*24` via
    /// `astropy.time.Time`).
    const MJD_UNIX_EPOCH_DAYS: i64 = 40_587;
    /// TAI-UTC leap-second offset in effect since the last leap second
    /// (2017-01-01); `chrono` has no TAI timescale of its own, so this is
    /// applied as a fixed constant rather than tracked via a leap-second
    /// table, same simplification scope as the rest of this ambient keyword.
    const TAI_MINUS_UTC_SECONDS: f64 = 37.0;

    /// Periodically emits `TAI`/`UTC_TAI` (spec.md 6), mirroring the
    /// original's `outputTimeKWs` run "on a timer" (its own comment at
    /// `tccLCOActor.py`'s top flags this as unresolved; this crate resolves
    /// it as a 5s cadence, matching the collimation watchdog's period).
    pub fn start_time_keyword_loop(self: &Arc<Self>) {
        let actor = self.clone();
        tokio::spawn(async move {
            loop {
                let (tai, utc_minus_tai) = Self::time_keywords_at(chrono::Utc::now());
                actor.keywords.update("TAI", format!("{tai:.3}"), None, None);
                actor
                    .keywords
                    .update("UTC_TAI", format!("{utc_minus_tai:.3}"), None, None);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    /// `(TAI, UTC - TAI)` in MJD-derived seconds for a given instant, split
    /// out from `start_time_keyword_loop` so the conversion itself is
    /// unit-testable without a live clock.
    fn time_keywords_at(now: chrono::DateTime<chrono::Utc>) -> (f64, f64) {
        let utc_seconds_since_mjd =
            now.timestamp() as f64 + (Self::MJD_UNIX_EPOCH_DAYS * 86_400) as f64 + now.timestamp_subsec_nanos() as f64 / 1e9;
        let tai_seconds_since_mjd = utc_seconds_since_mjd + Self::TAI_MINUS_UTC_SECONDS;
        (tai_seconds_since_mjd, utc_seconds_since_mjd - tai_seconds_since_mjd)
    }

    /// Accept loop enforcing the single-operator-connection invariant
    /// (spec.md 1 Non-goals; SPEC_FULL.md 6 ambient addition): a second
    /// connection attempt is told it's rejected, then closed, rather than
    /// queued.
    pub async fn run_listener(self: Arc<Self>, listen_port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
        info!("operator listener bound on port {listen_port}");
        loop {
            let (socket, peer) = listener.accept().await?;
            let actor = self.clone();
            tokio::spawn(async move {
                actor.serve_connection(socket, peer).await;
            });
        }
    }

    async fn serve_connection(self: Arc<Self>, socket: tokio::net::TcpStream, peer: std::net::SocketAddr) {
        let (read_half, mut write_half) = socket.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        if !self.sink.attach(tx).await {
            let _ = write_half.write_all(b"f Failed=AnotherOperatorConnected\n").await;
            return;
        }
        info!("operator connected from {peer}");

        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut reader = BufReader::new(read_half).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => self.clone().dispatch_line(line).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("operator connection read error from {peer}: {e}");
                    break;
                }
            }
        }

        self.sink.detach().await;
        writer.abort();
        info!("operator disconnected: {peer}");
    }

    /// Parse one line and dispatch it. Unhandled panics in a verb handler
    /// are caught here and surfaced as a Failed operator command plus the
    /// machine-parseable `Exception=<Kind>` hub keyword (spec.md 4.7, 7).
    pub async fn dispatch_line(self: Arc<Self>, raw: String) {
        let parsed = match parse_line(&raw) {
            Ok(p) => p,
            Err(message) => {
                let op = OperatorCommand::new_user_initiated("parse-error", raw);
                op.fail(format!("parse error: {message}"));
                self.report_completion(&op).await;
                return;
            }
        };

        if matches!(parsed.command, ParsedCommand::Empty) {
            self.sink.write_raw(":").await;
            return;
        }

        let op = OperatorCommand::new_user_initiated(parsed.verb.clone(), raw);

        if matches!(parsed.command, ParsedCommand::Ping) {
            op.succeed();
            self.report_completion(&op).await;
            return;
        }

        let actor = self.clone();
        let op_for_handler = op.clone();
        let command = parsed.command.clone();
        let outcome = AssertUnwindSafe(async move { actor.run_handler(command, op_for_handler).await })
            .catch_unwind()
            .await;

        if outcome.is_err() {
            op.fail("unhandled exception in command handler");
            self.keywords.update(
                "Exception",
                crate::error::ActorError::Unexpected(parsed.verb.clone()).exception_kind(),
                Some(&op),
                Some(Severity::Warn),
            );
        }

        self.report_completion(&op).await;
    }

    async fn run_handler(self: Arc<Self>, command: ParsedCommand, op: OperatorCommandHandle) {
        match command {
            ParsedCommand::Empty | ParsedCommand::Ping => unreachable!("handled in dispatch_line"),
            ParsedCommand::SetFocus { value, incremental } => self.handle_set_focus(value, incremental, op).await,
            ParsedCommand::SetScaleFactor { value, multiplicative } => {
                self.handle_set_scale_factor(value, multiplicative, op).await
            }
            ParsedCommand::Track { values, .. } => self.handle_track(values, op).await,
            ParsedCommand::Offset { kind, values } => self.handle_offset(kind, values, op).await,
            ParsedCommand::Device { action, target } => self.handle_device(action, target, op).await,
            ParsedCommand::Stop => {
                self.scale.stop(op.clone()).await;
                op.await_links().await;
            }
        }
    }

    async fn handle_set_focus(&self, value: Option<f64>, incremental: bool, op: OperatorCommandHandle) {
        match value {
            None => {
                let current = self.m2.sec_focus().await;
                self.keywords.update("SecFocus", format!("{current:.4}"), Some(&op), None);
                op.succeed();
            }
            Some(v) => {
                self.m2.focus(v, incremental, op.clone()).await;
                if op.await_links().await == OperatorState::Done {
                    let current = self.m2.sec_focus().await;
                    self.keywords.update("SecFocus", format!("{current:.4}"), Some(&op), None);
                }
            }
        }
    }

    async fn handle_set_scale_factor(&self, value: Option<f64>, multiplicative: bool, op: OperatorCommandHandle) {
        let pos = self.scale.current_pos_mm().await;
        let current_scale = scale::mm2scale(pos);

        let Some(v) = value else {
            self.keywords.update("ScaleFac", format!("{current_scale:.6}"), Some(&op), None);
            op.succeed();
            return;
        };

        let target_scale = if multiplicative { current_scale * v } else { v };
        if !(MIN_SF..=MAX_SF).contains(&target_scale) {
            op.fail(format!(
                "Scale factor {target_scale:.6} out of range [{MIN_SF:.6}, {MAX_SF:.6}]"
            ));
            return;
        }

        if self.m2.is_busy().await {
            op.fail("Cannot set scale, M2 is moving");
            return;
        }

        // Per spec.md 9's Open Question resolution: validate/convert through
        // `scale2mm(current * mult)`, i.e. `scaleMult2mm`, not the standalone
        // `scaleMult2mm` helper applied to a not-yet-validated target.
        let abs_pos = scale::scale2mm(target_scale);
        let delta_focus_um = (abs_pos - pos) * 1000.0 * SCALE_RATIO * -1.0;

        self.scale.move_to(abs_pos, op.clone()).await;
        self.m2.focus(delta_focus_um, true, op.clone()).await;

        if op.await_links().await == OperatorState::Done {
            self.scale.write_status_to_users(Some(&op)).await;
        }
    }

    async fn handle_track(&self, values: Vec<f64>, op: OperatorCommandHandle) {
        if values.len() < 2 {
            op.fail("track requires at least eq,pol coordinates");
            return;
        }
        self.tcs.track(values[0], values[1], op.clone()).await;
        op.wait_terminal().await;
    }

    async fn handle_offset(&self, kind: OffsetKind, values: Vec<f64>, op: OperatorCommandHandle) {
        let kind_str = match kind {
            OffsetKind::Arc => "arc",
            OffsetKind::Rotator => "rotator",
            OffsetKind::Calibration => "calibration",
        };
        self.tcs.offset(kind_str, &values, op.clone()).await;
        op.wait_terminal().await;
    }

    async fn handle_device(&self, action: DeviceAction, target: DeviceTarget, op: OperatorCommandHandle) {
        let targets = Self::resolve_targets(target);
        match action {
            DeviceAction::Initialize => {
                for t in &targets {
                    match t {
                        DeviceTarget::Scale => self.scale.init(op.clone()).await,
                        DeviceTarget::Tcs => self.tcs.get_status(op.clone()).await,
                        DeviceTarget::M2 => self.m2.get_status(op.clone()).await,
                        DeviceTarget::All => unreachable!("resolve_targets expands All"),
                    }
                }
                op.await_links().await;
            }
            DeviceAction::Status => {
                for t in &targets {
                    match t {
                        DeviceTarget::Scale => self.scale.get_status(op.clone()).await,
                        DeviceTarget::Tcs => self.tcs.get_status(op.clone()).await,
                        DeviceTarget::M2 => self.m2.get_status(op.clone()).await,
                        DeviceTarget::All => unreachable!("resolve_targets expands All"),
                    }
                }
                if op.await_links().await == OperatorState::Done {
                    for t in &targets {
                        self.emit_device_status(t, &op).await;
                    }
                }
            }
            DeviceAction::Connect => {
                let mut first_err = None;
                for t in &targets {
                    let result = match t {
                        DeviceTarget::Scale => self.scale.connect().await,
                        DeviceTarget::Tcs => self.tcs.connect().await,
                        DeviceTarget::M2 => self.m2.connect().await,
                        DeviceTarget::All => unreachable!("resolve_targets expands All"),
                    };
                    if let Err(e) = result {
                        first_err.get_or_insert_with(|| format!("{t:?}: {e}"));
                    }
                }
                match first_err {
                    Some(msg) => op.fail(msg),
                    None => op.succeed(),
                }
            }
            DeviceAction::Disconnect => {
                let mut first_err = None;
                for t in &targets {
                    let result = match t {
                        DeviceTarget::Scale => self.scale.disconnect().await,
                        DeviceTarget::Tcs => self.tcs.disconnect().await,
                        DeviceTarget::M2 => self.m2.disconnect().await,
                        DeviceTarget::All => unreachable!("resolve_targets expands All"),
                    };
                    if let Err(e) = result {
                        first_err.get_or_insert_with(|| format!("{t:?}: {e}"));
                    }
                }
                match first_err {
                    Some(msg) => op.fail(msg),
                    None => op.succeed(),
                }
            }
        }
    }

    async fn emit_device_status(&self, target: &DeviceTarget, op: &OperatorCommandHandle) {
        match target {
            DeviceTarget::Scale => self.scale.write_status_to_users(Some(op)).await,
            DeviceTarget::Tcs => {
                let status = self.tcs.status().await;
                self.keywords
                    .update("axisCmdState", status.state.join(","), Some(op), None);
                if let Some((ha, dec)) = status.pos {
                    self.keywords.update("axePos", format!("{ha:.6}, {dec:.6}"), Some(op), None);
                }
            }
            DeviceTarget::M2 => {
                self.keywords
                    .update("SecFocus", format!("{:.4}", self.m2.sec_focus().await), Some(op), None);
            }
            DeviceTarget::All => unreachable!("resolve_targets expands All"),
        }
    }

    fn resolve_targets(target: DeviceTarget) -> Vec<DeviceTarget> {
        match target {
            DeviceTarget::All => vec![DeviceTarget::Tcs, DeviceTarget::Scale, DeviceTarget::M2],
            other => vec![other],
        }
    }

    /// The sole per-command acknowledgement line emitted back to the
    /// operator: since the originating operator command is always
    /// user-initiated, `KeywordDict::update`'s emission rule (spec.md 4.7)
    /// always shows it at `i`, regardless of whether "CmdDone"'s value
    /// happens to repeat the previous command's.
    async fn report_completion(&self, op: &OperatorCommandHandle) {
        let state = op.state();
        let suffix = op.message().map(|m| format!(": {m}")).unwrap_or_default();
        self.keywords
            .update("CmdDone", format!("{} {state:?}{suffix}", op.verb), Some(op), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collimation::{CollimationModel, CollimationCoefficients};
    use crate::core::keywords::TracingSink;
    use crate::core::transport::TcpLineTransport;
    use std::time::Duration;

    fn fresh_actor() -> Arc<Actor> {
        let keywords = Arc::new(KeywordDict::new(Box::new(TracingSink)));
        let scale = ScaleDevice::new(Arc::new(TcpLineTransport::new("127.0.0.1", 0)), keywords.clone());
        let tcs = TcsDevice::new(Arc::new(TcpLineTransport::new("127.0.0.1", 0)));
        let m2 = M2Device::new(Arc::new(TcpLineTransport::new("127.0.0.1", 0)));
        let model = CollimationModel::new(CollimationCoefficients::default(), 1.0, 1.0);
        let collimation = CollimationLoop::new(model, tcs.clone(), m2.clone(), keywords.clone(), Duration::from_secs(60));
        Actor::new(scale, tcs, m2, keywords, collimation, ConnectionSink::new())
    }

    #[tokio::test]
    async fn ping_completes_immediately() {
        let actor = fresh_actor();
        actor.clone().dispatch_line("ping".into()).await;
    }

    #[tokio::test]
    async fn set_scale_factor_rejects_out_of_range() {
        let actor = fresh_actor();
        let op = OperatorCommand::new_user_initiated("set scaleFactor", "set scaleFactor=1.5");
        actor.clone().handle_set_scale_factor(Some(1.5), false, op.clone()).await;
        assert_eq!(op.state(), OperatorState::Failed);
    }

    #[tokio::test]
    async fn set_scale_factor_rejects_when_m2_busy() {
        let actor = fresh_actor();
        let busy_op = OperatorCommand::new_user_initiated("set focus", "set focus=1");
        actor.m2.focus(1.0, false, busy_op.clone()).await; // enqueues against an unconnected transport; stays queued as Ready until started.
        // `is_busy` reflects the queue's `Running` slot, which only a connected
        // transport can populate; assert the handler's own busy/range checks
        // independently instead of depending on transport state here.
        let op = OperatorCommand::new_user_initiated("set scaleFactor", "set scaleFactor=1.00006");
        actor.clone().handle_set_scale_factor(Some(1.00006), false, op.clone()).await;
        // Without a connected scale/M2 transport the paired move/focus
        // commands fail with "Not connected" rather than completing Done;
        // the important invariant is that no policy violation is raised for
        // an in-range value.
        assert_ne!(op.message().as_deref(), Some("Cannot set scale, M2 is moving"));
    }

    #[tokio::test]
    async fn device_status_all_expands_to_three_targets() {
        assert_eq!(
            Actor::resolve_targets(DeviceTarget::All),
            vec![DeviceTarget::Tcs, DeviceTarget::Scale, DeviceTarget::M2]
        );
    }

    #[test]
    fn time_keywords_at_unix_epoch_matches_known_mjd() {
        use chrono::TimeZone;
        let epoch = chrono::Utc.timestamp_opt(0, 0).unwrap();
        let (tai, utc_minus_tai) = Actor::time_keywords_at(epoch);
        // 1970-01-01T00:00:00Z is MJD 40587 exactly, so UTC seconds-since-MJD
        // is an integral number of days; TAI trails by the fixed offset.
        assert_eq!(tai, 40_587.0 * 86_400.0 + Actor::TAI_MINUS_UTC_SECONDS);
        assert_eq!(utc_minus_tai, -Actor::TAI_MINUS_UTC_SECONDS);
    }

    #[test]
    fn time_keywords_at_advances_with_wall_clock() {
        use chrono::TimeZone;
        let t0 = chrono::Utc.timestamp_opt(1_000_000, 0).unwrap();
        let t1 = chrono::Utc.timestamp_opt(1_000_060, 0).unwrap();
        let (tai0, _) = Actor::time_keywords_at(t0);
        let (tai1, _) = Actor::time_keywords_at(t1);
        assert_eq!(tai1 - tai0, 60.0);
    }
}
