//! End-to-end scenario tests (spec.md 8) driving the actor and the three
//! devices against mock TCP listeners standing in for the real TCS, scaling
//! ring, and M2 controllers, in the style of the teacher's
//! `services/comsrv/tests` integration suite (mock socket servers rather than
//! a full spawned process, since this crate's devices are plain TCP peers).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use dupont_tcc::actor::{Actor, ConnectionSink};
use dupont_tcc::collimation::{CollimationCoefficients, CollimationLoop, CollimationModel};
use dupont_tcc::core::keywords::KeywordDict;
use dupont_tcc::core::operator_command::{OperatorCommand, OperatorState};
use dupont_tcc::core::transport::TcpLineTransport;
use dupont_tcc::devices::m2::M2Device;
use dupont_tcc::devices::scale::{self, RingState, ScaleDevice};
use dupont_tcc::devices::tcs::TcsDevice;

/// A full, parseable scaling-ring status block (spec.md 4.3) with the
/// thread-ring actual/target position fixed at `pos_mm`. Used by every mock
/// scale listener below so `ScaleDevice`'s `init()` and any follow-up
/// `status` request both see a complete, non-munged status.
fn scale_status_block(pos_mm: f64) -> String {
    format!(
        "thread_ring_axis:\n\
         __actual_position {pos_mm:.6}\n\
         __target_position {pos_mm:.6}\n\
         __drive_speed 0.100000\n\
         __move_range 0.0-40.0\n\
         __hardware_fault 0\n\
         __instruction_fault 0\n\
         __overtravel off\n\
         lock_ring_axis:\n\
         __actual_position 18.000700\n\
         __target_position 18.000000\n\
         __open_setpoint: 150.000000\n\
         __move_range 0.0-150.0\n\
         __hardware_fault 0\n\
         __instruction_fault 0\n\
         winch_axis:\n\
         __actual_position -1840.481570\n\
         __target_position 1652.000000\n\
         __up_setpoint: 23.000000\n\
         __move_range 0.0-4000.0\n\
         __hardware_fault 0\n\
         __instruction_fault 0\n\
         __cartridge_id 23\n\
         __id_sw: 0 1 2 3 4 5 6 7 8\n\
         \x20\x20\x20\x20\x20\x20\x20\x201 0 1 1 0 1 1 0 1\n\
         __pos_sw: 1 2 3\n\
         \x20\x20\x20\x20\x20\x20\x20\x201 1 1\n\
         gang connector sw on\n\
         gang stowed sw off\n\
         ok\n"
    )
}

/// Spawn a mock scaling-ring controller: answers `stop`/`speed`/`home`/`move`
/// with a plain `ok`, and `status` with a full status block. `pos_mm` is the
/// thread-ring position every status reply reports — realistic enough for
/// the scenarios below, which don't depend on the controller actually moving
/// the reported position between replies.
async fn spawn_mock_scale(pos_mm: f64) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        serve_scale(socket, pos_mm).await;
    });
    port
}

/// Serves the scaling-ring protocol with one realistic wrinkle: a `move` ack
/// is delayed (simulating an in-progress physical move) and is abandoned --
/// never sent -- if a `stop` arrives first, the way real motion-control
/// hardware abandons a superseded command rather than acking it after the
/// fact. Without this, a mock that acks `move` instantly would race the
/// "move then stop" cancellation scenario (spec.md 8) off the table.
async fn serve_scale(socket: TcpStream, pos_mm: f64) {
    let (read, write) = socket.into_split();
    let write = Arc::new(tokio::sync::Mutex::new(write));
    let mut lines = BufReader::new(read).lines();
    let mut move_cancel: Option<tokio::sync::oneshot::Sender<()>> = None;

    while let Ok(Some(line)) = lines.next_line().await {
        let cmd = line.trim().to_lowercase();

        if cmd == "stop" {
            if let Some(tx) = move_cancel.take() {
                let _ = tx.send(());
            }
            let mut w = write.lock().await;
            if w.write_all(b"ok\n").await.is_err() {
                break;
            }
            continue;
        }

        if cmd.starts_with("move") {
            let (tx, rx) = tokio::sync::oneshot::channel();
            move_cancel = Some(tx);
            let write = write.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(300)) => {
                        let mut w = write.lock().await;
                        let _ = w.write_all(b"ok\n").await;
                    }
                    _ = rx => {}
                }
            });
            continue;
        }

        let reply = if cmd == "status" {
            scale_status_block(pos_mm)
        } else {
            "ok\n".to_string()
        };
        let mut w = write.lock().await;
        if w.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Spawn a mock TCS/M2 controller: answers every command with a plain `ok`,
/// except `status`, which replies with the fixed field block supplied by the
/// caller (each entry already newline-free; a trailing `ok` is appended).
async fn spawn_mock_simple(status_fields: Vec<&'static str>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        serve_simple(socket, status_fields).await;
    });
    port
}

async fn serve_simple(socket: TcpStream, status_fields: Vec<&'static str>) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let cmd = line.trim().to_lowercase();
        let reply = if cmd == "status" {
            let mut block = status_fields.join("\n");
            block.push_str("\nok\n");
            block
        } else {
            "ok\n".to_string()
        };
        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn connected_scale(pos_mm: f64) -> Arc<ScaleDevice> {
    let port = spawn_mock_scale(pos_mm).await;
    let keywords = Arc::new(KeywordDict::new(Box::new(dupont_tcc::core::keywords::TracingSink)));
    let transport = Arc::new(TcpLineTransport::new("127.0.0.1", port));
    let scale = ScaleDevice::new(transport, keywords);
    scale.connect().await.unwrap();
    // Drain the init() triplet (stop/speed/status) before the test issues
    // its own commands, so `current_pos_mm` reflects the mock's status.
    wait_for_pos(&scale, pos_mm).await;
    scale
}

async fn wait_for_pos(scale: &Arc<ScaleDevice>, expect: f64) {
    for _ in 0..200 {
        if (scale.current_pos_mm().await - expect).abs() < 1e-6 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scale status never converged to {expect}");
}

async fn connected_m2() -> Arc<M2Device> {
    let port = spawn_mock_simple(vec![]).await;
    let transport = Arc::new(TcpLineTransport::new("127.0.0.1", port));
    let m2 = M2Device::new(transport);
    m2.connect().await.unwrap();
    m2
}

async fn connected_tcs(status_fields: Vec<&'static str>) -> Arc<TcsDevice> {
    let port = spawn_mock_simple(status_fields).await;
    let transport = Arc::new(TcpLineTransport::new("127.0.0.1", port));
    let tcs = TcsDevice::new(transport);
    tcs.connect().await.unwrap();
    tcs
}

fn fresh_keywords() -> Arc<KeywordDict> {
    Arc::new(KeywordDict::new(Box::new(dupont_tcc::core::keywords::TracingSink)))
}

fn actor_with(scale: Arc<ScaleDevice>, tcs: Arc<TcsDevice>, m2: Arc<M2Device>, keywords: Arc<KeywordDict>) -> Arc<Actor> {
    let model = CollimationModel::new(CollimationCoefficients::default(), 1.0, 1.0);
    let collimation = CollimationLoop::new(model, tcs.clone(), m2.clone(), keywords.clone(), Duration::from_secs(3600));
    Actor::new(scale, tcs, m2, keywords, collimation, ConnectionSink::new())
}

/// Scenario 1: `set focus=10` commands M2 and `secFocus` ends at 10.
#[tokio::test]
async fn scenario_focus_set() {
    let m2 = connected_m2().await;
    let op = OperatorCommand::new_user_initiated("set focus", "set focus=10");
    m2.focus(10.0, false, op.clone()).await;
    assert_eq!(op.await_links().await, OperatorState::Done);
    assert_eq!(m2.sec_focus().await, 10.0);
}

/// Scenario 2: an absolute `set focus=10` followed by an incremental
/// `set focus=10/incremental` accumulates to 20.
#[tokio::test]
async fn scenario_incremental_focus_accumulates() {
    let m2 = connected_m2().await;
    let op1 = OperatorCommand::new_user_initiated("set focus", "set focus=10");
    m2.focus(10.0, false, op1.clone()).await;
    assert_eq!(op1.await_links().await, OperatorState::Done);

    let op2 = OperatorCommand::new_user_initiated("set focus", "set focus=10/incremental");
    m2.focus(10.0, true, op2.clone()).await;
    assert_eq!(op2.await_links().await, OperatorState::Done);
    assert_eq!(m2.sec_focus().await, 20.0);
}

/// Scenario 3: `offset arc 5,5` inverts the sign before hitting the wire.
#[tokio::test]
async fn scenario_arc_offset_inverts_sign() {
    let tcs = connected_tcs(vec![]).await;
    let op = OperatorCommand::new_user_initiated("offset", "offset arc 5,5");
    tcs.offset("arc", &[5.0, 5.0], op.clone()).await;
    assert_eq!(op.await_links().await, OperatorState::Done);
    assert_eq!(op.links()[0].command_text, "offset arc -5.000000 -5.000000");
}

/// Scenario 4: two successive arc offsets each get sign-inverted
/// independently; accumulation on the remote side is the controller's
/// responsibility, not this layer's (spec.md 4.4 treats the TCS protocol as
/// opaque beyond the fields this crate reads back).
#[tokio::test]
async fn scenario_double_offset_each_inverted() {
    let tcs = connected_tcs(vec![]).await;
    let op1 = OperatorCommand::new_user_initiated("offset", "offset arc 5,6");
    tcs.offset("arc", &[5.0, 6.0], op1.clone()).await;
    assert_eq!(op1.await_links().await, OperatorState::Done);
    assert_eq!(op1.links()[0].command_text, "offset arc -5.000000 -6.000000");

    let op2 = OperatorCommand::new_user_initiated("offset", "offset arc 7,8");
    tcs.offset("arc", &[7.0, 8.0], op2.clone()).await;
    assert_eq!(op2.await_links().await, OperatorState::Done);
    assert_eq!(op2.links()[0].command_text, "offset arc -7.000000 -8.000000");
}

/// Scenario 5: `set scaleFactor=1.00006` from a ring parked at the zero
/// point (20mm) moves the ring to ~19.29mm and pairs an M2 focus offset of
/// about +101.4 um (spec.md 8).
#[tokio::test]
async fn scenario_set_scale_factor_pairs_ring_move_and_m2_focus() {
    let scale = connected_scale(scale::ZERO_POINT).await;
    let m2 = connected_m2().await;
    let tcs = connected_tcs(vec![]).await;
    let keywords = fresh_keywords();
    let actor = actor_with(scale.clone(), tcs, m2.clone(), keywords);

    let op = OperatorCommand::new_user_initiated("set scaleFactor", "set scaleFactor=1.00006");
    actor.clone().handle_set_scale_factor(Some(1.00006), false, op.clone()).await;
    assert_eq!(op.await_links().await, OperatorState::Done);

    let expected_pos = scale::scale2mm(1.00006);
    assert!((expected_pos - 19.29).abs() < 0.01, "expected_pos={expected_pos}");

    let move_cmd = op
        .links()
        .iter()
        .find(|c| c.verb == "move")
        .expect("a scale move was issued")
        .clone();
    assert!(move_cmd.command_text.starts_with("move 19.2"));

    let focus_cmd = op.links().iter().find(|c| c.verb == "focus").expect("an m2 focus offset was issued");
    let expected_delta = (expected_pos - scale::ZERO_POINT) * 1000.0 * (1.0 / 7.0) * -1.0;
    assert!((m2.sec_focus().await - expected_delta).abs() < 1e-6);
    assert!(expected_delta > 100.0 && expected_delta < 103.0, "expected_delta={expected_delta}");
    assert!(focus_cmd.command_text.starts_with("focus 101."));
}

/// Scenario 6: a `move` cancelled mid-flight by `stop` ends Cancelled with
/// "Killed by stop", and the ring state settles back to Done.
#[tokio::test]
async fn scenario_move_then_stop_cancels_move() {
    let scale = connected_scale(scale::ZERO_POINT).await;

    let move_op = OperatorCommand::new_user_initiated("threadring move", "threadring move 25");
    scale.move_to(25.0, move_op.clone()).await;
    assert_eq!(scale.ring_state().await, RingState::Moving);

    tokio::time::sleep(Duration::from_millis(20)).await;

    let stop_op = OperatorCommand::new_user_initiated("stop", "stop");
    scale.stop(stop_op.clone()).await;

    assert_eq!(move_op.await_links().await, OperatorState::Cancelled);
    assert_eq!(move_op.message().as_deref(), Some("Killed by stop"));
    assert_eq!(stop_op.await_links().await, OperatorState::Done);

    // The queue's kill-on-conflict is synchronous with `add`, so by the
    // time `stop` itself finishes the ring's watcher task has already
    // observed the move's terminal state via `set_ring_state` in `stop()`.
    assert_eq!(scale.ring_state().await, RingState::Done);
}

/// Boundary: `set scaleFactor=1.03` is rejected before any device command
/// is issued (spec.md 8).
#[tokio::test]
async fn boundary_scale_factor_out_of_range_issues_no_device_command() {
    let scale = connected_scale(scale::ZERO_POINT).await;
    let m2 = connected_m2().await;
    let tcs = connected_tcs(vec![]).await;
    let keywords = fresh_keywords();
    let actor = actor_with(scale, tcs, m2, keywords);

    let op = OperatorCommand::new_user_initiated("set scaleFactor", "set scaleFactor=1.03");
    actor.clone().handle_set_scale_factor(Some(1.03), false, op.clone()).await;
    assert_eq!(op.state(), OperatorState::Failed);
    assert!(op.links().is_empty());
}

/// Boundary: an out-of-range `move` is rejected without reaching the wire.
#[tokio::test]
async fn boundary_move_out_of_range() {
    let scale = connected_scale(scale::ZERO_POINT).await;
    let op = OperatorCommand::new_user_initiated("threadring move", "threadring move 1000");
    scale.move_to(1000.0, op.clone()).await;
    assert_eq!(op.state(), OperatorState::Failed);
    assert!(op.message().unwrap().contains("not in range"));
}

/// Boundary: a speed above `MAX_SPEED` is rejected.
#[tokio::test]
async fn boundary_speed_exceeds_max() {
    let scale = connected_scale(scale::ZERO_POINT).await;
    let op = OperatorCommand::new_user_initiated("threadring speed", "threadring speed 1.0");
    scale.set_speed(1.0, op.clone()).await;
    assert_eq!(op.state(), OperatorState::Failed);
    assert!(op.message().unwrap().contains("Max Speed Exceeded"));
}

/// Idempotence: two successive idle `status` requests produce equal
/// dictionaries (spec.md 8).
#[tokio::test]
async fn idempotence_two_status_requests_agree() {
    let scale = connected_scale(23.5).await;
    for _ in 0..2 {
        let op = OperatorCommand::new_internal("status", dupont_tcc::core::operator_command::OperatorCommandId(0));
        scale.get_status(op.clone()).await;
        assert_eq!(op.await_links().await, OperatorState::Done);
        assert!((scale.current_pos_mm().await - 23.5).abs() < 1e-6);
    }
}

/// Idempotence: `device disconnect` followed by `device connect` restores
/// the scaling ring to a working Ready state with `isHomed` unchanged --
/// hardcoded true, since no absolute encoder exists (spec.md 8, 9).
#[tokio::test]
async fn disconnect_then_connect_restores_homed_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { break };
            serve_scale(socket, scale::ZERO_POINT).await;
        }
    });

    let keywords = fresh_keywords();
    let transport = Arc::new(TcpLineTransport::new("127.0.0.1", port));
    let scale = ScaleDevice::new(transport, keywords);
    scale.connect().await.unwrap();
    wait_for_pos(&scale, scale::ZERO_POINT).await;
    assert!(scale.is_homed());

    scale.disconnect().await.unwrap();
    assert!(scale.is_homed(), "isHomed must not change across a disconnect");

    scale.connect().await.unwrap();
    wait_for_pos(&scale, scale::ZERO_POINT).await;
    assert!(scale.is_homed());
    assert!(!scale.is_moving().await, "reconnect leaves the device idle, not mid-move");
}
