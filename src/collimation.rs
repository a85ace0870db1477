//! Collimation Model & Loop (spec.md 4.6): a pure orientation model plus the
//! periodic control loop that reads TCS axis state and drives the M2
//! secondary in response.
//!
//! The model's actual tilt/translation coefficients are a site calibration
//! that isn't present anywhere in the retrieved reference material --
//! `CollimationCoefficients` is a named, documented placeholder (see
//! DESIGN.md) rather than an invented "real" calibration.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::core::keywords::{KeywordDict, Severity};
use crate::core::operator_command::{OperatorCommand, OperatorCommandHandle, OperatorCommandId};
use crate::devices::m2::M2Device;
use crate::devices::tcs::TcsDevice;

#[derive(Debug, Clone, Copy)]
pub struct CollimationCoefficients {
    pub tilt_x_per_ha: f64,
    pub tilt_x_per_dec: f64,
    pub tilt_y_per_ha: f64,
    pub tilt_y_per_dec: f64,
    pub trans_x_per_ha: f64,
    pub trans_x_per_dec: f64,
    pub trans_y_per_ha: f64,
    pub trans_y_per_dec: f64,
    pub focus_per_deg_c: f64,
}

impl Default for CollimationCoefficients {
    fn default() -> Self {
        // Placeholder coefficients: no flex calibration was present in the
        // retrieved reference material. Zeroed so an uncalibrated actor
        // never commands spurious M2 motion; a site calibration overwrites
        // these at config time.
        Self {
            tilt_x_per_ha: 0.0,
            tilt_x_per_dec: 0.0,
            tilt_y_per_ha: 0.0,
            tilt_y_per_dec: 0.0,
            trans_x_per_ha: 0.0,
            trans_x_per_dec: 0.0,
            trans_y_per_ha: 0.0,
            trans_y_per_dec: 0.0,
            focus_per_deg_c: 0.0,
        }
    }
}

struct Baseline {
    focus: f64,
    truss_temp: f64,
}

/// `orient(ha, dec, temp?)`: pure mapping from pointing + truss temperature
/// to a 5-axis M2 orientation. `setFocus` calibrates the temperature
/// compensation baseline used whenever `temp` is supplied.
pub struct CollimationModel {
    coeffs: CollimationCoefficients,
    pub min_tilt: f64,
    pub min_trans: f64,
    baseline: Option<Baseline>,
}

impl CollimationModel {
    pub fn new(coeffs: CollimationCoefficients, min_tilt: f64, min_trans: f64) -> Self {
        Self {
            coeffs,
            min_tilt,
            min_trans,
            baseline: None,
        }
    }

    pub fn set_focus(&mut self, focus: f64, truss_temp: f64) {
        self.baseline = Some(Baseline { focus, truss_temp });
    }

    /// `focus` is `None` iff `temp` was omitted (spec.md 4.6: "If temp is
    /// omitted, focus is null").
    pub fn orient(&self, ha: f64, dec: f64, temp: Option<f64>) -> (Option<f64>, f64, f64, f64, f64) {
        let tilt_x = self.coeffs.tilt_x_per_ha * ha + self.coeffs.tilt_x_per_dec * dec;
        let tilt_y = self.coeffs.tilt_y_per_ha * ha + self.coeffs.tilt_y_per_dec * dec;
        let trans_x = self.coeffs.trans_x_per_ha * ha + self.coeffs.trans_x_per_dec * dec;
        let trans_y = self.coeffs.trans_y_per_ha * ha + self.coeffs.trans_y_per_dec * dec;
        let focus = temp.map(|t| {
            let (base_focus, base_temp) = self
                .baseline
                .as_ref()
                .map(|b| (b.focus, b.truss_temp))
                .unwrap_or((0.0, t));
            base_focus + self.coeffs.focus_per_deg_c * (t - base_temp)
        });
        (focus, tilt_x, tilt_y, trans_x, trans_y)
    }
}

pub struct CollimationLoop {
    model: Mutex<CollimationModel>,
    tcs: Arc<TcsDevice>,
    m2: Arc<M2Device>,
    keywords: Arc<KeywordDict>,
    enabled: Mutex<bool>,
    interval: Mutex<Duration>,
    active: Mutex<bool>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl CollimationLoop {
    pub fn new(
        model: CollimationModel,
        tcs: Arc<TcsDevice>,
        m2: Arc<M2Device>,
        keywords: Arc<KeywordDict>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            model: Mutex::new(model),
            tcs,
            m2,
            keywords,
            enabled: Mutex::new(false),
            interval: Mutex::new(interval),
            active: Mutex::new(false),
            pending: Mutex::new(None),
        })
    }

    pub async fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock().await = enabled;
    }

    pub async fn is_enabled(&self) -> bool {
        *self.enabled.lock().await
    }

    pub async fn set_focus_calibration(&self, focus: f64, truss_temp: f64) {
        self.model.lock().await.set_focus(focus, truss_temp);
    }

    async fn cancel_pending(&self) {
        if let Some(handle) = self.pending.lock().await.take() {
            handle.abort();
        }
        *self.active.lock().await = false;
    }

    /// `updateCollimation` (spec.md 4.6). `op` resolves to a terminal state
    /// either directly (disabled / halted / flex-too-small) or via its
    /// linked M2 `move` command; callers should `op.await_links().await`
    /// after this returns to observe the final state either way.
    pub async fn update(self: &Arc<Self>, op: OperatorCommandHandle, force: bool) {
        if !self.is_enabled().await && !force {
            op.fail("collimation is disabled");
            return;
        }
        let status = self.tcs.status().await;
        if status.axis_halted() {
            op.cancel("RA or Dec axis halted, not applying collimation.");
            return;
        }

        self.cancel_pending().await;

        let status_op = OperatorCommand::new_internal("status", OperatorCommandId(0));
        self.tcs.get_status(status_op.clone()).await;

        // Rescheduling is decoupled from this status request's outcome: a
        // transient timeout here must not stall the periodic loop forever.
        if self.is_enabled().await {
            self.schedule_next().await;
        }

        if status_op.await_links().await != crate::core::operator_command::OperatorState::Done {
            op.fail("status command failed");
            return;
        }

        let status = self.tcs.status().await;
        let Some((ha, dec)) = status.collimation_coords() else {
            op.fail("status command failed");
            return;
        };
        if status.is_slewing() {
            self.keywords
                .update("CollimateFor", format!("target ha={ha:.2}, dec={dec:.2}"), Some(&op), None);
        } else {
            self.keywords
                .update("CollimateFor", format!("current ha={ha:.2}, dec={dec:.2}"), Some(&op), None);
        }

        let new_orient = {
            let model = self.model.lock().await;
            model.orient(ha, dec, status.truss_temp)
        };
        let mut orient = self.m2.orientation().await;
        let d_tilt_x = new_orient.1 - orient[1];
        let d_tilt_y = new_orient.2 - orient[2];
        let d_trans_x = new_orient.3 - orient[3];
        let d_trans_y = new_orient.4 - orient[4];
        let (min_tilt, min_trans) = {
            let model = self.model.lock().await;
            (model.min_tilt, model.min_trans)
        };
        let do_flex = d_tilt_x.abs().max(d_tilt_y.abs()) > min_tilt || d_trans_x.abs().max(d_trans_y.abs()) > min_trans;

        if force {
            self.keywords.update("CollimateForced", "true", Some(&op), None);
        }

        if !force && !do_flex {
            self.keywords.update(
                "CollimateFlex",
                format!(
                    "update too small: dTiltX={d_tilt_x:.2}, dTiltY={d_tilt_y:.2}, dTransX={d_trans_x:.2}, dTransY={d_trans_y:.2}"
                ),
                Some(&op),
                None,
            );
            op.succeed();
        } else {
            orient[1] = new_orient.1;
            orient[2] = new_orient.2;
            orient[3] = new_orient.3;
            orient[4] = new_orient.4;
            self.keywords.update(
                "CollimateUpdate",
                format!(
                    "Focus={:.2}, TiltX={:.2}, TiltY={:.2}, TransX={:.2}, TransY={:.2}",
                    orient[0], orient[1], orient[2], orient[3], orient[4]
                ),
                Some(&op),
                None,
            );
            self.m2.move_to(orient, op).await;
        }
    }

    /// Reschedules the loop after `collimateInterval` (step 8), as an
    /// internally-commanded, non-user operator command.
    async fn schedule_next(self: &Arc<Self>) {
        let loop_ref = self.clone();
        let handle = tokio::spawn(async move {
            let interval = *loop_ref.interval.lock().await;
            tokio::time::sleep(interval).await;
            // This task has fired -- clear its own pending slot first so the
            // `cancel_pending` inside the `update` call below doesn't abort
            // the task that's calling it.
            *loop_ref.pending.lock().await = None;
            let op = OperatorCommand::new_internal("collimate", OperatorCommandId(0));
            loop_ref.update(op, false).await;
        });
        *self.pending.lock().await = Some(handle);
        *self.active.lock().await = true;
    }

    /// A 5-second watchdog that warns whenever the loop is not active but
    /// the TCS is tracking or slewing (spec.md 4.6).
    pub fn start_watchdog(self: &Arc<Self>) {
        let loop_ref = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let active = *loop_ref.active.lock().await;
                if !active && (loop_ref.tcs.is_tracking().await || loop_ref.tcs.is_slewing().await) {
                    loop_ref
                        .keywords
                        .update("Text", "Collimation is NOT active!!!", None, Some(Severity::Warn));
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orient_leaves_focus_null_without_temperature() {
        let model = CollimationModel::new(CollimationCoefficients::default(), 1.0, 1.0);
        let (focus, ..) = model.orient(10.0, 20.0, None);
        assert!(focus.is_none());
    }

    #[test]
    fn set_focus_calibrates_temperature_compensated_baseline() {
        let mut model = CollimationModel::new(
            CollimationCoefficients {
                focus_per_deg_c: 2.0,
                ..CollimationCoefficients::default()
            },
            1.0,
            1.0,
        );
        model.set_focus(100.0, 15.0);
        let (focus, ..) = model.orient(0.0, 0.0, Some(17.0));
        assert_eq!(focus, Some(100.0 + 2.0 * 2.0));
    }
}
