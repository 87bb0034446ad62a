// Motion controller: IK, safety validation and dispatch over one arm link
//
// Each operation walks IDLE -> VALIDATING -> (REJECTED | DISPATCHING) ->
// (CONFIRMED | TIMED_OUT) and holds the link for its whole command/response
// cycle. Concurrent callers queue on the mutex and never interleave on the wire.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::kinematics::KinematicsModel;
use super::link::ArmLink;
use super::safety::{GuardFlags, SafetyGuard};
use crate::calibration::CalibrationCell;
use crate::config::{ArmConfig, MotionSettings, RefineOptions};
use crate::error::{ArmError, Result};
use crate::messages::{CartesianPose, Command, Feedback, JointAngles, JointMove};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionState {
    #[default]
    Idle,
    Validating,
    Rejected,
    Dispatching,
    Confirmed,
    TimedOut,
}

/// Per-move switches for `move_to_with`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveOptions {
    pub allow_below_floor: bool,
    /// Wait for one feedback snapshot after the move
    pub confirm: bool,
    /// Run bounded refinement after the move; implies `confirm`
    pub refine: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineOutcome {
    /// Measured pose within tolerance of the target
    Converged,
    /// Joints reached their command but the pose is still off: the error is in
    /// the calibration, which joint corrections cannot remove
    ModelBias,
    /// Iteration budget spent with the residual still above tolerance
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineReport {
    pub outcome: RefineOutcome,
    /// Corrective moves sent
    pub iterations: u32,
    /// Distance between target and last reported pose (mm)
    pub residual_mm: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    /// Last joint command sent
    pub joints: JointAngles,
    /// Where the active calibration puts the tool for `joints`
    pub predicted: CartesianPose,
    pub feedback: Option<Feedback>,
    pub refine: Option<RefineReport>,
}

/// Upright rest pose, gripper left where it is
pub fn candle_joints(gripper: f64) -> JointAngles {
    JointAngles {
        gripper,
        ..JointAngles::default()
    }
}

struct Inner<L> {
    link: L,
    state: MotionState,
}

impl<L> Inner<L> {
    fn set_state(&mut self, next: MotionState) {
        if self.state != next {
            debug!("motion {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn rejected_if_err<T>(&mut self, verdict: Result<T>) -> Result<T> {
        if verdict.is_err() {
            self.set_state(MotionState::Rejected);
        }
        verdict
    }
}

pub struct MotionController<L: ArmLink> {
    inner: Mutex<Inner<L>>,
    calibration: CalibrationCell,
    guard: SafetyGuard,
    settings: MotionSettings,
    refine: RefineOptions,
}

impl<L: ArmLink> MotionController<L> {
    pub fn new(link: L, calibration: CalibrationCell, config: &ArmConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                link,
                state: MotionState::Idle,
            }),
            calibration,
            guard: SafetyGuard::new(config.safety.clone()),
            settings: config.motion.clone(),
            refine: config.refine,
        }
    }

    pub fn calibration(&self) -> &CalibrationCell {
        &self.calibration
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    pub fn state(&self) -> MotionState {
        self.lock().state
    }

    /// Give the link back, e.g. to close the port
    pub fn into_link(self) -> L {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .link
    }

    /// Options `move_to` uses: confirmation and refinement as configured
    pub fn default_options(&self) -> MoveOptions {
        MoveOptions {
            allow_below_floor: false,
            confirm: self.settings.confirm,
            refine: self.refine.enabled,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<L>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn model(&self) -> KinematicsModel {
        KinematicsModel::new(self.calibration.snapshot())
    }

    /// Move the tool to `pose`
    pub fn move_to(&self, pose: &CartesianPose) -> Result<MoveOutcome> {
        self.move_to_with(pose, self.default_options())
    }

    /// Move the tool to `pose`
    ///
    /// `Unreachable` and `LimitViolation` are returned before anything is
    /// written to the link. With `confirm`, a missing feedback snapshot is an
    /// error (`Timeout`) even though the move itself has been sent.
    pub fn move_to_with(&self, pose: &CartesianPose, options: MoveOptions) -> Result<MoveOutcome> {
        let flags = GuardFlags {
            allow_below_floor: options.allow_below_floor,
            ..GuardFlags::default()
        };
        let model = self.model();
        let mut inner = self.lock();

        inner.set_state(MotionState::Validating);
        let verdict = model
            .inverse(pose, &self.settings.tool)
            .and_then(|joints| self.check(&model, joints, flags));
        let (joints, predicted) = inner.rejected_if_err(verdict)?;

        let mut outcome = self.execute(
            &mut inner,
            joints,
            predicted,
            options.confirm || options.refine,
        )?;

        if options.refine {
            let report = self.refine(&mut inner, &model, pose, flags, &mut outcome)?;
            outcome.refine = Some(report);
        }
        Ok(outcome)
    }

    /// Send a joint command after validating it
    pub fn move_joints(&self, joints: JointAngles, flags: GuardFlags) -> Result<MoveOutcome> {
        let model = self.model();
        let mut inner = self.lock();

        inner.set_state(MotionState::Validating);
        let (joints, predicted) = inner.rejected_if_err(self.check(&model, joints, flags))?;
        self.execute(&mut inner, joints, predicted, self.settings.confirm)
    }

    /// Current feedback snapshot
    pub fn get_pose(&self) -> Result<Feedback> {
        let mut inner = self.lock();
        request_feedback(&mut inner.link, self.settings.feedback_timeout())
    }

    /// Return to the candle pose, keeping the gripper where it is
    ///
    /// Falls back to the configured gripper angle if no feedback arrives or the
    /// current one is below the stall threshold.
    pub fn home(&self) -> Result<MoveOutcome> {
        let model = self.model();
        let mut inner = self.lock();

        let stall = self.guard.limits().gripper_stall;
        let fallback = self.settings.tool.gripper;
        let gripper = match request_feedback(&mut inner.link, self.settings.feedback_timeout()) {
            Ok(fb) if fb.gripper >= stall => fb.gripper,
            Ok(fb) => {
                warn!(
                    "Gripper at {:.3} rad is below the stall threshold, homing with {:.3}",
                    fb.gripper, fallback
                );
                fallback
            }
            Err(e) => {
                warn!("No feedback before homing ({}), using gripper {:.3}", e, fallback);
                fallback
            }
        };

        inner.set_state(MotionState::Validating);
        let verdict = self.check(&model, candle_joints(gripper), GuardFlags::default());
        let (joints, predicted) = inner.rejected_if_err(verdict)?;
        let outcome = self.execute(&mut inner, joints, predicted, self.settings.confirm)?;
        info!("Homed");
        Ok(outcome)
    }

    pub fn set_torque(&self, on: bool) -> Result<()> {
        info!("Torque lock {}", if on { "on" } else { "off" });
        self.lock().link.send(&Command::TorqueLock { on })
    }

    /// Ask the firmware to push feedback continuously (or stop)
    pub fn set_feedback_stream(&self, on: bool) -> Result<()> {
        self.lock().link.send(&Command::FeedbackStream { on })
    }

    /// Send a stored step exactly as recorded
    pub fn dispatch_raw(&self, step: &Value) -> Result<()> {
        let mut inner = self.lock();
        inner.set_state(MotionState::Dispatching);
        let sent = inner.link.send(&Command::Raw(step.clone()));
        inner.set_state(MotionState::Idle);
        sent
    }

    /// One sample-collection move: sweep envelope, custom speed and settle
    ///
    /// Returns the feedback read after settling.
    pub(crate) fn sweep_step(&self, joints: JointAngles, speed: f64, settle: Duration) -> Result<Feedback> {
        let model = self.model();
        let mut inner = self.lock();

        inner.set_state(MotionState::Validating);
        let (joints, _) = inner.rejected_if_err(self.check(&model, joints, GuardFlags::sweep()))?;
        self.dispatch(&mut inner, &joints, speed)?;
        self.confirm(&mut inner, settle)
    }

    fn check(
        &self,
        model: &KinematicsModel,
        joints: JointAngles,
        flags: GuardFlags,
    ) -> Result<(JointAngles, CartesianPose)> {
        let predicted = model.forward(&joints);
        self.guard.validate(&joints, &predicted, flags)?;
        Ok((joints, predicted))
    }

    fn execute(
        &self,
        inner: &mut Inner<L>,
        joints: JointAngles,
        predicted: CartesianPose,
        confirm: bool,
    ) -> Result<MoveOutcome> {
        self.dispatch(inner, &joints, self.settings.speed)?;
        let feedback = if confirm {
            Some(self.confirm(inner, self.settings.settle())?)
        } else {
            None
        };
        Ok(MoveOutcome {
            joints,
            predicted,
            feedback,
            refine: None,
        })
    }

    fn dispatch(&self, inner: &mut Inner<L>, joints: &JointAngles, speed: f64) -> Result<()> {
        inner.set_state(MotionState::Dispatching);
        let command = Command::JointMove(JointMove {
            joints: *joints,
            speed,
            acc: self.settings.acc,
        });
        if let Err(e) = inner.link.send(&command) {
            inner.set_state(MotionState::Idle);
            return Err(e);
        }
        Ok(())
    }

    fn confirm(&self, inner: &mut Inner<L>, settle: Duration) -> Result<Feedback> {
        thread::sleep(settle);
        match request_feedback(&mut inner.link, self.settings.feedback_timeout()) {
            Ok(feedback) => {
                inner.set_state(MotionState::Confirmed);
                Ok(feedback)
            }
            Err(e) => {
                let next = if matches!(e, ArmError::Timeout(_)) {
                    MotionState::TimedOut
                } else {
                    MotionState::Idle
                };
                inner.set_state(next);
                Err(e)
            }
        }
    }

    /// Nudge the joints toward their IK reference until the reported pose is
    /// within tolerance
    ///
    /// Only execution error (joints short of their command) is corrected. When
    /// the joints already sit on their command the remaining residual comes
    /// from the calibration; no correction is sent and the report says
    /// `ModelBias`.
    fn refine(
        &self,
        inner: &mut Inner<L>,
        model: &KinematicsModel,
        target: &CartesianPose,
        flags: GuardFlags,
        outcome: &mut MoveOutcome,
    ) -> Result<RefineReport> {
        let opts = &self.refine;
        let reference = outcome.joints;
        let mut iterations = 0;

        loop {
            let Some(feedback) = outcome.feedback else {
                return Err(ArmError::Protocol("refinement needs a feedback snapshot".to_string()));
            };

            let residual_mm = feedback.pose().distance_to(target);
            let report = |kind| RefineReport {
                outcome: kind,
                iterations,
                residual_mm,
            };

            if residual_mm <= opts.tolerance_mm {
                debug!("Refined to {:.3} mm after {} corrections", residual_mm, iterations);
                return Ok(report(RefineOutcome::Converged));
            }

            let error = [
                reference.base - feedback.base,
                reference.shoulder - feedback.shoulder,
                reference.elbow - feedback.elbow,
            ];
            let worst = error.iter().fold(0.0_f64, |m, e| m.max(e.abs()));

            if worst <= opts.tracking_tolerance {
                warn!(
                    "Residual {:.2} mm with joints within {:.4} rad of command: calibration error, not corrected",
                    residual_mm, worst
                );
                return Ok(report(RefineOutcome::ModelBias));
            }

            if iterations >= opts.iterations {
                warn!(
                    "Refinement stopped after {} corrections, residual {:.2} mm",
                    iterations, residual_mm
                );
                return Ok(report(RefineOutcome::Exhausted));
            }

            let step = |e: f64| (opts.gain * e).clamp(-opts.max_joint_step, opts.max_joint_step);
            let mut command = outcome.joints;
            command.base += step(error[0]);
            command.shoulder += step(error[1]);
            command.elbow += step(error[2]);

            inner.set_state(MotionState::Validating);
            let (command, predicted) = inner.rejected_if_err(self.check(model, command, flags))?;
            self.dispatch(inner, &command, self.settings.speed)?;
            let feedback = self.confirm(inner, self.settings.settle())?;

            outcome.joints = command;
            outcome.predicted = predicted;
            outcome.feedback = Some(feedback);
            iterations += 1;
        }
    }
}

/// Drop stale feedback, request a fresh snapshot and wait for it
fn request_feedback<L: ArmLink>(link: &mut L, timeout: Duration) -> Result<Feedback> {
    link.clear_feedback();
    link.send(&Command::FeedbackRequest)?;
    link.read_feedback(timeout)
}
