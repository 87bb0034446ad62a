// Pre-dispatch validation of joint commands
//
// Checks run in a fixed order and the first failure wins:
// z floor, gripper stall, mechanical travel, then the sweep envelope.

use tracing::warn;

use crate::config::{JointLimits, SafetyLimits};
use crate::error::{ArmError, Result};
use crate::messages::{CartesianPose, JointAngles};

/// Joint envelope a command is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Envelope {
    /// Full mechanical travel
    #[default]
    Operating,
    /// Narrower bounds used while collecting calibration samples
    Sweep,
}

/// Per-command switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuardFlags {
    /// Explicit permission to go below the z floor
    pub allow_below_floor: bool,
    pub envelope: Envelope,
}

impl GuardFlags {
    pub fn sweep() -> Self {
        Self {
            allow_below_floor: false,
            envelope: Envelope::Sweep,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyGuard {
    limits: SafetyLimits,
}

impl SafetyGuard {
    pub fn new(limits: SafetyLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Approve or reject a command
    ///
    /// `pose` is where the active calibration predicts `joints` will put the tool.
    pub fn validate(&self, joints: &JointAngles, pose: &CartesianPose, flags: GuardFlags) -> Result<()> {
        let verdict = self.check(joints, pose, flags);
        if let Err(ArmError::LimitViolation { reason }) = &verdict {
            warn!("Rejected command: {}", reason);
        }
        verdict
    }

    fn check(&self, joints: &JointAngles, pose: &CartesianPose, flags: GuardFlags) -> Result<()> {
        let limits = &self.limits;

        if !pose.z.is_finite() {
            return Err(ArmError::limit(format!("predicted z is not finite ({})", pose.z)));
        }
        if !flags.allow_below_floor && pose.z < limits.z_floor {
            return Err(ArmError::limit(format!(
                "z {:.1} mm is below the floor of {:.1} mm",
                pose.z, limits.z_floor
            )));
        }

        if !(joints.gripper >= limits.gripper_stall) {
            return Err(ArmError::limit(format!(
                "gripper {:.3} rad is below the stall threshold {:.3} rad",
                joints.gripper, limits.gripper_stall
            )));
        }

        check_envelope(joints, &limits.mechanical, "mechanical")?;

        if flags.envelope == Envelope::Sweep {
            check_envelope(joints, &limits.sweep, "sweep")?;
        }

        Ok(())
    }
}

fn check_envelope(joints: &JointAngles, limits: &JointLimits, label: &str) -> Result<()> {
    for ((name, range), value) in limits.named().iter().zip(joints.as_array()) {
        if !range.contains(value) {
            return Err(ArmError::limit(format!(
                "{} {:.3} rad outside {} range [{:.3}, {:.3}]",
                name, value, label, range.min, range.max
            )));
        }
    }
    Ok(())
}
