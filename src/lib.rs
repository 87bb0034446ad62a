// Host-side control stack for RoArm-style serial arms: planar kinematics,
// calibration fitting, safety validation, motion control and missions

pub mod arm;
pub mod calibration;
pub mod config;
pub mod error;
pub mod messages;
pub mod mission;
mod persist;

pub use error::{ArmError, Result};
