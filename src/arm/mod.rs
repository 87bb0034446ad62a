// Arm control module for the RoArm-M2 class serial arms
//
// Provides:
// - Planar 2-link forward/inverse kinematics with base yaw
// - Pre-dispatch safety validation
// - Serial transport with a latest-value feedback mailbox (plus a simulator)
// - Motion controller serialising all access to the link

pub mod controller;
pub mod kinematics;
pub mod link;
mod mailbox;
pub mod safety;
pub mod sim;

pub use controller::{
    MotionController, MotionState, MoveOptions, MoveOutcome, RefineOutcome, RefineReport,
    candle_joints,
};
pub use kinematics::{KinematicsModel, planar_forward};
pub use link::{ArmLink, SerialLink};
pub use mailbox::FeedbackMailbox;
pub use safety::{Envelope, GuardFlags, SafetyGuard};
pub use sim::SimLink;
