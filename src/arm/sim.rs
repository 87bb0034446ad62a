// Simulated arm firmware, for running without hardware
//
// Joint moves are applied instantly (plus an optional tracking bias, to mimic
// servos that settle short of their command) and feedback reports the pose
// computed with the simulator's own geometry.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::kinematics::KinematicsModel;
use super::link::ArmLink;
use super::mailbox::FeedbackMailbox;
use crate::calibration::{Calibration, CalibrationParameters};
use crate::error::Result;
use crate::messages::{CMD_JOINT_MOVE, Command, Feedback, JointAngles, ServoLoads};

/// T=102 fields as they appear in a stored mission step
#[derive(Debug, Deserialize)]
struct WireJointMove {
    base: f64,
    shoulder: f64,
    elbow: f64,
    #[serde(default)]
    wrist: f64,
    #[serde(default)]
    roll: f64,
    #[serde(default)]
    hand: f64,
}

pub struct SimLink {
    geometry: KinematicsModel,
    joints: JointAngles,
    bias: JointAngles,
    streaming: bool,
    mailbox: FeedbackMailbox,
    sent: Vec<Command>,
}

impl SimLink {
    /// Simulated arm whose true geometry is `params`, resting upright
    pub fn new(params: CalibrationParameters) -> Result<Self> {
        Ok(Self {
            geometry: KinematicsModel::new(Arc::new(Calibration::initial(params)?)),
            joints: JointAngles {
                gripper: 3.0,
                ..JointAngles::default()
            },
            bias: JointAngles::default(),
            streaming: false,
            mailbox: FeedbackMailbox::new(),
            sent: Vec::new(),
        })
    }

    /// Servos settle at command + `bias`
    pub fn with_tracking_bias(mut self, bias: JointAngles) -> Self {
        self.bias = bias;
        self
    }

    pub fn joints(&self) -> JointAngles {
        self.joints
    }

    /// Every command received, in order
    pub fn sent(&self) -> &[Command] {
        &self.sent
    }

    fn snapshot(&self) -> Feedback {
        let pose = self.geometry.forward(&self.joints);
        Feedback {
            x: pose.x,
            y: pose.y,
            z: pose.z,
            base: self.joints.base,
            shoulder: self.joints.shoulder,
            elbow: self.joints.elbow,
            wrist: self.joints.wrist,
            roll: self.joints.roll,
            gripper: self.joints.gripper,
            loads: ServoLoads::default(),
        }
    }

    fn apply(&mut self, target: JointAngles) {
        let b = &self.bias;
        self.joints = JointAngles {
            base: target.base + b.base,
            shoulder: target.shoulder + b.shoulder,
            elbow: target.elbow + b.elbow,
            wrist: target.wrist + b.wrist,
            roll: target.roll + b.roll,
            gripper: target.gripper + b.gripper,
        };
        if self.streaming {
            self.mailbox.post(self.snapshot());
        }
    }

    fn apply_raw(&mut self, value: &Value) {
        match serde_json::from_value::<WireJointMove>(value.clone()) {
            Ok(m) => self.apply(JointAngles {
                base: m.base,
                shoulder: m.shoulder,
                elbow: m.elbow,
                wrist: m.wrist,
                roll: m.roll,
                gripper: m.hand,
            }),
            Err(e) => debug!("sim ignoring malformed joint move: {}", e),
        }
    }
}

impl ArmLink for SimLink {
    fn send(&mut self, command: &Command) -> Result<()> {
        self.sent.push(command.clone());
        match command {
            Command::JointMove(m) => self.apply(m.joints),
            Command::FeedbackRequest => self.mailbox.post(self.snapshot()),
            Command::TorqueLock { on } => debug!("sim torque lock {}", on),
            Command::FeedbackStream { on } => self.streaming = *on,
            Command::Raw(value) if command.code() == Some(CMD_JOINT_MOVE) => {
                self.apply_raw(value)
            }
            Command::Raw(value) => debug!("sim ignoring {}", value),
        }
        Ok(())
    }

    fn read_feedback(&mut self, timeout: Duration) -> Result<Feedback> {
        self.mailbox.wait(timeout)
    }

    fn clear_feedback(&mut self) {
        self.mailbox.clear();
    }
}
