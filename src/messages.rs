// Wire types for the arm firmware's line-delimited JSON protocol
//
// Every object carries a numeric "T" field selecting its meaning. Outgoing
// commands are one enum with a case per code so the field layout of each code
// lives in exactly one place.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::{ArmError, Result};

/// Full joint move in radians
pub const CMD_JOINT_MOVE: i64 = 102;
/// Ask for one feedback snapshot
pub const CMD_FEEDBACK_REQUEST: i64 = 105;
/// Feedback snapshot reply
pub const REPLY_FEEDBACK: i64 = 1051;
/// Torque lock on/off
pub const CMD_TORQUE_LOCK: i64 = 210;
/// Continuous feedback reporting on/off
pub const CMD_FEEDBACK_STREAM: i64 = 605;

/// Joint angles in radians, firmware order
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JointAngles {
    pub base: f64,
    pub shoulder: f64,
    pub elbow: f64,
    pub wrist: f64,
    pub roll: f64,
    pub gripper: f64,
}

impl JointAngles {
    /// Returns angles as array [base, shoulder, elbow, wrist, roll, gripper]
    pub fn as_array(&self) -> [f64; 6] {
        [
            self.base,
            self.shoulder,
            self.elbow,
            self.wrist,
            self.roll,
            self.gripper,
        ]
    }
}

/// Tool position in the shoulder-origin firmware frame (mm)
///
/// Wrist, roll and gripper ride along unsolved; `None` means "use the
/// controller's default".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CartesianPose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrist: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gripper: Option<f64>,
}

impl CartesianPose {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            ..Self::default()
        }
    }

    pub fn with_gripper(mut self, gripper: f64) -> Self {
        self.gripper = Some(gripper);
        self
    }

    /// Euclidean distance between the positions, ignoring tool fields
    pub fn distance_to(&self, other: &CartesianPose) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// T=102 payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointMove {
    pub joints: JointAngles,
    /// Firmware speed factor, 0 = fastest
    pub speed: f64,
    pub acc: u32,
}

/// Command from host -> firmware
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    JointMove(JointMove),
    FeedbackRequest,
    TorqueLock { on: bool },
    FeedbackStream { on: bool },
    /// Verbatim object, used for stored mission steps
    Raw(Value),
}

impl Command {
    /// Protocol code carried in the "T" field, if any
    pub fn code(&self) -> Option<i64> {
        match self {
            Command::JointMove(_) => Some(CMD_JOINT_MOVE),
            Command::FeedbackRequest => Some(CMD_FEEDBACK_REQUEST),
            Command::TorqueLock { .. } => Some(CMD_TORQUE_LOCK),
            Command::FeedbackStream { .. } => Some(CMD_FEEDBACK_STREAM),
            Command::Raw(value) => value.get("T").and_then(Value::as_i64),
        }
    }

    /// Compact JSON terminated by the line delimiter
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// The command as a JSON value, the form mission steps are stored in
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Command::JointMove(cmd) => {
                let j = &cmd.joints;
                let mut map = serializer.serialize_map(Some(9))?;
                map.serialize_entry("T", &CMD_JOINT_MOVE)?;
                map.serialize_entry("base", &j.base)?;
                map.serialize_entry("shoulder", &j.shoulder)?;
                map.serialize_entry("elbow", &j.elbow)?;
                map.serialize_entry("wrist", &j.wrist)?;
                map.serialize_entry("roll", &j.roll)?;
                map.serialize_entry("hand", &j.gripper)?;
                map.serialize_entry("spd", &cmd.speed)?;
                map.serialize_entry("acc", &cmd.acc)?;
                map.end()
            }
            Command::FeedbackRequest => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("T", &CMD_FEEDBACK_REQUEST)?;
                map.end()
            }
            Command::TorqueLock { on } | Command::FeedbackStream { on } => {
                let code = if matches!(self, Command::TorqueLock { .. }) {
                    CMD_TORQUE_LOCK
                } else {
                    CMD_FEEDBACK_STREAM
                };
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("T", &code)?;
                map.serialize_entry("cmd", &u8::from(*on))?;
                map.end()
            }
            Command::Raw(value) => value.serialize(serializer),
        }
    }
}

/// Per-servo load readings reported alongside a feedback snapshot
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ServoLoads {
    #[serde(rename = "tB", default)]
    pub base: f64,
    #[serde(rename = "tS", default)]
    pub shoulder: f64,
    #[serde(rename = "tE", default)]
    pub elbow: f64,
    #[serde(rename = "tT", default)]
    pub wrist: f64,
    #[serde(rename = "tR", default)]
    pub roll: f64,
    #[serde(rename = "tG", default)]
    pub gripper: f64,
}

/// T=1051 snapshot: firmware's own pose estimate plus measured joints
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Feedback {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(rename = "b")]
    pub base: f64,
    #[serde(rename = "s")]
    pub shoulder: f64,
    #[serde(rename = "e")]
    pub elbow: f64,
    #[serde(rename = "t", default)]
    pub wrist: f64,
    #[serde(rename = "r", default)]
    pub roll: f64,
    #[serde(rename = "g", default)]
    pub gripper: f64,
    #[serde(flatten)]
    pub loads: ServoLoads,
}

impl Feedback {
    pub fn joints(&self) -> JointAngles {
        JointAngles {
            base: self.base,
            shoulder: self.shoulder,
            elbow: self.elbow,
            wrist: self.wrist,
            roll: self.roll,
            gripper: self.gripper,
        }
    }

    pub fn pose(&self) -> CartesianPose {
        CartesianPose {
            x: self.x,
            y: self.y,
            z: self.z,
            wrist: Some(self.wrist),
            roll: Some(self.roll),
            gripper: Some(self.gripper),
        }
    }
}

/// A decoded firmware line
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Feedback(Feedback),
    /// Anything else the firmware prints as JSON (echoes, status objects)
    Other(Value),
}

/// Decode one line of firmware output
///
/// Returns `Ok(None)` for lines that are not JSON objects at all (boot banners,
/// blank lines), and a protocol error for lines that start like an object but
/// do not decode.
pub fn decode_reply(line: &str) -> Result<Option<Reply>> {
    let line = line.trim();
    if !line.starts_with('{') {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(line)
        .map_err(|e| ArmError::Protocol(format!("malformed JSON line {:?}: {}", line, e)))?;

    if value.get("T").and_then(Value::as_i64) == Some(REPLY_FEEDBACK) {
        let feedback = serde_json::from_value::<Feedback>(value)
            .map_err(|e| ArmError::Protocol(format!("bad T=1051 payload: {}", e)))?;
        return Ok(Some(Reply::Feedback(feedback)));
    }

    Ok(Some(Reply::Other(value)))
}
