// Serial settings, timeouts, safety limits and tuning defaults
use std::f64::consts::PI;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

// Serial link
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const BAUD_RATE: u32 = 115_200;

// Per-read timeout of the background reader; bounds shutdown latency
pub const READ_POLL: Duration = Duration::from_millis(100);

// Delay after deasserting RTS/DTR before the first write
pub const PORT_SETTLE: Duration = Duration::from_millis(200);

// Feedback wait for a single T=105 request
pub const FEEDBACK_TIMEOUT_MS: u64 = 1200;

// Time the arm is given to finish a move before it is sampled
pub const SETTLE_MS: u64 = 3000;

// Safety
pub const Z_FLOOR_MM: f64 = 150.0;
pub const GRIPPER_STALL_RAD: f64 = 1.1;

// Gripper angle used when neither the caller nor feedback provide one
pub const DEFAULT_GRIPPER_RAD: f64 = 1.49;

// Default calibration and mission locations
pub const CALIBRATION_FILE: &str = "planar_calib.json";
pub const MISSION_DIR: &str = "missions";

/// Inclusive angle range (rad)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointRange {
    pub min: f64,
    pub max: f64,
}

impl JointRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Per-joint ranges for base, shoulder, elbow, wrist, roll and gripper
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    pub base: JointRange,
    pub shoulder: JointRange,
    pub elbow: JointRange,
    pub wrist: JointRange,
    pub roll: JointRange,
    pub gripper: JointRange,
}

impl JointLimits {
    /// Full mechanical travel
    pub fn mechanical() -> Self {
        Self {
            base: JointRange::new(-PI, PI),
            shoulder: JointRange::new(-1.8, 1.8),
            elbow: JointRange::new(-0.4, 2.15),
            wrist: JointRange::new(-2.0, 2.0),
            roll: JointRange::new(-PI, PI),
            gripper: JointRange::new(0.0, 3.3),
        }
    }

    /// Narrow envelope used while sweeping for calibration samples
    pub fn sweep() -> Self {
        Self {
            base: JointRange::new(-0.1, 0.1),
            shoulder: JointRange::new(-0.7, 0.7),
            elbow: JointRange::new(0.0, 1.9),
            ..Self::mechanical()
        }
    }

    /// (name, range) pairs in firmware order
    pub fn named(&self) -> [(&'static str, JointRange); 6] {
        [
            ("base", self.base),
            ("shoulder", self.shoulder),
            ("elbow", self.elbow),
            ("wrist", self.wrist),
            ("roll", self.roll),
            ("gripper", self.gripper),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// Lowest permitted tool z (mm) unless a move explicitly overrides it
    pub z_floor: f64,
    /// Gripper angles below this stall the servo
    pub gripper_stall: f64,
    pub mechanical: JointLimits,
    pub sweep: JointLimits,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            z_floor: Z_FLOOR_MM,
            gripper_stall: GRIPPER_STALL_RAD,
            mechanical: JointLimits::mechanical(),
            sweep: JointLimits::sweep(),
        }
    }
}

/// Pass-through values for joints the planar solver does not touch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolDefaults {
    pub wrist: f64,
    pub roll: f64,
    pub gripper: f64,
}

impl Default for ToolDefaults {
    fn default() -> Self {
        Self {
            wrist: 0.0,
            roll: 0.0,
            gripper: DEFAULT_GRIPPER_RAD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    /// T=102 speed factor
    pub speed: f64,
    /// T=102 acceleration
    pub acc: u32,
    pub feedback_timeout_ms: u64,
    pub settle_ms: u64,
    /// Wait for a feedback snapshot after each move
    pub confirm: bool,
    /// Pause after each mission step
    pub step_delay_ms: u64,
    pub tool: ToolDefaults,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            speed: 0.0,
            acc: 10,
            feedback_timeout_ms: FEEDBACK_TIMEOUT_MS,
            settle_ms: SETTLE_MS,
            confirm: true,
            step_delay_ms: 100,
            tool: ToolDefaults::default(),
        }
    }
}

impl MotionSettings {
    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_millis(self.feedback_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

/// Bounded post-move correction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineOptions {
    pub enabled: bool,
    pub iterations: u32,
    /// Fraction of the joint tracking error applied per iteration
    pub gain: f64,
    /// Largest correction applied to any joint in one iteration (rad)
    pub max_joint_step: f64,
    /// Stop once the Cartesian residual is within this distance (mm)
    pub tolerance_mm: f64,
    /// Joints closer than this to their command count as executed (rad)
    pub tracking_tolerance: f64,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            iterations: 2,
            gain: 0.5,
            max_joint_step: 0.05,
            tolerance_mm: 2.0,
            tracking_tolerance: 0.005,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub min_samples: usize,
    pub max_iterations: usize,
    /// Fits with a larger residual RMS (mm) are rejected
    pub max_rms_mm: f64,
    /// Samples with |y| above this are not planar enough to use (mm)
    pub max_abs_y: f64,
    /// Residuals above factor × RMS are trimmed once; 0 disables trimming
    pub outlier_factor: f64,
    /// Starting point as [L1, L2, X0, Z0, shoulder_offset, elbow_offset]
    pub seed: [f64; 6],
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            min_samples: 10,
            max_iterations: 100,
            max_rms_mm: 5.0,
            max_abs_y: 2.0,
            outlier_factor: 3.0,
            seed: [236.0, 320.0, 0.0, 0.0, 0.0, 0.0],
        }
    }
}

/// Shoulder × elbow grid visited when collecting calibration samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepPlan {
    pub shoulders: Vec<f64>,
    pub elbows: Vec<f64>,
    /// Interpolated joint steps per grid point
    pub steps: u32,
    pub speed: f64,
    /// Cartesian box the feedback must stay inside (mm)
    pub z_min: f64,
    pub x_min: f64,
    pub x_max: f64,
    pub step_settle_ms: u64,
}

impl Default for SweepPlan {
    fn default() -> Self {
        Self {
            shoulders: vec![-0.6, -0.3, 0.0, 0.3, 0.6],
            elbows: vec![0.3, 0.6, 1.0, 1.4, 1.8],
            steps: 10,
            speed: 0.35,
            z_min: 120.0,
            x_min: -220.0,
            x_max: 560.0,
            step_settle_ms: 450,
        }
    }
}

/// Everything tunable, loadable from a JSON file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmConfig {
    pub safety: SafetyLimits,
    pub motion: MotionSettings,
    pub refine: RefineOptions,
    pub fit: FitOptions,
    pub sweep: SweepPlan,
}

impl ArmConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
