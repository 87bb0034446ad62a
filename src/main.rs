// roarm: command-line front end for the planar arm controller
//
// Usage: roarm [--port /dev/ttyUSB0] [--sim] <command>
// Example: roarm goto 235 0 234 --refine

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use roarm_planar::arm::{
    ArmLink, MotionController, MoveOptions, MoveOutcome, RefineOutcome, SerialLink, SimLink,
};
use roarm_planar::calibration::{
    CalibrationCell, CalibrationParameters, collect_samples, fit, planar_samples,
    read_samples_csv, write_samples_csv,
};
use roarm_planar::config::{ArmConfig, CALIBRATION_FILE, DEFAULT_PORT, MISSION_DIR};
use roarm_planar::messages::CartesianPose;
use roarm_planar::mission::MissionStore;

/// Planar-calibrated control for RoArm serial arms
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port of the arm
    #[arg(short, long, default_value = DEFAULT_PORT, global = true)]
    port: String,

    /// JSON config file; built-in defaults otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Calibration record
    #[arg(long, default_value = CALIBRATION_FILE, global = true)]
    calib: PathBuf,

    /// Mission store directory
    #[arg(long, default_value = MISSION_DIR, global = true)]
    missions: PathBuf,

    /// Drive a simulated arm instead of the serial port
    #[arg(long, global = true)]
    sim: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print one feedback snapshot
    Feedback,
    /// Move to the upright candle pose
    Home,
    /// Move the tool to X Y Z (mm)
    #[command(allow_negative_numbers = true)]
    Goto {
        x: f64,
        y: f64,
        z: f64,
        /// Gripper angle (rad)
        #[arg(long)]
        gripper: Option<f64>,
        /// Correct execution error after the move
        #[arg(long)]
        refine: bool,
        /// Allow a target below the z floor
        #[arg(long)]
        allow_low: bool,
    },
    /// Torque lock on or off
    Torque {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Sweep the calibration grid and write samples to CSV
    Collect {
        #[arg(short, long, default_value = "samples.csv")]
        out: PathBuf,
    },
    /// Fit calibration parameters to a sample CSV and publish them
    Fit {
        samples: PathBuf,
        /// Where to write the record; defaults to --calib
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Record, edit and play missions
    #[command(subcommand)]
    Mission(MissionCmd),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum MissionCmd {
    Create {
        name: String,
        #[arg(default_value = "")]
        intro: String,
    },
    List,
    Show {
        name: String,
    },
    /// Append the arm's current joints as a step
    AppendPose {
        name: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Delete one step, or the whole mission when no index is given
    Delete {
        name: String,
        index: Option<usize>,
    },
    Play {
        name: String,
        #[arg(short, long, default_value_t = 1)]
        times: i64,
    },
}

type Controller = MotionController<Box<dyn ArmLink>>;

fn connect(args: &Args, config: &ArmConfig, cell: CalibrationCell) -> Result<Controller, Box<dyn Error>> {
    let link: Box<dyn ArmLink> = if args.sim {
        info!("Using simulated arm");
        Box::new(SimLink::new(CalibrationParameters::reference())?)
    } else {
        let link = SerialLink::open(&args.port)?;
        info!("Connected to arm on {}", link.port_name());
        Box::new(link)
    };
    let controller = MotionController::new(link, cell, config);
    info!(
        "Using calibration v{}",
        controller.calibration().snapshot().version()
    );
    Ok(controller)
}

fn print_outcome(outcome: &MoveOutcome) -> Result<(), Box<dyn Error>> {
    println!("joints: {}", serde_json::to_string(&outcome.joints)?);
    println!("predicted: {}", serde_json::to_string(&outcome.predicted)?);
    if let Some(fb) = &outcome.feedback {
        println!("feedback: {}", serde_json::to_string(fb)?);
    }
    if let Some(report) = &outcome.refine {
        println!(
            "refine: {:?} after {} corrections, residual {:.2} mm",
            report.outcome, report.iterations, report.residual_mm
        );
        if report.outcome == RefineOutcome::ModelBias {
            println!("  residual is calibration error; re-run collect + fit to reduce it");
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    // Setup logging (set RUST_LOG=debug for wire traffic)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ArmConfig::load(path)?,
        None => ArmConfig::default(),
    };
    let cell = CalibrationCell::open_or_reference(&args.calib)?;

    match &args.command {
        Cmd::Feedback => {
            let controller = connect(&args, &config, cell)?;
            let fb = controller.get_pose()?;
            println!("{}", serde_json::to_string_pretty(&fb)?);
        }
        Cmd::Home => {
            let controller = connect(&args, &config, cell)?;
            print_outcome(&controller.home()?)?;
        }
        Cmd::Goto {
            x,
            y,
            z,
            gripper,
            refine,
            allow_low,
        } => {
            let controller = connect(&args, &config, cell)?;
            let pose = CartesianPose {
                gripper: *gripper,
                ..CartesianPose::new(*x, *y, *z)
            };
            let options = MoveOptions {
                allow_below_floor: *allow_low,
                refine: *refine,
                ..controller.default_options()
            };
            print_outcome(&controller.move_to_with(&pose, options)?)?;
        }
        Cmd::Torque { state } => {
            let controller = connect(&args, &config, cell)?;
            controller.set_torque(matches!(state, Switch::On))?;
        }
        Cmd::Collect { out } => {
            let controller = connect(&args, &config, cell)?;
            let records = collect_samples(&controller, &config.sweep)?;
            write_samples_csv(out, &records)?;
            println!("{} samples -> {}", records.len(), out.display());
        }
        Cmd::Fit { samples, out } => {
            let records = read_samples_csv(samples)?;
            let report = fit(&planar_samples(&records, config.fit.max_abs_y), &config.fit)?;
            let out = out.as_ref().unwrap_or(&args.calib);
            let published = cell.publish_to(&report, out)?;
            println!(
                "v{}: {}",
                published.version(),
                serde_json::to_string_pretty(published.params())?
            );
            println!(
                "rms {:.3} mm, {} iterations, {} samples used, {} rejected -> {}",
                report.rms(),
                report.iterations(),
                report.samples_used(),
                report.samples_rejected(),
                out.display()
            );
        }
        Cmd::Mission(cmd) => run_mission(&args, &config, cell, cmd)?,
    }

    Ok(())
}

fn run_mission(
    args: &Args,
    config: &ArmConfig,
    cell: CalibrationCell,
    cmd: &MissionCmd,
) -> Result<(), Box<dyn Error>> {
    let mut store = MissionStore::open(&args.missions)?;

    match cmd {
        MissionCmd::Create { name, intro } => {
            store.create(name, intro)?;
        }
        MissionCmd::List => {
            for name in store.list() {
                println!("{}", name);
            }
        }
        MissionCmd::Show { name } => {
            println!("{}", serde_json::to_string_pretty(store.get(name)?)?);
        }
        MissionCmd::AppendPose { name, label } => {
            let controller = connect(args, config, cell)?;
            let index = store.record_current_pose(name, &controller, label.clone())?;
            println!("step {}", index);
        }
        MissionCmd::Delete { name, index } => match index {
            Some(index) => {
                store.delete(name, *index)?;
            }
            None => {
                store.remove(name)?;
            }
        },
        MissionCmd::Play { name, times } => {
            let controller = connect(args, config, cell)?;
            store.play(name, *times, &controller)?;
        }
    }
    Ok(())
}
