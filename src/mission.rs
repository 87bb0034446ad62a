// Mission store: named, ordered lists of verbatim firmware commands
//
// Steps are never interpreted. Playback sends each one exactly as stored, in
// index order; indices are 0-based and renumbered after every edit. On disk
// each mission is one pretty-printed `<name>.mission.json` file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::arm::{ArmLink, MotionController};
use crate::error::{ArmError, Result};
use crate::messages::{Command, JointMove};
use crate::persist::write_atomic;

const MISSION_SUFFIX: &str = ".mission.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionStep {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Firmware command object, sent as-is
    pub command: Value,
}

impl MissionStep {
    /// Step holding `command`; the index is assigned when it is stored
    pub fn new(command: Value) -> Self {
        Self {
            index: 0,
            label: None,
            command,
        }
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub name: String,
    #[serde(default)]
    pub intro: String,
    #[serde(default)]
    pub steps: Vec<MissionStep>,
}

impl Mission {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn renumber(&mut self) {
        for (index, step) in self.steps.iter_mut().enumerate() {
            step.index = index;
        }
    }

    fn index_error(&self, index: usize) -> ArmError {
        ArmError::Index {
            mission: self.name.clone(),
            index,
            len: self.steps.len(),
        }
    }
}

pub struct MissionStore {
    /// None for a store that lives only in memory
    dir: Option<PathBuf>,
    missions: BTreeMap<String, Mission>,
}

impl MissionStore {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            missions: BTreeMap::new(),
        }
    }

    /// Open (creating if needed) a store directory and load every mission in it
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut missions = BTreeMap::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(MISSION_SUFFIX))
            else {
                continue;
            };

            let text = fs::read_to_string(&path)?;
            let mut mission: Mission = serde_json::from_str(&text)?;
            if mission.name != stem {
                return Err(ArmError::Validation(format!(
                    "{} holds mission '{}'; the file name must match",
                    path.display(),
                    mission.name
                )));
            }
            mission.renumber();
            debug!("Loaded mission '{}' from {}", mission.name, path.display());
            missions.insert(mission.name.clone(), mission);
        }

        info!("Opened mission store {} ({} missions)", dir.display(), missions.len());
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            missions,
        })
    }

    /// Mission names, sorted
    pub fn list(&self) -> Vec<&str> {
        self.missions.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Result<&Mission> {
        self.missions
            .get(name)
            .ok_or_else(|| ArmError::Validation(format!("no mission named '{}'", name)))
    }

    /// Create an empty mission; fails if the name is taken
    pub fn create(&mut self, name: &str, intro: &str) -> Result<&Mission> {
        validate_name(name)?;
        if self.missions.contains_key(name) {
            return Err(ArmError::Validation(format!("mission '{}' already exists", name)));
        }

        let mission = Mission {
            name: name.to_string(),
            intro: intro.to_string(),
            steps: Vec::new(),
        };
        self.persist(&mission)?;
        info!("Created mission '{}'", name);
        Ok(self.missions.entry(name.to_string()).or_insert(mission))
    }

    /// Delete a mission and its file
    pub fn remove(&mut self, name: &str) -> Result<Mission> {
        self.get(name)?;
        if let Some(path) = self.path_for(name) {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        info!("Removed mission '{}'", name);
        self.missions
            .remove(name)
            .ok_or_else(|| ArmError::Validation(format!("no mission named '{}'", name)))
    }

    /// Add a step at the end; returns its index
    pub fn append(&mut self, name: &str, step: MissionStep) -> Result<usize> {
        validate_step(&step)?;
        self.update(name, |mission| {
            mission.steps.push(step);
            Ok(mission.steps.len() - 1)
        })
    }

    /// Insert before `index`; `index == len` appends
    pub fn insert(&mut self, name: &str, index: usize, step: MissionStep) -> Result<()> {
        validate_step(&step)?;
        self.update(name, |mission| {
            if index > mission.steps.len() {
                return Err(mission.index_error(index));
            }
            mission.steps.insert(index, step);
            Ok(())
        })
    }

    /// Overwrite the step at `index`, returning the old one
    pub fn replace(&mut self, name: &str, index: usize, step: MissionStep) -> Result<MissionStep> {
        validate_step(&step)?;
        self.update(name, |mission| {
            let Some(slot) = mission.steps.get_mut(index) else {
                return Err(mission.index_error(index));
            };
            Ok(std::mem::replace(slot, step))
        })
    }

    /// Remove the step at `index`; later steps move up by one
    pub fn delete(&mut self, name: &str, index: usize) -> Result<MissionStep> {
        self.update(name, |mission| {
            if index >= mission.steps.len() {
                return Err(mission.index_error(index));
            }
            Ok(mission.steps.remove(index))
        })
    }

    /// Read the live joints and append them as a joint-move step
    pub fn record_current_pose<L: ArmLink>(
        &mut self,
        name: &str,
        controller: &MotionController<L>,
        label: Option<String>,
    ) -> Result<usize> {
        self.get(name)?;

        let feedback = controller.get_pose()?;
        let settings = controller.settings();
        let command = Command::JointMove(JointMove {
            joints: feedback.joints(),
            speed: settings.speed,
            acc: settings.acc,
        })
        .to_value()?;

        let mut step = MissionStep::new(command);
        step.label = label;
        let index = self.append(name, step)?;
        info!(
            "Recorded pose x={:.1} y={:.1} z={:.1} as step {} of '{}'",
            feedback.x, feedback.y, feedback.z, index, name
        );
        Ok(index)
    }

    /// Send every step, in order, `times` times
    ///
    /// The first failing send stops playback and is reported with its
    /// 1-based pass and 0-based step index.
    pub fn play<L: ArmLink>(
        &self,
        name: &str,
        times: i64,
        controller: &MotionController<L>,
    ) -> Result<()> {
        if times <= 0 {
            return Err(ArmError::Validation(format!(
                "play count must be positive, got {}",
                times
            )));
        }
        let passes = u32::try_from(times)
            .map_err(|_| ArmError::Validation(format!("play count {} is too large", times)))?;

        let mission = self.get(name)?;
        if mission.is_empty() {
            warn!("Mission '{}' has no steps", name);
            return Ok(());
        }

        let delay = controller.settings().step_delay();
        info!(
            "Playing '{}': {} steps x {} passes",
            name,
            mission.len(),
            passes
        );

        let mut first = true;
        for pass in 1..=passes {
            for step in &mission.steps {
                if !first {
                    thread::sleep(delay);
                }
                first = false;

                debug!("'{}' pass {} step {}", name, pass, step.index);
                controller
                    .dispatch_raw(&step.command)
                    .map_err(|e| ArmError::Playback {
                        mission: name.to_string(),
                        pass,
                        step: step.index,
                        source: Box::new(e),
                    })?;
            }
        }

        info!("Finished '{}'", name);
        Ok(())
    }

    /// Apply `edit` to a copy, renumber, persist, then commit
    fn update<T>(&mut self, name: &str, edit: impl FnOnce(&mut Mission) -> Result<T>) -> Result<T> {
        let mut mission = self.get(name)?.clone();
        let out = edit(&mut mission)?;
        mission.renumber();
        self.persist(&mission)?;
        self.missions.insert(name.to_string(), mission);
        Ok(out)
    }

    fn persist(&self, mission: &Mission) -> Result<()> {
        let Some(path) = self.path_for(&mission.name) else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(mission)?;
        write_atomic(&path, json.as_bytes())
    }

    fn path_for(&self, name: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}{}", name, MISSION_SUFFIX)))
    }
}

/// Names double as file names
fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ArmError::Validation(format!(
            "mission name '{}' must be non-empty ASCII letters, digits, '_' or '-'",
            name
        )))
    }
}

fn validate_step(step: &MissionStep) -> Result<()> {
    if step.command.is_object() {
        Ok(())
    } else {
        Err(ArmError::Validation(format!(
            "mission steps must be JSON objects, got {}",
            step.command
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::SimLink;
    use crate::arm::link::mock::MockLink;
    use crate::calibration::{Calibration, CalibrationCell, CalibrationParameters};
    use crate::config::ArmConfig;
    use crate::messages::CartesianPose;
    use approx::assert_abs_diff_eq;
    use serde_json::json;

    fn controller<L: ArmLink>(link: L) -> MotionController<L> {
        let mut config = ArmConfig::default();
        config.motion.settle_ms = 0;
        config.motion.step_delay_ms = 0;
        config.motion.feedback_timeout_ms = 20;
        let cell =
            CalibrationCell::new(Calibration::initial(CalibrationParameters::reference()).unwrap());
        MotionController::new(link, cell, &config)
    }

    fn step(n: i64) -> MissionStep {
        MissionStep::new(json!({"T": 114, "led": n}))
    }

    fn store_with_three_steps() -> MissionStore {
        let mut store = MissionStore::in_memory();
        store.create("m", "demo").unwrap();
        for n in 0..3 {
            store.append("m", step(n)).unwrap();
        }
        store
    }

    #[test]
    fn test_play_twice_sends_six_in_order() {
        let store = store_with_three_steps();
        let controller = controller(MockLink::default());

        store.play("m", 2, &controller).unwrap();

        let expected: Vec<Command> = [0, 1, 2, 0, 1, 2]
            .iter()
            .map(|n| Command::Raw(json!({"T": 114, "led": n})))
            .collect();
        assert_eq!(controller.into_link().sent, expected);
    }

    #[test]
    fn test_play_rejects_nonpositive_times() {
        let store = store_with_three_steps();
        let controller = controller(MockLink::default());
        for times in [0, -3] {
            assert!(matches!(
                store.play("m", times, &controller),
                Err(ArmError::Validation(_))
            ));
        }
        assert!(controller.into_link().sent.is_empty());
    }

    #[test]
    fn test_playback_failure_reports_pass_and_step() {
        let store = store_with_three_steps();
        let link = MockLink {
            fail_send_at: Some(4),
            ..MockLink::default()
        };
        let controller = controller(link);

        match store.play("m", 2, &controller) {
            Err(ArmError::Playback {
                mission,
                pass,
                step,
                source,
            }) => {
                assert_eq!(mission, "m");
                assert_eq!(pass, 2);
                assert_eq!(step, 1);
                assert!(matches!(*source, ArmError::Transport(_)));
            }
            other => panic!("expected Playback, got {:?}", other),
        }
        // Nothing after the failing step went out
        assert_eq!(controller.into_link().sent.len(), 4);
    }

    #[test]
    fn test_create_twice_fails() {
        let mut store = MissionStore::in_memory();
        store.create("m", "").unwrap();
        assert!(matches!(
            store.create("m", "again"),
            Err(ArmError::Validation(_))
        ));
        assert!(store.create("../escape", "").is_err());
    }

    #[test]
    fn test_edits_renumber_steps() {
        let mut store = store_with_three_steps();

        store.insert("m", 0, step(9)).unwrap();
        store.insert("m", 4, step(10)).unwrap();
        let old = store.replace("m", 2, step(7)).unwrap();
        assert_eq!(old.command, json!({"T": 114, "led": 1}));
        store.delete("m", 1).unwrap();

        let mission = store.get("m").unwrap();
        let leds: Vec<i64> = mission
            .steps
            .iter()
            .map(|s| s.command["led"].as_i64().unwrap())
            .collect();
        assert_eq!(leds, vec![9, 7, 2, 10]);
        for (i, s) in mission.steps.iter().enumerate() {
            assert_eq!(s.index, i);
        }
    }

    #[test]
    fn test_out_of_range_indices() {
        let mut store = store_with_three_steps();
        assert!(matches!(
            store.insert("m", 4, step(0)),
            Err(ArmError::Index { index: 4, len: 3, .. })
        ));
        assert!(matches!(
            store.replace("m", 3, step(0)),
            Err(ArmError::Index { index: 3, .. })
        ));
        assert!(matches!(
            store.delete("m", 3),
            Err(ArmError::Index { .. })
        ));
        assert_eq!(store.get("m").unwrap().len(), 3);
    }

    #[test]
    fn test_steps_must_be_objects() {
        let mut store = store_with_three_steps();
        assert!(matches!(
            store.append("m", MissionStep::new(json!([1, 2]))),
            Err(ArmError::Validation(_))
        ));
        assert!(store.append("nope", step(0)).is_err());
    }

    #[test]
    fn test_store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = MissionStore::open(dir.path()).unwrap();
            store.create("pick", "pick and place").unwrap();
            store.append("pick", step(1).labelled("lights")).unwrap();
            store.create("other", "").unwrap();
        }

        let mut store = MissionStore::open(dir.path()).unwrap();
        assert_eq!(store.list(), vec!["other", "pick"]);
        let pick = store.get("pick").unwrap();
        assert_eq!(pick.intro, "pick and place");
        assert_eq!(pick.steps[0].label.as_deref(), Some("lights"));

        store.remove("other").unwrap();
        assert!(!dir.path().join("other.mission.json").exists());
        assert_eq!(MissionStore::open(dir.path()).unwrap().list(), vec!["pick"]);
    }

    #[test]
    fn test_file_name_must_match_mission_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.mission.json"),
            r#"{"name": "b", "intro": "", "steps": []}"#,
        )
        .unwrap();

        assert!(matches!(
            MissionStore::open(dir.path()),
            Err(ArmError::Validation(_))
        ));
        assert!(!dir.path().join("b.mission.json").exists());
    }

    #[test]
    fn test_record_then_replay_pose() {
        let mut store = MissionStore::in_memory();
        store.create("m", "").unwrap();

        let recorder = controller(SimLink::new(CalibrationParameters::reference()).unwrap());
        recorder
            .move_to(&CartesianPose::new(300.0, 30.0, 260.0))
            .unwrap();
        let index = store
            .record_current_pose("m", &recorder, Some("above bin".to_string()))
            .unwrap();
        assert_eq!(index, 0);

        let step = &store.get("m").unwrap().steps[0];
        assert_eq!(step.command["T"], json!(102));
        assert_eq!(step.label.as_deref(), Some("above bin"));

        let player = controller(SimLink::new(CalibrationParameters::reference()).unwrap());
        store.play("m", 1, &player).unwrap();
        let fb = player.get_pose().unwrap();
        assert_abs_diff_eq!(fb.x, 300.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fb.y, 30.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fb.z, 260.0, epsilon = 1e-6);
    }
}
