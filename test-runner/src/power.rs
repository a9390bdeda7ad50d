//! Named power/reset lines switched with a two-phase prepare/commit
//! protocol.
//!
//! Changes are staged with [`PowerController::prepare`] and driven to the
//! hardware together by [`PowerController::commit`], so the target never
//! sees a half-applied combination such as reset released while power is
//! still off. One lock per bank serializes commits.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineState {
    On,
    Off,
    Unset,
}

/// Desired state per line name. Names are unique by construction; a name
/// repeated in a deserialized map is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PowerPlan {
    lines: BTreeMap<String, LineState>,
}

impl<'de> Deserialize<'de> for PowerPlan {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PlanVisitor;

        impl<'de> Visitor<'de> for PlanVisitor {
            type Value = PowerPlan;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of power line names to on/off/unset")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<PowerPlan, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(pair) = map.next_entry::<String, LineState>()? {
                    pairs.push(pair);
                }
                PowerPlan::from_pairs(pairs).map_err(|err| match err {
                    Error::Config(msg) => de::Error::custom(msg),
                    other => de::Error::custom(other),
                })
            }
        }

        deserializer.deserialize_map(PlanVisitor)
    }
}

impl PowerPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a plan from pairs, rejecting a name given twice.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, LineState)>,
        S: Into<String>,
    {
        let mut plan = Self::new();
        for (name, state) in pairs {
            let name = name.into();
            if plan.lines.insert(name.clone(), state).is_some() {
                return Err(Error::config(format!("power line `{name}` listed twice in plan")));
            }
        }
        Ok(plan)
    }

    /// Every line in `names` set to `state`.
    pub fn uniform<I, S>(names: I, state: LineState) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: names.into_iter().map(|name| (name.into(), state)).collect(),
        }
    }

    pub fn set(mut self, name: impl Into<String>, state: LineState) -> Self {
        self.lines.insert(name.into(), state);
        self
    }

    pub fn get(&self, name: &str) -> Option<LineState> {
        self.lines.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, LineState)> {
        self.lines.iter().map(|(name, state)| (name.as_str(), *state))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn merge(&mut self, delta: &PowerPlan) {
        for (name, state) in delta.iter() {
            self.lines.insert(name.to_owned(), state);
        }
    }

    /// Checks every line exists in `known`, and, if `require_set`, that none
    /// is [`LineState::Unset`].
    pub(crate) fn validate(&self, known: &BTreeSet<String>, require_set: bool) -> Result<()> {
        for (name, state) in self.iter() {
            if !known.contains(name) {
                return Err(Error::config(format!("unknown power line `{name}`")));
            }
            if require_set && state == LineState::Unset {
                return Err(Error::config(format!("power line `{name}` is unset")));
            }
        }
        Ok(())
    }

    fn to_levels(&self) -> BTreeMap<String, bool> {
        self.iter()
            .map(|(name, state)| (name.to_owned(), state == LineState::On))
            .collect()
    }
}

/// Hardware (or stand-in) exposing named binary lines.
pub trait PowerBank: Send {
    fn lines(&self) -> &[String];

    /// Drives every listed line; `true` is on. Called once per commit with
    /// the full set of changes.
    fn apply(&mut self, levels: &BTreeMap<String, bool>) -> io::Result<()>;
}

/// In-memory bank. Commits are recorded and can be inspected through a
/// [`BankRecorder`].
#[derive(Debug)]
pub struct MemoryBank {
    lines: Vec<String>,
    recorder: BankRecorder,
}

#[derive(Debug, Clone, Default)]
pub struct BankRecorder {
    commits: Arc<Mutex<Vec<BTreeMap<String, bool>>>>,
}

impl BankRecorder {
    /// Every applied commit, oldest first.
    pub fn commits(&self) -> Vec<BTreeMap<String, bool>> {
        self.commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The level of each line after all commits so far.
    pub fn levels(&self) -> BTreeMap<String, bool> {
        let mut levels = BTreeMap::new();
        for commit in self.commits() {
            levels.extend(commit);
        }
        levels
    }
}

impl MemoryBank {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            recorder: BankRecorder::default(),
        }
    }

    pub fn recorder(&self) -> BankRecorder {
        self.recorder.clone()
    }
}

impl PowerBank for MemoryBank {
    fn lines(&self) -> &[String] {
        &self.lines
    }

    fn apply(&mut self, levels: &BTreeMap<String, bool>) -> io::Result<()> {
        self.recorder
            .commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(levels.clone());
        Ok(())
    }
}

/// Switches lines by running `<program> <args..> <line> on|off` once per
/// line, for relay boards driven by a vendor command-line tool.
#[derive(Debug)]
pub struct CommandBank {
    program: PathBuf,
    args: Vec<String>,
    lines: Vec<String>,
}

impl CommandBank {
    pub fn new(program: &str, args: Vec<String>, lines: Vec<String>) -> Result<Self> {
        let program = which::which(program)
            .map_err(|err| Error::config(format!("power command `{program}`: {err}")))?;
        Ok(Self {
            program,
            args,
            lines,
        })
    }
}

impl PowerBank for CommandBank {
    fn lines(&self) -> &[String] {
        &self.lines
    }

    fn apply(&mut self, levels: &BTreeMap<String, bool>) -> io::Result<()> {
        for (line, on) in levels {
            let level = if *on { "on" } else { "off" };
            let status = Command::new(&self.program)
                .args(&self.args)
                .arg(line)
                .arg(level)
                .status()?;
            if !status.success() {
                return Err(io::Error::other(format!(
                    "`{} {line} {level}` failed with {status}",
                    self.program.display()
                )));
            }
        }
        Ok(())
    }
}

struct Inner {
    bank: Box<dyn PowerBank>,
    staged: PowerPlan,
}

pub struct PowerController {
    name: String,
    known: BTreeSet<String>,
    safe: PowerPlan,
    inner: Mutex<Inner>,
}

impl PowerController {
    /// Wraps `bank`. `safe` is the teardown plan; by default every line off.
    pub fn new(
        name: impl Into<String>,
        bank: Box<dyn PowerBank>,
        safe: Option<PowerPlan>,
    ) -> Result<Self> {
        let name = name.into();
        let mut known = BTreeSet::new();
        for line in bank.lines() {
            if !known.insert(line.clone()) {
                return Err(Error::config(format!(
                    "power line `{line}` defined twice in bank `{name}`"
                )));
            }
        }
        let safe = safe.unwrap_or_else(|| PowerPlan::uniform(known.iter().cloned(), LineState::Off));
        safe.validate(&known, true)?;

        Ok(Self {
            name,
            known,
            safe,
            inner: Mutex::new(Inner {
                bank,
                staged: PowerPlan::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }

    /// Stages `delta` on top of earlier prepares without touching hardware.
    /// A later prepare of the same line wins.
    pub fn prepare(&self, delta: &PowerPlan) -> Result<()> {
        delta.validate(&self.known, false)?;
        self.lock().staged.merge(delta);
        Ok(())
    }

    /// Snapshot of what the next commit would apply.
    pub fn staged(&self) -> PowerPlan {
        self.lock().staged.clone()
    }

    /// Applies everything staged in one bank operation and clears the
    /// stage. A staged `Unset` line fails before any line is driven.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.lock();
        let staged = std::mem::take(&mut inner.staged);
        if staged.is_empty() {
            return Ok(());
        }
        staged.validate(&self.known, true)?;

        tracing::info!(bank = %self.name, plan = ?staged, "committing power plan");
        inner
            .bank
            .apply(&staged.to_levels())
            .map_err(|err| Error::io(format!("power bank `{}`", self.name), err))
    }

    /// Prepares and commits `plan` under a single lock hold.
    pub fn apply(&self, plan: &PowerPlan) -> Result<()> {
        plan.validate(&self.known, true)?;
        let mut inner = self.lock();
        let mut staged = std::mem::take(&mut inner.staged);
        staged.merge(plan);
        staged.validate(&self.known, true)?;
        tracing::info!(bank = %self.name, plan = ?staged, "applying power plan");
        inner
            .bank
            .apply(&staged.to_levels())
            .map_err(|err| Error::io(format!("power bank `{}`", self.name), err))
    }

    /// Drops anything staged and drives the safe plan. Usable at any time,
    /// including after a failed commit.
    pub fn set_all_off(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.staged = PowerPlan::new();
        tracing::info!(bank = %self.name, "driving power bank to safe state");
        inner
            .bank
            .apply(&self.safe.to_levels())
            .map_err(|err| Error::io(format!("power bank `{}`", self.name), err))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for PowerController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerController")
            .field("name", &self.name)
            .field("lines", &self.known)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (PowerController, BankRecorder) {
        let bank = MemoryBank::new(["power", "reset"]);
        let recorder = bank.recorder();
        let ctl = PowerController::new("bench", Box::new(bank), None).unwrap();
        (ctl, recorder)
    }

    fn levels(pairs: &[(&str, bool)]) -> BTreeMap<String, bool> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
    }

    #[test]
    fn prepare_does_not_touch_hardware() {
        let (ctl, recorder) = controller();
        ctl.prepare(&PowerPlan::new().set("power", LineState::On)).unwrap();
        assert!(recorder.commits().is_empty());
        assert_eq!(ctl.staged().get("power"), Some(LineState::On));
    }

    #[test]
    fn prepares_commit_as_one_combined_state() {
        let (ctl, recorder) = controller();
        ctl.prepare(&PowerPlan::new().set("power", LineState::On)).unwrap();
        ctl.prepare(&PowerPlan::new().set("reset", LineState::Off)).unwrap();
        ctl.commit().unwrap();

        assert_eq!(
            recorder.commits(),
            vec![levels(&[("power", true), ("reset", false)])]
        );
        assert!(ctl.staged().is_empty());

        // Nothing staged: nothing applied.
        ctl.commit().unwrap();
        assert_eq!(recorder.commits().len(), 1);
    }

    #[test]
    fn concurrent_prepares_share_one_commit() {
        let (ctl, recorder) = controller();
        let ctl = Arc::new(ctl);
        let threads: Vec<_> = ["power", "reset"]
            .into_iter()
            .map(|line| {
                let ctl = Arc::clone(&ctl);
                std::thread::spawn(move || {
                    ctl.prepare(&PowerPlan::new().set(line, LineState::On)).unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        ctl.commit().unwrap();
        assert_eq!(
            recorder.commits(),
            vec![levels(&[("power", true), ("reset", true)])]
        );
    }

    #[test]
    fn unknown_line_fails_fast() {
        let (ctl, recorder) = controller();
        let err = ctl
            .prepare(&PowerPlan::new().set("vbus", LineState::On))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(ctl.staged().is_empty());
        assert!(recorder.commits().is_empty());
    }

    #[test]
    fn unset_line_fails_before_any_line_is_driven() {
        let (ctl, recorder) = controller();
        ctl.prepare(
            &PowerPlan::new()
                .set("power", LineState::On)
                .set("reset", LineState::Unset),
        )
        .unwrap();
        let err = ctl.commit().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(recorder.commits().is_empty());
    }

    #[test]
    fn safe_state_reachable_after_failure() {
        let (ctl, recorder) = controller();
        ctl.prepare(&PowerPlan::new().set("reset", LineState::Unset)).unwrap();
        assert!(ctl.commit().is_err());
        ctl.prepare(&PowerPlan::new().set("power", LineState::On)).unwrap();
        ctl.set_all_off().unwrap();
        assert!(ctl.staged().is_empty());
        assert_eq!(
            recorder.levels(),
            levels(&[("power", false), ("reset", false)])
        );
    }

    #[test]
    fn apply_rejects_unset_line_left_in_stage() {
        let (ctl, recorder) = controller();
        ctl.prepare(&PowerPlan::new().set("reset", LineState::Unset)).unwrap();
        let err = ctl
            .apply(&PowerPlan::new().set("power", LineState::On))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
        assert!(recorder.commits().is_empty());
        assert!(ctl.staged().is_empty());
    }

    #[test]
    fn apply_drives_stage_and_plan_together() {
        let (ctl, recorder) = controller();
        ctl.prepare(&PowerPlan::new().set("reset", LineState::On)).unwrap();
        ctl.apply(&PowerPlan::new().set("power", LineState::On)).unwrap();
        assert_eq!(
            recorder.commits(),
            vec![levels(&[("power", true), ("reset", true)])]
        );
        assert!(ctl.staged().is_empty());
    }

    #[test]
    fn repeated_line_in_json_plan_is_rejected() {
        let err = serde_json::from_str::<PowerPlan>(r#"{"power": "on", "power": "off"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("listed twice"), "{err}");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = PowerPlan::from_pairs([("power", LineState::On), ("power", LineState::Off)])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let bank = MemoryBank::new(["power", "power"]);
        assert!(PowerController::new("dup", Box::new(bank), None).is_err());
    }

    #[test]
    fn plan_deserializes_from_json() {
        let plan: PowerPlan = serde_json::from_str(r#"{"power": "on", "reset": "off"}"#).unwrap();
        assert_eq!(plan.get("power"), Some(LineState::On));
        assert_eq!(plan.get("reset"), Some(LineState::Off));
        assert_eq!(plan.len(), 2);
    }
}
