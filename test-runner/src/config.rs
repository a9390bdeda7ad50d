//! Platform file: maps platform ids to target kinds.
//!
//! ```json
//! {
//!   "platforms": {
//!     "qemu_x86_64": {
//!       "kind": "virtual",
//!       "program": "qemu-system-x86_64",
//!       "args": ["-nographic", "-kernel", "build/kernel.elf"],
//!       "boot_pattern": "*** Booting"
//!     },
//!     "bench_board": {
//!       "kind": "physical",
//!       "console": { "device": "/dev/ttyUSB0" },
//!       "power": {
//!         "lines": ["power", "reset"],
//!         "backend": { "type": "command", "program": "relayctl" },
//!         "on": { "power": "on", "reset": "off" }
//!       }
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::matcher::Pattern;
use crate::power::{CommandBank, MemoryBank, PowerBank, PowerController, PowerPlan};
use crate::supervisor::{CommandSpec, DEFAULT_TERMINATE_TIMEOUT};

const DEFAULT_BOOT_TIMEOUT_SECS: u64 = 60;

fn default_boot_timeout() -> u64 {
    DEFAULT_BOOT_TIMEOUT_SECS
}

fn default_terminate_timeout() -> u64 {
    DEFAULT_TERMINATE_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub platforms: BTreeMap<String, PlatformConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformConfig {
    Virtual(VirtualConfig),
    Physical(PhysicalConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootConfig {
    /// Line marking boot completion. Without it the target is ready as soon
    /// as its stream is readable.
    #[serde(default)]
    pub boot_pattern: Option<String>,
    #[serde(default)]
    pub boot_regex: bool,
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,
}

impl BootConfig {
    pub fn pattern(&self) -> Result<Option<Pattern>> {
        self.boot_pattern
            .as_deref()
            .map(|p| {
                if self.boot_regex {
                    Pattern::regex(p)
                } else {
                    Ok(Pattern::literal(p))
                }
            })
            .transpose()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(flatten)]
    pub boot: BootConfig,
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,
}

impl VirtualConfig {
    pub fn command(&self) -> CommandSpec {
        CommandSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            tag: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleConfig {
    /// Serial device, read until it disconnects.
    Device(PathBuf),
    /// Log file followed as it grows.
    Tail(PathBuf),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhysicalConfig {
    pub console: ConsoleConfig,
    pub power: PowerConfig,
    #[serde(flatten)]
    pub boot: BootConfig,
    /// Delay after the power-on commit before the console is considered
    /// readable.
    #[serde(default)]
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Memory,
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct PowerConfig {
    pub lines: Vec<String>,
    pub backend: BackendConfig,
    pub on: PowerPlan,
    /// Teardown plan; every line off when absent.
    #[serde(default)]
    pub off: Option<PowerPlan>,
}

impl PowerConfig {
    fn validate(&self) -> Result<()> {
        let mut known = BTreeSet::new();
        for line in &self.lines {
            if !known.insert(line.clone()) {
                return Err(Error::config(format!("power line `{line}` defined twice")));
            }
        }
        self.on.validate(&known, true)?;
        if let Some(off) = &self.off {
            off.validate(&known, true)?;
        }
        Ok(())
    }

    pub fn controller(&self, name: &str) -> Result<PowerController> {
        self.validate()?;
        let bank: Box<dyn PowerBank> = match &self.backend {
            BackendConfig::Memory => Box::new(MemoryBank::new(self.lines.iter().cloned())),
            BackendConfig::Command { program, args } => Box::new(CommandBank::new(
                program,
                args.clone(),
                self.lines.clone(),
            )?),
        };
        PowerController::new(name, bank, self.off.clone())
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file_err = |source: Box<dyn std::error::Error + Send + Sync>| Error::ConfigFile {
            path: path.to_path_buf(),
            source,
        };
        let text = std::fs::read_to_string(path).map_err(|err| file_err(err.into()))?;
        let config: Self = serde_json::from_str(&text).map_err(|err| file_err(err.into()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), platforms = config.platforms.len(), "loaded platform config");
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| Error::config(format!("invalid platform config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn platform(&self, id: &str) -> Result<&PlatformConfig> {
        self.platforms.get(id).ok_or_else(|| {
            let known: Vec<_> = self.platforms.keys().map(String::as_str).collect();
            Error::config(format!(
                "unknown platform `{id}` (known: {})",
                known.join(", ")
            ))
        })
    }

    fn validate(&self) -> Result<()> {
        for (id, platform) in &self.platforms {
            let boot = match platform {
                PlatformConfig::Virtual(v) => &v.boot,
                PlatformConfig::Physical(p) => {
                    p.power.validate().map_err(|err| in_platform(id, err))?;
                    &p.boot
                }
            };
            boot.pattern().map_err(|err| in_platform(id, err))?;
        }
        Ok(())
    }
}

fn in_platform(id: &str, err: Error) -> Error {
    match err {
        Error::Config(msg) => Error::Config(format!("platform `{id}`: {msg}")),
        other => other,
    }
}
