use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Printer description consumed by the ostinato tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target microcontroller timing
    #[serde(default)]
    pub mcu: McuConfig,

    /// Steppers driven through the synchronizer
    pub steppers: Vec<StepperConfig>,
}

/// Microcontroller timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McuConfig {
    /// Clock frequency in Hz
    #[serde(default = "default_frequency")]
    pub frequency: f64,

    /// Depth of the mcu move queue
    #[serde(default = "default_move_queue_depth")]
    pub move_queue_depth: usize,
}

impl Default for McuConfig {
    fn default() -> Self {
        Self {
            frequency: default_frequency(),
            move_queue_depth: default_move_queue_depth(),
        }
    }
}

/// One stepper declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepperConfig {
    /// Name the schedule refers to this stepper by
    pub name: String,

    /// Object id used in mcu commands
    pub oid: u32,

    /// Largest allowed deviation of an emitted pulse, in mcu ticks
    #[serde(default = "default_max_error_ticks")]
    pub max_error_ticks: u32,

    /// Flip the logical-to-physical direction mapping
    #[serde(default)]
    pub invert_dir: bool,

    /// Wire tag of the queue_step command
    #[serde(default = "default_queue_step_msgtag")]
    pub queue_step_msgtag: i32,

    /// Wire tag of the set_next_step_dir command
    #[serde(default = "default_set_next_step_dir_msgtag")]
    pub set_next_step_dir_msgtag: i32,
}

fn default_frequency() -> f64 {
    16_000_000.0
}

fn default_move_queue_depth() -> usize {
    16
}

fn default_max_error_ticks() -> u32 {
    400
}

fn default_queue_step_msgtag() -> i32 {
    1
}

fn default_set_next_step_dir_msgtag() -> i32 {
    2
}

impl Config {
    /// Load configuration from a file, auto-detecting TOML or JSON format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        // Try to determine format from extension
        let extension = path.extension().and_then(|s| s.to_str());

        match extension {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => {
                // Try TOML first (preferred), fall back to JSON
                Self::from_toml(&content).or_else(|_| Self::from_json(&content))
            }
        }
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config as TOML")
    }

    /// Parse configuration from JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse config as JSON")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mcu.frequency <= 0.0 {
            anyhow::bail!("mcu.frequency must be positive");
        }
        if self.mcu.move_queue_depth == 0 {
            anyhow::bail!("mcu.move_queue_depth must be at least 1");
        }
        if self.steppers.is_empty() {
            anyhow::bail!("at least one stepper must be configured");
        }
        for stepper in &self.steppers {
            if stepper.name.is_empty() {
                anyhow::bail!("stepper names cannot be empty");
            }
            if stepper.queue_step_msgtag == stepper.set_next_step_dir_msgtag {
                anyhow::bail!("stepper {}: command tags must differ", stepper.name);
            }
        }
        let mut oids: Vec<u32> = self.steppers.iter().map(|s| s.oid).collect();
        oids.sort_unstable();
        oids.dedup();
        if oids.len() != self.steppers.len() {
            anyhow::bail!("stepper oids must be unique");
        }
        let mut names: Vec<&str> = self.steppers.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.steppers.len() {
            anyhow::bail!("stepper names must be unique");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[mcu]
frequency = 16000000.0
move_queue_depth = 8

[[steppers]]
name = "stepper_x"
oid = 0
max_error_ticks = 320

[[steppers]]
name = "stepper_y"
oid = 1
invert_dir = true
"#;

        let config = Config::from_toml(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mcu.move_queue_depth, 8);
        assert_eq!(config.steppers.len(), 2);
        assert_eq!(config.steppers[0].max_error_ticks, 320);
        assert!(config.steppers[1].invert_dir);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "mcu": { "frequency": 1000000.0 },
            "steppers": [
                { "name": "stepper_x", "oid": 0 }
            ]
        }"#;

        let config = Config::from_json(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mcu.frequency, 1_000_000.0);
        assert_eq!(config.mcu.move_queue_depth, 16);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("[[steppers]]\nname = \"a\"\noid = 0\n").unwrap();
        assert_eq!(config.mcu.frequency, 16_000_000.0);
        assert_eq!(config.steppers[0].max_error_ticks, 400);
        assert_eq!(config.steppers[0].queue_step_msgtag, 1);
        assert!(!config.steppers[0].invert_dir);
    }

    #[test]
    fn test_rejects_duplicate_oids() {
        let toml = r#"
[[steppers]]
name = "a"
oid = 0

[[steppers]]
name = "b"
oid = 0
"#;
        let config = Config::from_toml(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
