use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// A planner-produced step schedule: for every stepper, when each step
/// pulse should fire and in which direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub steps: Vec<StepEvent>,
}

/// One planner step event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    /// Stepper name as declared in the config
    pub stepper: String,

    /// Logical direction (1 = forward, 0 = reverse)
    pub dir: i32,

    /// Planner print time in seconds
    pub print_time: f64,

    /// Offset added to the print time, in seconds
    #[serde(default)]
    pub step_time: f64,
}

impl Schedule {
    /// Load a schedule from a file, auto-detecting TOML or JSON format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read schedule file {}", path.display()))?;

        let extension = path.extension().and_then(|s| s.to_str());
        match extension {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content).or_else(|_| Self::from_json(&content)),
        }
    }

    /// Parse a schedule from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse schedule as TOML")
    }

    /// Parse a schedule from JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse schedule as JSON")
    }

    /// Validate the schedule against a set of known stepper names
    pub fn validate(&self, known: &[&str]) -> Result<()> {
        for (i, event) in self.steps.iter().enumerate() {
            if event.dir != 0 && event.dir != 1 {
                anyhow::bail!("step {i}: dir must be 0 or 1, got {}", event.dir);
            }
            if !known.contains(&event.stepper.as_str()) {
                anyhow::bail!("step {i}: unknown stepper {:?}", event.stepper);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "steps": [
                { "stepper": "stepper_x", "dir": 1, "print_time": 0.001 },
                { "stepper": "stepper_x", "dir": 1, "print_time": 0.001, "step_time": 0.0005 }
            ]
        }"#;
        let schedule = Schedule::from_json(json).unwrap();
        schedule.validate(&["stepper_x"]).unwrap();
        assert_eq!(schedule.steps.len(), 2);
        assert_eq!(schedule.steps[0].step_time, 0.0);
    }

    #[test]
    fn test_rejects_unknown_stepper() {
        let json = r#"{ "steps": [ { "stepper": "ghost", "dir": 1, "print_time": 0.0 } ] }"#;
        let schedule = Schedule::from_json(json).unwrap();
        assert!(schedule.validate(&["stepper_x"]).is_err());
    }

    #[test]
    fn test_rejects_bad_dir() {
        let json = r#"{ "steps": [ { "stepper": "stepper_x", "dir": 2, "print_time": 0.0 } ] }"#;
        let schedule = Schedule::from_json(json).unwrap();
        assert!(schedule.validate(&["stepper_x"]).is_err());
    }
}
