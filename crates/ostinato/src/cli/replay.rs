use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;

use ostinato::config::Config;
use ostinato::schedule::Schedule;
use ostinato::sim::{self, DecodedCommand, Pulse};

#[derive(Args)]
pub struct ReplayArgs {
    /// Path to the printer description (TOML or JSON).
    #[arg(long)]
    pub config: PathBuf,

    /// Path to the planner schedule (TOML or JSON).
    pub schedule: PathBuf,

    /// Dump per-pulse clocks instead of the command stream.
    #[arg(long)]
    pub pulses: bool,
}

#[derive(Serialize)]
struct CommandDump<'a> {
    name: &'a str,
    oid: u32,
    commands: &'a [DecodedCommand],
}

#[derive(Serialize)]
struct PulseDump<'a> {
    name: &'a str,
    oid: u32,
    pulses: &'a [Pulse],
}

impl ReplayArgs {
    pub fn run(&self) -> Result<()> {
        let config = Config::from_file(&self.config)?;
        config.validate()?;
        let schedule = Schedule::from_file(&self.schedule)?;
        let names: Vec<&str> = config.steppers.iter().map(|s| s.name.as_str()).collect();
        schedule.validate(&names)?;

        let outcome = sim::run_schedule(&config, &schedule)?;
        let rendered = if self.pulses {
            let dump: Vec<PulseDump> = outcome
                .steppers
                .iter()
                .map(|s| PulseDump {
                    name: &s.name,
                    oid: s.oid,
                    pulses: &s.pulses,
                })
                .collect();
            serde_json::to_string_pretty(&dump)
        } else {
            let dump: Vec<CommandDump> = outcome
                .steppers
                .iter()
                .map(|s| CommandDump {
                    name: &s.name,
                    oid: s.oid,
                    commands: &s.commands,
                })
                .collect();
            serde_json::to_string_pretty(&dump)
        }
        .context("failed to render JSON")?;
        println!("{rendered}");
        Ok(())
    }
}
