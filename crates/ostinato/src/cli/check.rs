use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use ostinato::config::Config;
use ostinato::schedule::Schedule;
use ostinato::sim;

#[derive(Args)]
pub struct CheckArgs {
    /// Path to the printer description (TOML or JSON).
    #[arg(long)]
    pub config: PathBuf,

    /// Path to the planner schedule (TOML or JSON).
    pub schedule: PathBuf,
}

impl CheckArgs {
    pub fn run(&self) -> Result<()> {
        let config = Config::from_file(&self.config)?;
        config.validate()?;
        let schedule = Schedule::from_file(&self.schedule)?;
        let names: Vec<&str> = config.steppers.iter().map(|s| s.name.as_str()).collect();
        schedule.validate(&names)?;

        let outcome = sim::run_schedule(&config, &schedule)?;
        let mut total_steps = 0usize;
        let mut total_commands = 0usize;
        for stepper in &outcome.steppers {
            let max_deviation = stepper
                .verify()
                .with_context(|| format!("stepper {} failed verification", stepper.name))?;
            let commands = stepper.queue_step_commands();
            let pulses = stepper.pulses.len();
            let ratio = if commands > 0 {
                pulses as f64 / commands as f64
            } else {
                0.0
            };
            tracing::info!(
                "{}: {} steps ({} filtered) -> {} queue_step commands \
                 ({ratio:.1} steps/cmd), max deviation {} ticks, net {}",
                stepper.name,
                stepper.steps_in,
                stepper.steps_filtered,
                commands,
                max_deviation,
                stepper.net_position,
            );
            total_steps += pulses;
            total_commands += commands;
        }
        println!(
            "OK: {} pulses in {} commands across {} steppers",
            total_steps,
            total_commands,
            outcome.steppers.len()
        );
        Ok(())
    }
}
