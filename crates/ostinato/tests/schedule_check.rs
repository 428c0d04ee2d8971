/// Integration test for the schedule -> compression -> replay pipeline
use anyhow::Result;

use ostinato::config::Config;
use ostinato::schedule::Schedule;
use ostinato::sim;

const CONFIG_TOML: &str = r#"
[mcu]
frequency = 1000000.0
move_queue_depth = 8

[[steppers]]
name = "stepper_x"
oid = 0
max_error_ticks = 25

[[steppers]]
name = "stepper_y"
oid = 1
max_error_ticks = 25
invert_dir = true
"#;

fn two_axis_schedule() -> Schedule {
    // X runs a steady cadence forward; Y decelerates in reverse
    let mut steps = Vec::new();
    for i in 1..=60u32 {
        steps.push(ostinato::schedule::StepEvent {
            stepper: "stepper_x".into(),
            dir: 1,
            print_time: i as f64 * 0.001,
            step_time: 0.0,
        });
    }
    let mut t = 0.0;
    for i in 0..40u32 {
        t += 0.0015 + i as f64 * 0.00002;
        steps.push(ostinato::schedule::StepEvent {
            stepper: "stepper_y".into(),
            dir: 0,
            print_time: t,
            step_time: 0.0,
        });
    }
    Schedule { steps }
}

#[test]
fn two_axis_schedule_compresses_within_tolerance() -> Result<()> {
    let config = Config::from_toml(CONFIG_TOML)?;
    config.validate()?;
    let schedule = two_axis_schedule();
    let names: Vec<&str> = config.steppers.iter().map(|s| s.name.as_str()).collect();
    schedule.validate(&names)?;

    let outcome = sim::run_schedule(&config, &schedule)?;
    assert_eq!(outcome.steppers.len(), 2);

    let x = &outcome.steppers[0];
    assert_eq!(x.pulses.len(), 60);
    assert_eq!(x.net_position, 60);
    assert!(x.queue_step_commands() <= 3, "x used {} commands", x.queue_step_commands());
    x.verify()?;

    let y = &outcome.steppers[1];
    assert_eq!(y.pulses.len(), 40);
    assert_eq!(y.net_position, -40);
    y.verify()?;
    Ok(())
}

#[test]
fn schedule_files_round_trip_through_the_loaders() -> Result<()> {
    let dir = std::env::temp_dir().join("ostinato-schedule-check");
    std::fs::create_dir_all(&dir)?;
    let config_path = dir.join("printer.toml");
    std::fs::write(&config_path, CONFIG_TOML)?;
    let schedule_path = dir.join("schedule.json");
    std::fs::write(&schedule_path, serde_json::to_string(&two_axis_schedule())?)?;

    let config = Config::from_file(&config_path)?;
    config.validate()?;
    let schedule = Schedule::from_file(&schedule_path)?;
    let outcome = sim::run_schedule(&config, &schedule)?;
    for stepper in &outcome.steppers {
        stepper.verify()?;
    }

    std::fs::remove_file(&config_path)?;
    std::fs::remove_file(&schedule_path)?;
    Ok(())
}
