use anyhow::Result;
use clap::{Args, Subcommand};
use xshell::{Shell, cmd};

#[derive(Subcommand)]
pub enum Command {
    /// Run the CI gauntlet: fmt check, clippy, then tests in both
    /// verifier configurations
    Ci,
    /// Apply rustfmt to the workspace
    Fmt,
    /// Run tests
    Test(Test),
}

#[derive(Args, Default)]
pub struct Test {
    /// Limit the run to one workspace package
    #[arg(short, long)]
    package: Option<String>,

    /// Also run ostinato-core with the move verifier compiled out
    #[arg(long)]
    unchecked: bool,
}

impl Command {
    pub fn run(self, sh: &Shell) -> Result<()> {
        match self {
            Command::Ci => ci(sh),
            Command::Fmt => {
                cmd!(sh, "cargo fmt --all").run()?;
                Ok(())
            }
            Command::Test(test) => test.run(sh),
        }
    }
}

fn ci(sh: &Shell) -> Result<()> {
    eprintln!("Checking formatting...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    eprintln!("Running clippy...");
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    Test {
        unchecked: true,
        ..Test::default()
    }
    .run(sh)
}

impl Test {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        eprintln!("Running tests...");
        let mut cargo = cmd!(sh, "cargo test");
        if let Some(package) = &self.package {
            cargo = cargo.arg("-p").arg(package);
        }
        cargo.run()?;

        if self.unchecked {
            // The unchecked feature swaps out the per-move verification
            // path; both configurations have to build and pass
            eprintln!("Running ostinato-core tests without line checks...");
            cmd!(sh, "cargo test -p ostinato-core --features unchecked").run()?;
        }
        Ok(())
    }
}
