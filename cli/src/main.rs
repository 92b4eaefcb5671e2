//! CLI entrypoint for ember
//!
//! Runs a Lua 5.3 chunk inside the sandboxed machine. Limits come from
//! `ember.toml` and `EMBER_*` environment variables, with built-in
//! defaults underneath; `--unrestricted` bypasses them entirely.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use ember_application::{MachineLimits, ScriptMachinePort};
use ember_infrastructure::LuaMachine;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ember", version, about = "Sandboxed Lua 5.3 script runner")]
struct Cli {
    /// Script file to execute
    script: Option<PathBuf>,

    /// Inline chunk to execute instead of a file
    #[arg(short = 'e', long = "eval", value_name = "CHUNK")]
    eval: Option<String>,

    /// Explicit limits file (default: ./ember.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Keep the unsafe globals (io, os.execute, ...) available
    #[arg(long)]
    trusted: bool,

    /// Disable the instruction and memory limits
    #[arg(long)]
    unrestricted: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let filter = match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"), // -vvv or more
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let limits = if cli.unrestricted {
        MachineLimits::unrestricted()
    } else {
        load_limits(cli.config.as_ref())?
    };
    info!(
        soft_instruction_limit = limits.soft_instruction_limit,
        memory_ceiling = limits.memory_ceiling,
        "starting machine"
    );

    let (source, chunk_name) = match (&cli.eval, &cli.script) {
        (Some(chunk), _) => (chunk.clone(), "=eval".to_string()),
        (None, Some(path)) => (
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
            path.display().to_string(),
        ),
        (None, None) => bail!("a script file or --eval chunk is required"),
    };

    let machine = LuaMachine::new(limits)?;
    if !cli.trusted {
        machine.remove_unsafe_globals()?;
    }

    let results = machine.do_string(&source, &chunk_name)?;
    for value in results.iter() {
        println!("{value}");
    }
    Ok(())
}

/// Layer limits: defaults, then `ember.toml` (or the explicit file), then
/// `EMBER_*` environment variables.
fn load_limits(config: Option<&PathBuf>) -> Result<MachineLimits> {
    let mut figment = Figment::new().merge(Serialized::defaults(MachineLimits::default()));
    let path = config
        .cloned()
        .unwrap_or_else(|| PathBuf::from("ember.toml"));
    if path.exists() {
        figment = figment.merge(Toml::file(&path));
    }
    figment = figment.merge(Env::prefixed("EMBER_"));
    figment.extract().context("invalid limits configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_limits_defaults_without_file() {
        let missing = PathBuf::from("/nonexistent/ember.toml");
        let limits = load_limits(Some(&missing)).unwrap();
        assert_eq!(limits, MachineLimits::default());
    }

    #[test]
    fn test_load_limits_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ember.toml");
        std::fs::write(&path, "memory_ceiling = 1024\n").unwrap();

        let limits = load_limits(Some(&path)).unwrap();
        assert_eq!(limits.memory_ceiling, 1024);
        assert_eq!(
            limits.instruction_quantum,
            MachineLimits::default().instruction_quantum
        );
    }
}
