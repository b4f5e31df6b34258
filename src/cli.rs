use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const HEADLESS_ENV: &str = "MCVISOR_HEADLESS";

#[derive(Debug, Parser)]
#[command(name = "mcvisor", about = "A Minecraft server supervisor", version)]
pub struct Cli {
    /// Directory containing mcvisor.toml
    #[arg(long, short = 'C', global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Supervise the server (default)
    Run {
        /// Do not read console commands from stdin
        #[arg(long, env = HEADLESS_ENV)]
        headless: bool,
        /// Start the server immediately, overriding server.auto_start
        #[arg(long)]
        auto_start: bool,
    },
    /// Write a starter mcvisor.toml
    Init,
    /// Validate mcvisor.toml and print the launch command
    Check,
}

impl Cli {
    /// The subcommand to run, `run` when none was given.
    pub fn command_or_default(&self) -> Command {
        match &self.command {
            Some(Command::Run {
                headless,
                auto_start,
            }) => Command::Run {
                headless: *headless,
                auto_start: *auto_start,
            },
            Some(Command::Init) => Command::Init,
            Some(Command::Check) => Command::Check,
            None => Command::Run {
                headless: headless_from_env(),
                auto_start: false,
            },
        }
    }
}

/// `MCVISOR_HEADLESS` set to a truthy value.
pub fn headless_from_env() -> bool {
    std::env::var(HEADLESS_ENV)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_is_none() {
        let cli = Cli::try_parse_from(["mcvisor"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.dir.is_none());
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from(["mcvisor", "run", "--headless", "--auto-start"]).unwrap();
        match cli.command.unwrap() {
            Command::Run {
                headless,
                auto_start,
            } => {
                assert!(headless);
                assert!(auto_start);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["mcvisor", "run"]).unwrap();
        match cli.command.unwrap() {
            Command::Run { auto_start, .. } => assert!(!auto_start),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_init_and_check() {
        let cli = Cli::try_parse_from(["mcvisor", "init"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Init)));
        let cli = Cli::try_parse_from(["mcvisor", "check"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Check)));
    }

    #[test]
    fn test_dir_is_global() {
        let cli = Cli::try_parse_from(["mcvisor", "check", "-C", "/srv/mc"]).unwrap();
        assert_eq!(cli.dir, Some(PathBuf::from("/srv/mc")));
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["mcvisor", "daemonize"]).is_err());
    }
}
