use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::tasks::TaskSelection;

#[derive(Debug, Parser)]
#[command(name = "sgz-assistant", version, about = "Automation assistant for SGZ on iPad")]
pub struct Cli {
    /// Path to config.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging and debug artifacts
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    /// Which tasks to run
    #[arg(short, long, value_enum, default_value_t = TaskSelection::All)]
    pub task: TaskSelection,

    /// Minutes to run; 0 runs until interrupted
    #[arg(long, default_value_t = 0)]
    pub duration: u64,

    /// Log gestures instead of sending them
    #[arg(long)]
    pub dry_run: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            task: TaskSelection::All,
            duration: 0,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the task loop (default)
    Run(RunArgs),
    /// Analyze the current screen once and print the result as JSON
    Analyze {
        /// Use the vision model even if it is disabled in the config
        #[arg(long)]
        vlm: bool,
        /// Write an annotated screenshot to this path
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Print ranked action suggestions for the current screen
    Suggest,
    /// Locate one template on the current screen
    Find { name: String },
    /// Capture a screenshot to a file
    Screenshot { path: PathBuf },
    /// Print device, analysis and automation statistics
    Stats,
    /// Interactive shell
    Interactive,
    /// Tap a sequence of elements as one workflow
    Workflow {
        /// Element names, tapped in order
        #[arg(required = true)]
        elements: Vec<String>,
        /// Seconds to wait for each element to appear
        #[arg(long, default_value_t = 10)]
        timeout: u64,
        /// Pause between taps in milliseconds
        #[arg(long, default_value_t = 1000)]
        pause_ms: u64,
    },
    /// Manage the pymobiledevice3 tunnel daemon
    Tunneld {
        #[command(subcommand)]
        action: TunneldAction,
    },
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum TunneldAction {
    Start,
    Stop,
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::parse_from(["sgz-assistant", "--debug"]);
        assert!(cli.debug);
        assert!(cli.command.is_none());
    }

    #[test]
    fn run_flags() {
        let cli = Cli::parse_from([
            "sgz-assistant",
            "run",
            "--task",
            "land",
            "--duration",
            "30",
            "--dry-run",
            "--config",
            "custom.toml",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.task, TaskSelection::Land);
        assert_eq!(args.duration, 30);
        assert!(args.dry_run);
    }

    #[test]
    fn analysis_subcommands() {
        let cli = Cli::parse_from(["sgz-assistant", "analyze", "--vlm", "--save", "out.png"]);
        assert!(matches!(cli.command, Some(Command::Analyze { vlm: true, save: Some(_) })));
        let cli = Cli::parse_from(["sgz-assistant", "find", "confirm_button"]);
        assert!(matches!(cli.command, Some(Command::Find { name }) if name == "confirm_button"));
        let cli = Cli::parse_from(["sgz-assistant", "tunneld", "status"]);
        assert!(matches!(
            cli.command,
            Some(Command::Tunneld { action: TunneldAction::Status })
        ));
        assert!(Cli::try_parse_from(["sgz-assistant", "run", "--task", "everything"]).is_err());
    }

    #[test]
    fn workflow_takes_element_names() {
        let cli = Cli::parse_from([
            "sgz-assistant",
            "workflow",
            "world_map",
            "confirm_button",
            "--timeout",
            "5",
        ]);
        let Some(Command::Workflow { elements, timeout, pause_ms }) = cli.command else {
            panic!("expected workflow");
        };
        assert_eq!(elements, vec!["world_map", "confirm_button"]);
        assert_eq!((timeout, pause_ms), (5, 1000));
        assert!(Cli::try_parse_from(["sgz-assistant", "workflow"]).is_err());
    }
}
