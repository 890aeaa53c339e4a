//! CLI argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Exit code for invalid configuration.
pub const EXIT_INVALID_CONFIG: u8 = 64;
/// Exit code for sandbox setup failure.
pub const EXIT_SETUP_FAILURE: u8 = 65;
/// Exit code for a failing pre-command.
pub const EXIT_PRE_COMMAND_FAILED: u8 = 66;
/// Exit code for internal errors.
pub const EXIT_INTERNAL_ERROR: u8 = 70;

/// Run a command under filesystem and network restrictions.
#[derive(Parser, Debug)]
#[command(name = "procbox")]
#[command(about = "Run a command under filesystem and network restrictions")]
#[command(version)]
pub struct Cli {
    /// Enable verbose audit logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Path to a settings file (default: ~/.procbox-settings.json)
    #[arg(short = 's', long = "settings")]
    pub settings: Option<PathBuf>,

    /// The command to run, quoted
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// The user command as a single shell string.
    pub fn command_string(&self) -> String {
        if self.command.len() == 1 {
            self.command[0].clone()
        } else {
            crate::utils::join_args(&self.command)
        }
    }

    /// The settings file path to load, if any exists.
    pub fn settings_path(&self) -> Option<PathBuf> {
        self.settings
            .clone()
            .or_else(crate::config::default_settings_path)
    }
}
