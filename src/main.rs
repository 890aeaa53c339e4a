//! CLI entry point.

use std::process::ExitCode;

use procbox::cli::{
    Cli, EXIT_INTERNAL_ERROR, EXIT_INVALID_CONFIG, EXIT_PRE_COMMAND_FAILED, EXIT_SETUP_FAILURE,
};
use procbox::config::{load_config, load_default_config};
use procbox::error::SandboxError;
use procbox::manager::SandboxManager;
use procbox::utils::init_logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.debug);

    let config = match cli.settings_path() {
        Some(path) if path.exists() => match load_config(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error loading config from {}: {e}", path.display());
                return ExitCode::from(EXIT_INVALID_CONFIG);
            }
        },
        _ => match load_default_config() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error loading default config: {e}");
                return ExitCode::from(EXIT_INVALID_CONFIG);
            }
        },
    };

    let manager = match SandboxManager::new() {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("failed to create sandbox manager: {e}");
            return ExitCode::from(EXIT_INTERNAL_ERROR);
        }
    };

    if let Err(e) = manager.initialize(config).await {
        eprintln!("failed to initialize sandbox: {e}");
        manager.reset().await;
        return ExitCode::from(exit_code_for(&e));
    }

    let command = cli.command_string();
    let wrapped = match manager.wrap_with_sandbox(&command).await {
        Ok(wrapped) => wrapped,
        Err(e) => {
            eprintln!("failed to wrap command: {e}");
            manager.reset().await;
            return ExitCode::from(exit_code_for(&e));
        }
    };
    let execution_id = manager.last_execution_id();

    tracing::debug!("wrapped command: {}", wrapped);

    let status = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(&wrapped)
        .status()
        .await;

    let code = match status {
        Ok(status) => match status.code() {
            Some(code) => code,
            // Terminated by signal.
            None => 128,
        },
        Err(e) => {
            eprintln!("failed to execute command: {e}");
            manager.reset().await;
            return ExitCode::from(EXIT_INTERNAL_ERROR);
        }
    };

    if let Some(execution_id) = execution_id {
        manager.finish_execution(execution_id, code);
    }

    report_violations(&manager);
    manager.reset().await;

    // The wrapped shell exits 66 when the pre-command fails; the user
    // command's own exit code passes through otherwise.
    if code == i32::from(EXIT_PRE_COMMAND_FAILED) {
        eprintln!("{}", SandboxError::PreCommandFailed { exit_code: code });
    }
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn exit_code_for(error: &SandboxError) -> u8 {
    match error {
        SandboxError::InvalidConfig { .. } | SandboxError::AlreadyInitialized => {
            EXIT_INVALID_CONFIG
        }
        SandboxError::ProxyBind { .. }
        | SandboxError::HostNotSupported
        | SandboxError::ToolchainMissing { .. } => EXIT_SETUP_FAILURE,
        _ => EXIT_INTERNAL_ERROR,
    }
}

fn report_violations(manager: &SandboxManager) {
    let store = manager.get_violation_store();
    let violations = store.get_violations(None);
    if violations.is_empty() {
        return;
    }

    eprintln!("\n--- sandbox violations ({}) ---", violations.len());
    for violation in violations {
        eprintln!("  [{:?}] {}", violation.kind, violation.subject);
    }
}
