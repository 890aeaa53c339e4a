//! Platform-specific sandbox implementations.
//!
//! Both backends compile on every platform so their policy output stays
//! testable; only process spawning is host-gated at runtime.

pub mod linux;
pub mod macos;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::utils::platform::Platform;

/// Result of checking sandbox dependencies.
#[derive(Debug, Clone, Default)]
pub struct SandboxDependencyCheck {
    /// Missing tools that prevent the sandbox from running.
    pub missing: Vec<String>,
    /// Warnings about degraded functionality.
    pub warnings: Vec<String>,
}

impl SandboxDependencyCheck {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.missing.is_empty() {
            Ok(self)
        } else {
            Err(SandboxError::ToolchainMissing {
                tool: self.missing.join(", "),
            })
        }
    }
}

/// Detect the sandbox host, failing when neither backend applies.
pub fn detect_host() -> Result<Platform> {
    if !Platform::is_supported() {
        return Err(SandboxError::HostNotSupported);
    }
    Platform::current().ok_or(SandboxError::HostNotSupported)
}

/// Check external tool availability for a platform and configuration.
///
/// With `enable_weaker_nested_sandbox` every missing tool degrades to a
/// warning and the corresponding layer is skipped at wrap time.
pub fn check_dependencies(platform: Platform, config: &SandboxConfig) -> SandboxDependencyCheck {
    let mut result = SandboxDependencyCheck::default();

    match platform {
        // sandbox-exec ships with the OS.
        Platform::MacOS => {}
        Platform::Linux => {
            if !linux::check_bwrap() {
                result.missing.push("bwrap".to_string());
            }
            if !config.network.is_unrestricted() && !linux::check_socat() {
                result.missing.push("socat".to_string());
            }
            // The AF_UNIX filter is skipped when explicit sockets are relayed.
            if config.network.allowed_unix_sockets.is_empty()
                && !config.network.is_unrestricted()
                && !linux::seccomp::is_seccomp_available()
            {
                result
                    .missing
                    .push("apply-seccomp (syscall filter helper)".to_string());
            }
        }
    }

    if config.enable_weaker_nested_sandbox && !result.missing.is_empty() {
        for tool in result.missing.drain(..) {
            result
                .warnings
                .push(format!("{tool} unavailable; continuing without it (nested sandbox)"));
        }
    }

    result
}
