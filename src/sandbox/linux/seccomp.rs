//! Discovery of the prebuilt seccomp helper pair.
//!
//! The helpers are architecture-specific artifacts shipped alongside the
//! binary: `unix-block.bpf` (the filter blocking `socket(AF_UNIX)`) and
//! `apply-seccomp` (loads the filter, then execs the user command).

use std::path::PathBuf;

use crate::error::{Result, SandboxError};
use crate::utils::get_arch;

fn locate(file: &str) -> Result<PathBuf> {
    let arch = get_arch();

    let locations = [
        format!("vendor/seccomp/{arch}/{file}"),
        format!("../vendor/seccomp/{arch}/{file}"),
        format!("../../vendor/seccomp/{arch}/{file}"),
    ];

    for location in &locations {
        let path = PathBuf::from(location);
        if path.exists() {
            return Ok(path);
        }

        if let Ok(exe) = std::env::current_exe() {
            if let Some(exe_dir) = exe.parent() {
                let full_path = exe_dir.join(location);
                if full_path.exists() {
                    return Ok(full_path);
                }
            }
        }
    }

    Err(SandboxError::ToolchainMissing {
        tool: format!("{file} for architecture '{arch}'"),
    })
}

/// Path to the BPF filter for the current architecture.
pub fn get_bpf_path() -> Result<PathBuf> {
    locate("unix-block.bpf")
}

/// Path to the apply-seccomp loader for the current architecture.
pub fn get_apply_seccomp_path() -> Result<PathBuf> {
    locate("apply-seccomp")
}

/// Check if both helper artifacts are present.
pub fn is_seccomp_available() -> bool {
    get_bpf_path().is_ok() && get_apply_seccomp_path().is_ok()
}
