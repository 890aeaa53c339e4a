//! Bubblewrap launch plan generation.

use std::path::Path;

use crate::config::{ReadPolicy, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::manager::filesystem::{FsReadPlan, FsWritePlan};
use crate::sandbox::linux::bridge::SocatBridge;
use crate::sandbox::linux::filesystem::generate_bind_mounts;
use crate::sandbox::linux::seccomp::{get_apply_seccomp_path, get_bpf_path};
use crate::utils::quote;

/// Check if bubblewrap is installed.
pub fn check_bwrap() -> bool {
    std::process::Command::new("bwrap")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Generate the full bwrap invocation for a sandboxed command.
///
/// `command` is the effective command (pre-command guard already applied).
/// The proxy sockets are the host-side socat bridge endpoints; `None` means
/// network filtering is disabled and no namespace isolation is needed for
/// the proxies.
#[allow(clippy::too_many_arguments)]
pub fn generate_bwrap_command(
    command: &str,
    config: &SandboxConfig,
    read_plan: &FsReadPlan,
    write_plan: &FsWritePlan,
    cwd: &Path,
    http_socket_path: Option<&str>,
    socks_socket_path: Option<&str>,
    http_proxy_port: Option<u16>,
    socks_proxy_port: Option<u16>,
) -> Result<(String, Vec<String>)> {
    let (mounts, mut warnings) = generate_bind_mounts(read_plan, write_plan, &config.filesystem, cwd);

    let mut args = vec![
        "bwrap".to_string(),
        "--die-with-parent".to_string(),
        "--unshare-net".to_string(),
    ];

    // DenyOnly exposes the whole tree read-only; AllowOnly builds the tree
    // from the loader minimum and the allow list alone. The root bind comes
    // first: later mounts shadow earlier ones at their targets.
    if read_plan.policy == ReadPolicy::DenyOnly {
        args.push("--ro-bind".to_string());
        args.push("/".to_string());
        args.push("/".to_string());
    }

    args.extend(
        [
            "--dev", "/dev", "--proc", "/proc", "--tmpfs", "/tmp", "--tmpfs", "/run", "--tmpfs",
            "/sys",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    for mount in &mounts {
        args.extend(mount.to_bwrap_args());
    }

    // Relayed Unix sockets must be visible inside the sandbox.
    for socket in &config.network.allowed_unix_sockets {
        if Path::new(socket).exists() {
            args.push("--bind".to_string());
            args.push(socket.clone());
            args.push(socket.clone());
        }
    }

    // Preserve the working directory when the policy leaves it readable.
    let chdir = if cwd.exists() && read_plan.is_readable(cwd) {
        cwd.display().to_string()
    } else {
        warnings.push(format!(
            "working directory {} is not readable in the sandbox; starting in /",
            cwd.display()
        ));
        "/".to_string()
    };
    args.push("--chdir".to_string());
    args.push(chdir);

    let inner = build_inner_command(
        command,
        config,
        &mut warnings,
        http_socket_path,
        socks_socket_path,
        http_proxy_port,
        socks_proxy_port,
    )?;

    args.push("--".to_string());
    args.push("/bin/sh".to_string());
    args.push("-c".to_string());
    args.push(inner);

    let wrapped = args.iter().map(|s| quote(s)).collect::<Vec<_>>().join(" ");

    Ok((wrapped, warnings))
}

/// Build the command that runs as pid 1 of the sandbox: start the proxy
/// bridges, prepare /tmp/claude, then hand off through the syscall filter.
fn build_inner_command(
    command: &str,
    config: &SandboxConfig,
    warnings: &mut Vec<String>,
    http_socket_path: Option<&str>,
    socks_socket_path: Option<&str>,
    http_proxy_port: Option<u16>,
    socks_proxy_port: Option<u16>,
) -> Result<String> {
    let mut parts = Vec::new();

    if let (Some(sock), Some(port)) = (http_socket_path, http_proxy_port) {
        parts.push(format!("{} &", SocatBridge::sandbox_side_command(port, sock)));
    }
    if let (Some(sock), Some(port)) = (socks_socket_path, socks_proxy_port) {
        parts.push(format!("{} &", SocatBridge::sandbox_side_command(port, sock)));
    }
    if http_socket_path.is_some() || socks_socket_path.is_some() {
        parts.push("sleep 0.2".to_string());
    }

    parts.push("mkdir -p /tmp/claude".to_string());

    let filter_wanted =
        !config.network.is_unrestricted() && config.network.allowed_unix_sockets.is_empty();

    if filter_wanted {
        match (get_bpf_path(), get_apply_seccomp_path()) {
            (Ok(bpf), Ok(apply)) => {
                parts.push(format!(
                    "exec {} {} /bin/sh -c {}",
                    quote(&apply.display().to_string()),
                    quote(&bpf.display().to_string()),
                    quote(command)
                ));
            }
            (bpf, apply) => {
                if !config.enable_weaker_nested_sandbox {
                    return Err(bpf
                        .err()
                        .or(apply.err())
                        .unwrap_or_else(|| SandboxError::ToolchainMissing {
                            tool: "apply-seccomp".to_string(),
                        }));
                }
                warnings.push(
                    "syscall filter unavailable; Unix socket creation is not blocked".to_string(),
                );
                parts.push(format!("exec /bin/sh -c {}", quote(command)));
            }
        }
    } else {
        parts.push(format!("exec /bin/sh -c {}", quote(command)));
    }

    Ok(parts.join("; "))
}
