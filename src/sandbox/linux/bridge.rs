//! Socat bridges between the host proxies and the isolated network
//! namespace.
//!
//! Host side: a Unix socket forwarding to the proxy's TCP port. Sandbox
//! side: a TCP listener on loopback forwarding back to that socket, started
//! by the inner command before the user command runs.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::{Result, SandboxError};

/// A host-side socat process bridging a Unix socket to a TCP port.
pub struct SocatBridge {
    child: Option<Child>,
    socket_path: PathBuf,
}

impl SocatBridge {
    /// Spawn a bridge: connections to `socket_path` are forwarded to
    /// `127.0.0.1:<tcp_port>` on the host.
    pub async fn unix_to_tcp(socket_path: PathBuf, tcp_port: u16) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let child = Command::new("socat")
            .args([
                &format!("UNIX-LISTEN:{},fork", socket_path.display()),
                &format!("TCP:127.0.0.1:{tcp_port}"),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SandboxError::ToolchainMissing {
                        tool: "socat".to_string(),
                    }
                } else {
                    SandboxError::Io(e)
                }
            })?;

        // Give socat a moment to create the socket.
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        Ok(Self {
            child: Some(child),
            socket_path,
        })
    }

    /// The sandbox-side shell command re-exposing the bridge as a loopback
    /// TCP port inside the network namespace.
    pub fn sandbox_side_command(tcp_port: u16, socket_path: &str) -> String {
        format!("socat TCP-LISTEN:{tcp_port},fork,reuseaddr,bind=127.0.0.1 UNIX-CONNECT:{socket_path}")
    }

    /// The bridged socket path.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Stop the bridge and remove its socket.
    pub async fn stop(&mut self) {
        if let Some(ref mut child) = self.child {
            let _ = child.kill().await;
        }

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for SocatBridge {
    fn drop(&mut self) {
        if let Some(ref mut child) = self.child {
            let _ = child.start_kill();
        }

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// Check if socat is installed.
pub fn check_socat() -> bool {
    std::process::Command::new("socat")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Generate a unique socket path in the system temp directory.
pub fn generate_socket_path(prefix: &str) -> PathBuf {
    use rand::Rng;
    let suffix: u32 = rand::thread_rng().gen();
    std::env::temp_dir().join(format!("{prefix}-{}-{suffix:08x}.sock", std::process::id()))
}
