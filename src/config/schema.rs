//! Configuration schema types.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::proxy::matcher::HostPattern;

/// Filesystem read restriction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ReadPolicy {
    /// Everything is readable except the deny list.
    #[default]
    DenyOnly,
    /// Only the allow list (plus the loader minimum) is readable.
    AllowOnly,
}

/// Network restriction configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Destinations allowed for outbound access, evaluated after denies.
    /// Patterns: exact host, `host:port`, `*.suffix`, CIDR, `*`.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Destinations explicitly denied; a deny match always wins.
    #[serde(default)]
    pub denied_domains: Vec<String>,

    /// Absolute paths of Unix sockets the child may connect to.
    #[serde(default)]
    pub allowed_unix_sockets: Vec<String>,

    /// Allow binding to localhost inside the sandbox.
    #[serde(default)]
    pub allow_local_binding: bool,

    /// External HTTP proxy port. When set, no local HTTP proxy is started.
    #[serde(default)]
    pub http_proxy_port: Option<u32>,

    /// External SOCKS5 proxy port. When set, no local SOCKS proxy is started.
    #[serde(default)]
    pub socks_proxy_port: Option<u32>,
}

impl NetworkConfig {
    /// True when the section carries no restrictions and no ports: network
    /// filtering is disabled and no proxies run.
    pub fn is_unrestricted(&self) -> bool {
        self.allowed_domains.is_empty()
            && self.denied_domains.is_empty()
            && self.allowed_unix_sockets.is_empty()
            && self.http_proxy_port.is_none()
            && self.socks_proxy_port.is_none()
    }

    /// Validated HTTP proxy port.
    pub fn http_port(&self) -> Option<u16> {
        self.http_proxy_port.map(|p| p as u16)
    }

    /// Validated SOCKS proxy port.
    pub fn socks_port(&self) -> Option<u16> {
        self.socks_proxy_port.map(|p| p as u16)
    }
}

/// Filesystem restriction configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemConfig {
    /// Read restriction mode.
    #[serde(default)]
    pub read_policy: ReadPolicy,

    /// Paths/patterns denied for reading (DenyOnly mode).
    #[serde(default)]
    pub deny_read: Vec<String>,

    /// Paths/patterns allowed for reading (AllowOnly mode).
    #[serde(default)]
    pub allow_read: Vec<String>,

    /// Carve-outs inside the readable set (AllowOnly mode).
    #[serde(default)]
    pub deny_within_allow_read: Vec<String>,

    /// Paths allowed for writing. Empty means the filesystem is read-only.
    #[serde(default)]
    pub allow_write: Vec<String>,

    /// Paths denied for writing (overrides allow_write).
    #[serde(default)]
    pub deny_write: Vec<String>,

    /// Carve-outs inside the writable set.
    #[serde(default)]
    pub deny_within_allow_write: Vec<String>,

    /// Allow writes to .gitconfig despite the mandatory deny list.
    #[serde(default)]
    pub allow_git_config: bool,
}

/// Violation suppression patterns. Matching violations are still recorded
/// and counted but excluded from user-facing reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreViolationsConfig {
    /// Path globs matched against filesystem violation subjects.
    #[serde(default)]
    pub filesystem: Vec<String>,

    /// Host patterns matched against network violation subjects.
    #[serde(default)]
    pub network: Vec<String>,
}

/// Main sandbox configuration. Unknown top-level fields are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SandboxConfig {
    /// Network restriction configuration.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Filesystem restriction configuration.
    #[serde(default)]
    pub filesystem: FilesystemConfig,

    /// Extra environment variables for the sandboxed command, in order.
    #[serde(default)]
    pub env: Option<IndexMap<String, String>>,

    /// Shell command executed inside the sandbox before the user command.
    /// A non-zero exit aborts the run.
    #[serde(default)]
    pub pre_command: Option<String>,

    /// Relax user-namespace and seccomp requirements when already inside a
    /// container.
    #[serde(default)]
    pub enable_weaker_nested_sandbox: bool,

    /// Violation suppression patterns.
    #[serde(default)]
    pub ignore_violations: Option<IgnoreViolationsConfig>,
}

/// Files that should never be writable regardless of allow_write.
pub const DANGEROUS_FILES: &[&str] = &[
    ".gitconfig",
    ".bashrc",
    ".bash_profile",
    ".bash_login",
    ".profile",
    ".zshrc",
    ".zprofile",
    ".zshenv",
    ".zlogin",
    ".npmrc",
    ".yarnrc",
    ".yarnrc.yml",
];

/// Directories that should never be writable regardless of allow_write.
pub const DANGEROUS_DIRECTORIES: &[&str] = &[".git/hooks", ".git", ".vscode", ".idea"];

impl SandboxConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validate_port("network.httpProxyPort", self.network.http_proxy_port)?;
        validate_port("network.socksProxyPort", self.network.socks_proxy_port)?;

        if let (Some(http), Some(socks)) =
            (self.network.http_proxy_port, self.network.socks_proxy_port)
        {
            if http == socks {
                return Err(SandboxError::invalid_config(
                    "network.socksProxyPort",
                    format!("conflicts with httpProxyPort ({http})"),
                ));
            }
        }

        for (field, patterns) in [
            ("network.allowedDomains", &self.network.allowed_domains),
            ("network.deniedDomains", &self.network.denied_domains),
        ] {
            for domain in patterns {
                HostPattern::parse(domain).map_err(|reason| {
                    SandboxError::invalid_config(field, format!("bad pattern '{domain}': {reason}"))
                })?;
            }
        }

        for socket in &self.network.allowed_unix_sockets {
            if !socket.starts_with('/') {
                return Err(SandboxError::invalid_config(
                    "network.allowedUnixSockets",
                    format!("'{socket}' is not an absolute path"),
                ));
            }
        }

        if let Some(ref pre) = self.pre_command {
            if pre.trim().is_empty() {
                return Err(SandboxError::invalid_config(
                    "preCommand",
                    "must not be blank",
                ));
            }
        }

        if let Some(ref ignores) = self.ignore_violations {
            for pattern in &ignores.network {
                HostPattern::parse(pattern).map_err(|reason| {
                    SandboxError::invalid_config(
                        "ignoreViolations.network",
                        format!("bad pattern '{pattern}': {reason}"),
                    )
                })?;
            }
            for pattern in &ignores.filesystem {
                crate::pattern::PathGlob::parse(pattern).map_err(|e| {
                    SandboxError::invalid_config("ignoreViolations.filesystem", e.to_string())
                })?;
            }
        }

        Ok(())
    }
}

fn validate_port(field: &str, port: Option<u32>) -> Result<()> {
    match port {
        Some(p) if p == 0 || p > u16::MAX as u32 => Err(SandboxError::invalid_config(
            field,
            format!("port {p} out of range [1, 65535]"),
        )),
        _ => Ok(()),
    }
}
