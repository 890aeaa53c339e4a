//! Filesystem policy compilation shared by the platform compilers and the
//! post-hoc probe.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::config::{FilesystemConfig, ReadPolicy};
use crate::error::{Result, SandboxError};
use crate::pattern::PathGlob;
use crate::utils::normalize_path_for_sandbox;
use crate::utils::platform::Platform;

/// Paths every child needs readable to start at all: the loader, shared
/// libraries and base system configuration.
pub const MACOS_LOADER_MINIMUM: &[&str] = &[
    "/usr/lib",
    "/usr/libexec",
    "/usr/share",
    "/usr/bin",
    "/System",
    "/bin",
    "/sbin",
    "/dev",
    "/private/etc",
    "/var/db/dyld",
    "/Library/Preferences",
];

/// Linux equivalent, expressed as bind sources.
pub const LINUX_LOADER_MINIMUM: &[&str] =
    &["/usr", "/lib", "/lib64", "/lib32", "/bin", "/sbin", "/etc", "/dev"];

/// A compiled path rule: literal paths match as subtrees, globs match via
/// the compiled profile regex.
#[derive(Debug, Clone)]
pub struct PathRule {
    pub glob: PathGlob,
    regex: Regex,
}

impl PathRule {
    fn compile(glob: PathGlob) -> Result<Self> {
        let regex = Regex::new(&glob.to_profile_regex()).map_err(|e| {
            SandboxError::InvalidPathPattern {
                pattern: glob.raw().to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self { glob, regex })
    }

    /// Runtime evaluation of the rule against an absolute path.
    pub fn matches(&self, path: &Path) -> bool {
        if let Some(literal) = self.glob.literal_path() {
            return path.starts_with(&literal);
        }
        self.regex.is_match(&path.display().to_string())
    }
}

fn compile_list(patterns: &[String]) -> Result<(Vec<PathRule>, Vec<PathRule>)> {
    let mut rules = Vec::new();
    let mut overrides = Vec::new();
    for pattern in patterns {
        let normalized = if pattern.starts_with('~') {
            normalize_path_for_sandbox(pattern)
        } else {
            pattern.clone()
        };
        let glob = PathGlob::parse(&normalized)?;
        let rule = PathRule::compile(glob)?;
        if rule.glob.is_negated() {
            overrides.push(rule);
        } else {
            rules.push(rule);
        }
    }
    Ok((rules, overrides))
}

/// Compiled read restrictions.
#[derive(Debug, Clone)]
pub struct FsReadPlan {
    pub policy: ReadPolicy,
    /// allow_read rules (AllowOnly mode).
    pub allow: Vec<PathRule>,
    /// deny_read rules (DenyOnly mode).
    pub deny: Vec<PathRule>,
    /// `!` overrides inside deny_read: re-allowed despite a deny match.
    pub deny_overrides: Vec<PathRule>,
    /// deny_within_allow_read plus `!` overrides from allow_read.
    pub carveouts: Vec<PathRule>,
    /// Platform-mandated readable minimum.
    pub loader_minimum: Vec<PathBuf>,
}

impl FsReadPlan {
    /// Evaluate readability of an absolute path under this plan.
    pub fn is_readable(&self, path: &Path) -> bool {
        match self.policy {
            ReadPolicy::DenyOnly => {
                let denied = self.deny.iter().any(|r| r.matches(path))
                    && !self.deny_overrides.iter().any(|r| r.matches(path));
                !denied
            }
            ReadPolicy::AllowOnly => {
                // The mandated minimum is unioned in unconditionally; a
                // carve-out never subtracts from it.
                if self.loader_minimum.iter().any(|p| path.starts_with(p)) {
                    return true;
                }
                if self.carveouts.iter().any(|r| r.matches(path)) {
                    return false;
                }
                self.allow.iter().any(|r| r.matches(path))
            }
        }
    }
}

/// Compiled write restrictions. Writes are always allow-only.
#[derive(Debug, Clone)]
pub struct FsWritePlan {
    pub allow: Vec<PathRule>,
    pub deny: Vec<PathRule>,
    /// deny_within_allow_write plus `!` overrides from allow_write.
    pub carveouts: Vec<PathRule>,
}

impl FsWritePlan {
    /// Evaluate writability of an absolute path under this plan.
    pub fn is_writable(&self, path: &Path) -> bool {
        if self.deny.iter().any(|r| r.matches(path)) {
            return false;
        }
        if self.carveouts.iter().any(|r| r.matches(path)) {
            return false;
        }
        self.allow.iter().any(|r| r.matches(path))
    }
}

/// Compile the filesystem config for a platform. Pattern errors surface as
/// `InvalidConfig`; nothing is silently dropped.
pub fn compile_fs_plans(
    config: &FilesystemConfig,
    platform: Platform,
) -> Result<(FsReadPlan, FsWritePlan)> {
    let map_err = |field: &'static str| {
        move |e: SandboxError| match e {
            SandboxError::InvalidPathPattern { pattern, reason } => SandboxError::invalid_config(
                field.to_string(),
                format!("bad pattern '{pattern}': {reason}"),
            ),
            other => other,
        }
    };

    let (deny, deny_overrides) =
        compile_list(&config.deny_read).map_err(map_err("filesystem.denyRead"))?;
    let (allow, allow_overrides) =
        compile_list(&config.allow_read).map_err(map_err("filesystem.allowRead"))?;
    let (mut carveouts, _) = compile_list(&config.deny_within_allow_read)
        .map_err(map_err("filesystem.denyWithinAllowRead"))?;
    carveouts.extend(allow_overrides);

    let loader_minimum = match platform {
        Platform::MacOS => MACOS_LOADER_MINIMUM,
        Platform::Linux => LINUX_LOADER_MINIMUM,
    }
    .iter()
    .map(PathBuf::from)
    .collect::<Vec<_>>();

    if config.read_policy == ReadPolicy::AllowOnly
        && allow.is_empty()
        && loader_minimum.is_empty()
    {
        return Err(SandboxError::invalid_config(
            "filesystem.allowRead",
            "allow-only read policy with no readable paths",
        ));
    }

    let read_plan = FsReadPlan {
        policy: config.read_policy,
        allow,
        deny,
        deny_overrides,
        carveouts,
        loader_minimum,
    };

    let (write_allow, write_allow_overrides) =
        compile_list(&config.allow_write).map_err(map_err("filesystem.allowWrite"))?;
    let (write_deny, _) =
        compile_list(&config.deny_write).map_err(map_err("filesystem.denyWrite"))?;
    let (mut write_carveouts, _) = compile_list(&config.deny_within_allow_write)
        .map_err(map_err("filesystem.denyWithinAllowWrite"))?;
    write_carveouts.extend(write_allow_overrides);

    let write_plan = FsWritePlan {
        allow: write_allow,
        deny: write_deny,
        carveouts: write_carveouts,
    };

    Ok((read_plan, write_plan))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_config(read_policy: ReadPolicy) -> FilesystemConfig {
        FilesystemConfig {
            read_policy,
            ..Default::default()
        }
    }

    #[test]
    fn test_deny_only_default_readable() {
        let config = fs_config(ReadPolicy::DenyOnly);
        let (read, _) = compile_fs_plans(&config, Platform::Linux).unwrap();
        assert!(read.is_readable(Path::new("/anything/at/all")));
    }

    #[test]
    fn test_deny_only_blocks_denied() {
        let mut config = fs_config(ReadPolicy::DenyOnly);
        config.deny_read = vec!["/etc/shadow".to_string(), "/srv/secrets/**".to_string()];
        let (read, _) = compile_fs_plans(&config, Platform::Linux).unwrap();

        assert!(!read.is_readable(Path::new("/etc/shadow")));
        assert!(!read.is_readable(Path::new("/srv/secrets/key.pem")));
        assert!(read.is_readable(Path::new("/etc/hosts")));
    }

    #[test]
    fn test_deny_only_negation_reallows() {
        let mut config = fs_config(ReadPolicy::DenyOnly);
        config.deny_read = vec!["/srv/secrets/**".to_string(), "!/srv/secrets/public/**".to_string()];
        let (read, _) = compile_fs_plans(&config, Platform::Linux).unwrap();

        assert!(!read.is_readable(Path::new("/srv/secrets/key.pem")));
        assert!(read.is_readable(Path::new("/srv/secrets/public/readme")));
    }

    #[test]
    fn test_allow_only_includes_loader_minimum() {
        let config = fs_config(ReadPolicy::AllowOnly);
        let (read, _) = compile_fs_plans(&config, Platform::Linux).unwrap();

        // Even with an empty allow list the loader minimum stays readable.
        assert!(read.is_readable(Path::new("/usr/lib/libc.so.6")));
        assert!(!read.is_readable(Path::new("/home/user/file")));
    }

    #[test]
    fn test_allow_only_with_carveout() {
        let mut config = fs_config(ReadPolicy::AllowOnly);
        config.allow_read = vec!["/t/ok/".to_string()];
        config.deny_within_allow_read = vec!["/t/ok/private/".to_string()];
        let (read, _) = compile_fs_plans(&config, Platform::Linux).unwrap();

        assert!(read.is_readable(Path::new("/t/ok/file")));
        assert!(!read.is_readable(Path::new("/t/ok/private/file")));
        assert!(!read.is_readable(Path::new("/t/bad")));
    }

    #[test]
    fn test_loader_minimum_wins_over_overlapping_carveout() {
        let mut config = fs_config(ReadPolicy::AllowOnly);
        config.deny_within_allow_read = vec!["/usr/lib/evil/".to_string()];
        let (read, _) = compile_fs_plans(&config, Platform::Linux).unwrap();

        // A carve-out under the mandated minimum must not subtract from it.
        assert!(read.is_readable(Path::new("/usr/lib/evil/libfoo.so")));
        assert!(read.is_readable(Path::new("/usr/lib/libc.so.6")));
    }

    #[test]
    fn test_write_plan_empty_allow_is_readonly() {
        let config = FilesystemConfig::default();
        let (_, write) = compile_fs_plans(&config, Platform::Linux).unwrap();
        assert!(!write.is_writable(Path::new("/tmp/x")));
    }

    #[test]
    fn test_write_deny_beats_allow() {
        let config = FilesystemConfig {
            allow_write: vec!["/tmp/".to_string()],
            deny_write: vec!["/tmp/protected/".to_string()],
            ..Default::default()
        };
        let (_, write) = compile_fs_plans(&config, Platform::Linux).unwrap();

        assert!(write.is_writable(Path::new("/tmp/scratch")));
        assert!(!write.is_writable(Path::new("/tmp/protected/file")));
    }

    #[test]
    fn test_bad_pattern_is_invalid_config() {
        let mut config = fs_config(ReadPolicy::DenyOnly);
        config.deny_read = vec!["/srv/a**b".to_string()];
        let err = compile_fs_plans(&config, Platform::Linux).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig { .. }));
    }
}
