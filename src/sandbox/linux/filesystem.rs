//! Bind-mount plan generation for bubblewrap.
//!
//! Mount order matters: bwrap layers mounts in argv order, so read allows
//! come first, writable binds next, and deny masks shadow them at the end.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::{FilesystemConfig, ReadPolicy, DANGEROUS_DIRECTORIES, DANGEROUS_FILES};
use crate::manager::filesystem::{FsReadPlan, FsWritePlan, PathRule};
use crate::utils::path::is_symlink_outside_boundary;

/// How a path enters the sandbox mount table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Visible read-only.
    ReadOnly,
    /// Visible read-write.
    ReadWrite,
    /// Hidden behind /dev/null (files).
    MaskFile,
    /// Hidden behind an empty tmpfs (directories).
    MaskDir,
}

/// A single bind mount.
#[derive(Debug, Clone, PartialEq)]
pub struct BindMount {
    pub target: PathBuf,
    pub kind: MountKind,
}

impl BindMount {
    pub fn readonly(path: impl Into<PathBuf>) -> Self {
        Self {
            target: path.into(),
            kind: MountKind::ReadOnly,
        }
    }

    pub fn writable(path: impl Into<PathBuf>) -> Self {
        Self {
            target: path.into(),
            kind: MountKind::ReadWrite,
        }
    }

    /// Mask a path, picking the mask type from what is on disk.
    pub fn mask(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = if path.is_dir() {
            MountKind::MaskDir
        } else {
            MountKind::MaskFile
        };
        Self { target: path, kind }
    }

    /// Serialize to bwrap arguments.
    pub fn to_bwrap_args(&self) -> Vec<String> {
        let target = self.target.display().to_string();
        match self.kind {
            MountKind::ReadOnly => vec!["--ro-bind".to_string(), target.clone(), target],
            MountKind::ReadWrite => vec!["--bind".to_string(), target.clone(), target],
            MountKind::MaskFile => {
                vec!["--ro-bind".to_string(), "/dev/null".to_string(), target]
            }
            MountKind::MaskDir => vec!["--tmpfs".to_string(), target],
        }
    }
}

fn expand_rules(rules: &[PathRule]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for rule in rules {
        for path in rule.glob.expand_existing() {
            if seen.insert(path.clone()) {
                out.push(path);
            }
        }
    }
    out
}

/// Generate the mount table for the compiled filesystem plans.
pub fn generate_bind_mounts(
    read_plan: &FsReadPlan,
    write_plan: &FsWritePlan,
    fs_config: &FilesystemConfig,
    cwd: &Path,
) -> (Vec<BindMount>, Vec<String>) {
    let mut mounts = Vec::new();
    let mut warnings = Vec::new();

    // 1. Readable base. DenyOnly keeps the root ro-bind from the launcher;
    //    AllowOnly binds only the loader minimum plus the allow list.
    if read_plan.policy == ReadPolicy::AllowOnly {
        for path in &read_plan.loader_minimum {
            // The launcher mounts a fresh /dev itself.
            if path == Path::new("/dev") {
                continue;
            }
            if path.exists() {
                mounts.push(BindMount::readonly(path.clone()));
            }
        }
        for path in expand_rules(&read_plan.allow) {
            mounts.push(BindMount::readonly(path));
        }
        if cwd.exists() && read_plan.is_readable(cwd) {
            let cwd_mount = BindMount::readonly(cwd.to_path_buf());
            if !mounts.contains(&cwd_mount) {
                mounts.push(cwd_mount);
            }
        }
    }

    // 2. Writable binds.
    for rule in &write_plan.allow {
        let expanded = rule.glob.expand_existing();
        if expanded.is_empty() {
            warnings.push(format!(
                "write path '{}' matches nothing that exists",
                rule.glob.raw()
            ));
            continue;
        }
        for path in expanded {
            if let Some(original) = rule.glob.literal_path() {
                if is_symlink_outside_boundary(&original, &path) {
                    warnings.push(format!(
                        "write path '{}' resolves outside its boundary; masking",
                        rule.glob.raw()
                    ));
                    mounts.push(BindMount::mask(original));
                    continue;
                }
            }
            mounts.push(BindMount::writable(path));
        }
    }

    // 3. Read denies shadow everything above.
    match read_plan.policy {
        ReadPolicy::DenyOnly => {
            for path in expand_rules(&read_plan.deny) {
                mounts.push(BindMount::mask(path));
            }
            for path in expand_rules(&read_plan.deny_overrides) {
                mounts.push(BindMount::readonly(path));
            }
        }
        ReadPolicy::AllowOnly => {
            for path in expand_rules(&read_plan.carveouts) {
                // Masking under the loader minimum would override the
                // mandated readable set; the minimum always stays intact.
                if read_plan
                    .loader_minimum
                    .iter()
                    .any(|min| path.starts_with(min))
                {
                    warnings.push(format!(
                        "carve-out '{}' overlaps the loader minimum; left readable",
                        path.display()
                    ));
                    continue;
                }
                mounts.push(BindMount::mask(path));
            }
        }
    }

    // 4. Write denies re-shadow read-only.
    for path in expand_rules(&write_plan.deny) {
        mounts.push(BindMount::readonly(path));
    }
    for path in expand_rules(&write_plan.carveouts) {
        mounts.push(BindMount::readonly(path));
    }

    // 5. Mandatory denies around the home directory and the working tree.
    for path in mandatory_deny_paths(fs_config, cwd) {
        let mount = BindMount::readonly(path);
        if !mounts.contains(&mount) {
            mounts.push(mount);
        }
    }

    (mounts, warnings)
}

/// Existing dangerous files and directories that must never be writable.
fn mandatory_deny_paths(config: &FilesystemConfig, cwd: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut push_existing = |path: PathBuf| {
        if path.exists() && !out.contains(&path) {
            out.push(path);
        }
    };

    for dir in DANGEROUS_DIRECTORIES {
        if *dir == ".git" && config.allow_git_config {
            push_existing(cwd.join(".git/hooks"));
            continue;
        }
        push_existing(cwd.join(dir));
        if let Some(home) = dirs::home_dir() {
            push_existing(home.join(dir));
        }
    }

    for file in DANGEROUS_FILES {
        if *file == ".gitconfig" && config.allow_git_config {
            continue;
        }
        if let Some(home) = dirs::home_dir() {
            push_existing(home.join(file));
        }
    }

    out
}
