//! Command wrapping for sandbox-exec.

use std::io::Write;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::Result;
use crate::utils::quote;

/// Profiles written during this process, removed on reset and exit.
static TEMP_PROFILES: Lazy<Mutex<Vec<PathBuf>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Assemble the sandbox-exec invocation for an already-generated profile.
///
/// `env_vars` are emitted in order through an `env` prefix so the wrapped
/// command carries them regardless of the caller's shell.
pub fn wrap_command(
    command: &str,
    profile: &str,
    env_vars: &[(String, String)],
    execution_id: u64,
) -> Result<String> {
    let profile_path = write_profile_to_temp(profile, execution_id)?;

    Ok(format!(
        "{}sandbox-exec -f {} /bin/sh -c {}",
        crate::utils::render_env_prefix(env_vars),
        quote(&profile_path),
        quote(command)
    ))
}

fn write_profile_to_temp(profile: &str, execution_id: u64) -> Result<String> {
    let path = std::env::temp_dir().join(format!(
        "procbox-profile-{}-{}.sb",
        std::process::id(),
        execution_id
    ));

    let mut file = std::fs::File::create(&path)?;
    file.write_all(profile.as_bytes())?;

    TEMP_PROFILES.lock().push(path.clone());

    Ok(path.display().to_string())
}

/// Remove every profile written by this process.
pub fn cleanup_temp_profiles() {
    let mut profiles = TEMP_PROFILES.lock();
    for path in profiles.drain(..) {
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("failed to remove {}: {}", path.display(), e);
            }
        }
    }
}
