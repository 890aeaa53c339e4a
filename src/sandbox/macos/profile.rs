//! Seatbelt profile generation.
//!
//! The interpreter evaluates last-match-wins within an operation class, so
//! deny exceptions are always emitted after the allows they carve into.

use base64::Engine;

use crate::config::{ReadPolicy, SandboxConfig, DANGEROUS_DIRECTORIES, DANGEROUS_FILES};
use crate::manager::filesystem::{FsReadPlan, FsWritePlan, PathRule};
use crate::utils::normalize_path_for_sandbox;

/// Session suffix for trace tagging (generated once per process).
static SESSION_SUFFIX: once_cell::sync::Lazy<String> = once_cell::sync::Lazy::new(|| {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
});

/// Generate the trace tag for an execution. The tag carries the execution
/// id and the command digest so audit lines can be attributed. The standard
/// base64 alphabet keeps `_` free as the field separator.
pub fn generate_log_tag(execution_id: u64, encoded_command: &str) -> String {
    let digest_b64 = match hex::decode(encoded_command) {
        Ok(bytes) => base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes),
        Err(_) => base64::engine::general_purpose::STANDARD_NO_PAD.encode(encoded_command),
    };
    format!("SBX_{}_{}_{}", execution_id, digest_b64, *SESSION_SUFFIX)
}

/// Recover `(execution_id, encoded_command)` from a trace tag.
pub fn decode_log_tag(tag: &str) -> Option<(u64, String)> {
    let rest = tag.strip_prefix("SBX_")?;
    let (eid, rest) = rest.split_once('_')?;
    let (digest_b64, _suffix) = rest.rsplit_once('_')?;
    let execution_id = eid.parse().ok()?;
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(digest_b64)
        .ok()?;
    Some((execution_id, hex::encode(bytes)))
}

/// Generate a Seatbelt profile for the given configuration and compiled
/// filesystem plans.
pub fn generate_profile(
    config: &SandboxConfig,
    read_plan: &FsReadPlan,
    write_plan: &FsWritePlan,
    http_proxy_port: Option<u16>,
    socks_proxy_port: Option<u16>,
    log_tag: Option<&str>,
) -> String {
    let mut profile = String::new();

    profile.push_str("(version 1)\n");
    profile.push_str("(deny default)\n\n");

    if let Some(tag) = log_tag {
        profile.push_str(&format!("; Trace tag: {tag}\n"));
        profile.push_str(&format!("(trace \"{tag}\")\n\n"));
    }

    profile.push_str("; Process\n");
    profile.push_str("(allow process-exec)\n");
    profile.push_str("(allow process-fork)\n");
    profile.push_str("(allow process-info*)\n");
    profile.push_str("(deny system-debug)\n");
    profile.push_str("(deny mach-priv-task-port)\n\n");

    profile.push_str("; Signals\n");
    profile.push_str("(allow signal (target same-sandbox))\n\n");

    profile.push_str("; Sysctl\n");
    profile.push_str("(allow sysctl-read)\n\n");

    profile.push_str("; Mach and IPC\n");
    profile.push_str("(allow mach-lookup)\n");
    profile.push_str("(allow mach-register)\n");
    profile.push_str("(allow ipc-posix*)\n");
    profile.push_str("(allow ipc-sysv*)\n\n");

    profile.push_str("; Network\n");
    generate_network_rules(&mut profile, config, http_proxy_port, socks_proxy_port);
    profile.push('\n');

    profile.push_str("; Filesystem: read\n");
    generate_read_rules(&mut profile, read_plan);
    profile.push('\n');

    profile.push_str("; Filesystem: write\n");
    generate_write_rules(&mut profile, config, write_plan);

    profile
}

fn generate_network_rules(
    profile: &mut String,
    config: &SandboxConfig,
    http_proxy_port: Option<u16>,
    socks_proxy_port: Option<u16>,
) {
    if config.network.is_unrestricted() {
        profile.push_str("(allow network*)\n");
        return;
    }

    // Outbound TCP is reachable only through the filtering proxies.
    if let Some(port) = http_proxy_port {
        profile.push_str(&format!(
            "(allow network-outbound (remote ip \"localhost:{port}\"))\n"
        ));
    }
    if let Some(port) = socks_proxy_port {
        profile.push_str(&format!(
            "(allow network-outbound (remote ip \"localhost:{port}\"))\n"
        ));
    }

    if config.network.allow_local_binding {
        profile.push_str("(allow network-bind (local ip \"localhost:*\"))\n");
    }

    for socket in &config.network.allowed_unix_sockets {
        let normalized = normalize_path_for_sandbox(socket);
        profile.push_str(&format!(
            "(allow network* (subpath \"{}\"))\n",
            escape_seatbelt_string(&normalized)
        ));
    }

    // Direct DNS and raw sockets stay closed; the proxies resolve names.
    profile.push_str("(deny network-outbound (remote ip \"*:53\"))\n");
    profile.push_str("(deny network-outbound (remote ip \"*:853\"))\n");
    profile.push_str("(deny system-socket)\n");
}

fn emit_rule(profile: &mut String, action: &str, op: &str, rule: &PathRule) {
    if let Some(literal) = rule.glob.literal_path() {
        profile.push_str(&format!(
            "({action} {op} (subpath \"{}\"))\n",
            escape_seatbelt_string(&literal.display().to_string())
        ));
    } else {
        profile.push_str(&format!(
            "({action} {op} (regex #\"{}\"))\n",
            rule.glob.to_profile_regex()
        ));
    }
}

fn generate_read_rules(profile: &mut String, plan: &FsReadPlan) {
    match plan.policy {
        ReadPolicy::DenyOnly => {
            profile.push_str("(allow file-read*)\n");
            for rule in &plan.deny {
                emit_rule(profile, "deny", "file-read*", rule);
            }
            // Negated deny patterns re-allow; they must come last.
            for rule in &plan.deny_overrides {
                emit_rule(profile, "allow", "file-read*", rule);
            }
        }
        ReadPolicy::AllowOnly => {
            for rule in &plan.allow {
                emit_rule(profile, "allow", "file-read*", rule);
            }
            for rule in &plan.carveouts {
                emit_rule(profile, "deny", "file-read*", rule);
            }
            // The loader minimum comes last: the interpreter is
            // last-match-wins, so no carve-out can subtract from it and the
            // child can always start, even with an empty allow list.
            for path in &plan.loader_minimum {
                profile.push_str(&format!(
                    "(allow file-read* (subpath \"{}\"))\n",
                    escape_seatbelt_string(&path.display().to_string())
                ));
            }
        }
    }
}

fn generate_write_rules(profile: &mut String, config: &SandboxConfig, plan: &FsWritePlan) {
    for rule in &plan.allow {
        emit_rule(profile, "allow", "file-write*", rule);
    }
    for rule in &plan.deny {
        emit_rule(profile, "deny", "file-write*", rule);
    }
    for rule in &plan.carveouts {
        emit_rule(profile, "deny", "file-write*", rule);
    }

    profile.push_str("\n; Mandatory denies\n");
    generate_mandatory_deny_rules(profile, config);

    profile.push_str("\n; Renames cannot bypass write restrictions\n");
    profile.push_str("(deny file-write-unlink)\n");
}

fn generate_mandatory_deny_rules(profile: &mut String, config: &SandboxConfig) {
    for file in DANGEROUS_FILES {
        if *file == ".gitconfig" && config.filesystem.allow_git_config {
            continue;
        }

        profile.push_str(&format!(
            "(deny file-write* (regex #\"^.*/{}$\"))\n",
            regex::escape(file)
        ));
    }

    for dir in DANGEROUS_DIRECTORIES {
        if *dir == ".git" && config.filesystem.allow_git_config {
            // Keep hooks blocked even when .git itself is open.
            profile.push_str("(deny file-write* (regex #\"^.*/\\.git/hooks(/.*)?$\"))\n");
            continue;
        }

        profile.push_str(&format!(
            "(deny file-write* (regex #\"^.*/{}(/.*)?$\"))\n",
            regex::escape(dir)
        ));
    }
}

/// Escape a string for use in a Seatbelt profile literal.
fn escape_seatbelt_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilesystemConfig;
    use crate::manager::filesystem::compile_fs_plans;
    use crate::utils::platform::Platform;
    use crate::violation::encode_command;

    fn plans(fs: &FilesystemConfig) -> (FsReadPlan, FsWritePlan) {
        compile_fs_plans(fs, Platform::MacOS).unwrap()
    }

    fn profile_for(config: &SandboxConfig) -> String {
        let (read, write) = plans(&config.filesystem);
        generate_profile(config, &read, &write, Some(3128), Some(1080), None)
    }

    #[test]
    fn test_log_tag_roundtrip() {
        let encoded = encode_command("echo hello");
        let tag = generate_log_tag(7, &encoded);
        assert!(tag.starts_with("SBX_7_"));

        let (eid, digest) = decode_log_tag(&tag).unwrap();
        assert_eq!(eid, 7);
        assert_eq!(digest, encoded);
    }

    #[test]
    fn test_profile_denies_by_default() {
        let config = SandboxConfig::default();
        let profile = profile_for(&config);

        assert!(profile.starts_with("(version 1)\n(deny default)"));
        assert!(profile.contains("(allow process-exec)"));
        assert!(profile.contains("(deny system-debug)"));
        assert!(profile.contains("(deny file-write-unlink)"));
    }

    #[test]
    fn test_unrestricted_network_allows_all() {
        let config = SandboxConfig::default();
        let profile = profile_for(&config);
        assert!(profile.contains("(allow network*)"));
        assert!(!profile.contains("localhost:3128"));
    }

    #[test]
    fn test_restricted_network_allows_proxy_ports_only() {
        let mut config = SandboxConfig::default();
        config.network.allowed_domains = vec!["example.com".to_string()];
        let profile = profile_for(&config);

        assert!(profile.contains("(allow network-outbound (remote ip \"localhost:3128\"))"));
        assert!(profile.contains("(allow network-outbound (remote ip \"localhost:1080\"))"));
        assert!(profile.contains("(deny network-outbound (remote ip \"*:53\"))"));
        assert!(profile.contains("(deny system-socket)"));
        assert!(!profile.contains("(allow network*)\n"));
    }

    #[test]
    fn test_unix_socket_allowlist() {
        let mut config = SandboxConfig::default();
        config.network.allowed_domains = vec!["example.com".to_string()];
        config.network.allowed_unix_sockets = vec!["/var/run/agent.sock".to_string()];
        let profile = profile_for(&config);

        assert!(profile.contains("(allow network* (subpath \"/var/run/agent.sock\"))"));
    }

    #[test]
    fn test_allow_only_read_includes_loader_minimum() {
        let mut config = SandboxConfig::default();
        config.filesystem.read_policy = ReadPolicy::AllowOnly;
        config.filesystem.allow_read = vec!["/t/ok/".to_string()];
        let profile = profile_for(&config);

        assert!(profile.contains("(allow file-read* (subpath \"/usr/lib\"))"));
        assert!(profile.contains("(allow file-read* (subpath \"/t/ok\"))"));
        assert!(!profile.contains("(allow file-read*)\n"));
    }

    #[test]
    fn test_loader_minimum_emitted_after_overlapping_carveout() {
        let mut config = SandboxConfig::default();
        config.filesystem.read_policy = ReadPolicy::AllowOnly;
        config.filesystem.deny_within_allow_read = vec!["/usr/lib/evil/".to_string()];
        let profile = profile_for(&config);

        let deny_pos = profile
            .find("(deny file-read* (subpath \"/usr/lib/evil\"))")
            .unwrap();
        let loader_pos = profile
            .find("(allow file-read* (subpath \"/usr/lib\"))")
            .unwrap();
        assert!(loader_pos > deny_pos);
    }

    #[test]
    fn test_deny_only_read_allows_then_denies() {
        let mut config = SandboxConfig::default();
        config.filesystem.deny_read = vec!["/etc/shadow".to_string()];
        let profile = profile_for(&config);

        let allow_pos = profile.find("(allow file-read*)").unwrap();
        let deny_pos = profile
            .find("(deny file-read* (subpath \"/etc/shadow\"))")
            .unwrap();
        assert!(deny_pos > allow_pos);
    }

    #[test]
    fn test_write_deny_emitted_after_allow() {
        let mut config = SandboxConfig::default();
        config.filesystem.allow_write = vec!["/tmp/".to_string()];
        config.filesystem.deny_within_allow_write = vec!["/tmp/protected/".to_string()];
        let profile = profile_for(&config);

        let allow_pos = profile.find("(allow file-write* (subpath \"/tmp\"))").unwrap();
        let deny_pos = profile
            .find("(deny file-write* (subpath \"/tmp/protected\"))")
            .unwrap();
        assert!(deny_pos > allow_pos);
    }

    #[test]
    fn test_glob_patterns_become_regex_rules() {
        let mut config = SandboxConfig::default();
        config.filesystem.deny_read = vec!["/srv/**/secrets".to_string()];
        let profile = profile_for(&config);

        assert!(profile.contains("(deny file-read* (regex #\"^/srv/(.*/)?secrets$\"))"));
    }

    #[test]
    fn test_mandatory_denies_respect_git_config_flag() {
        let mut config = SandboxConfig::default();
        let profile = profile_for(&config);
        assert!(profile.contains("\\.gitconfig"));

        config.filesystem.allow_git_config = true;
        let profile = profile_for(&config);
        assert!(!profile.contains("\\.gitconfig$"));
        assert!(profile.contains("\\.git/hooks"));
    }

    #[test]
    fn test_seatbelt_escaping() {
        assert_eq!(escape_seatbelt_string("simple"), "simple");
        assert_eq!(escape_seatbelt_string("with\"quote"), "with\\\"quote");
        assert_eq!(escape_seatbelt_string("back\\slash"), "back\\\\slash");
    }
}
