//! Configuration loading from JSON settings files.

use std::path::{Path, PathBuf};

use crate::config::schema::SandboxConfig;
use crate::error::{Result, SandboxError};

/// Default settings file name, resolved under $HOME.
const DEFAULT_SETTINGS_FILE: &str = ".procbox-settings.json";

/// Get the default settings file path.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_SETTINGS_FILE))
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<SandboxConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SandboxError::invalid_config(
            "settings",
            format!("failed to read {}: {e}", path.display()),
        )
    })?;

    parse_config(&content)
}

/// Load configuration from the default path, or return the default config
/// (unrestricted) if no settings file exists.
pub fn load_default_config() -> Result<SandboxConfig> {
    match default_settings_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => Ok(SandboxConfig::default()),
    }
}

/// Parse and validate configuration from a JSON string.
/// Unknown top-level fields are rejected by the schema.
pub fn parse_config(json: &str) -> Result<SandboxConfig> {
    let config: SandboxConfig = serde_json::from_str(json)
        .map_err(|e| SandboxError::invalid_config("settings", e.to_string()))?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadPolicy;

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config("{}").unwrap();
        assert!(config.network.allowed_domains.is_empty());
        assert!(config.filesystem.allow_write.is_empty());
        assert_eq!(config.filesystem.read_policy, ReadPolicy::DenyOnly);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "network": {
                "allowedDomains": ["github.com", "*.npmjs.org", "10.0.0.0/8"],
                "deniedDomains": ["evil.com"],
                "allowedUnixSockets": ["/var/run/agent.sock"],
                "httpProxyPort": 8888
            },
            "filesystem": {
                "readPolicy": "allowOnly",
                "allowRead": ["/srv/project"],
                "denyWithinAllowRead": ["/srv/project/secrets"],
                "allowWrite": ["/tmp"],
                "denyWrite": ["/tmp/protected"],
                "allowGitConfig": true
            },
            "env": {"CI": "1", "A": "b"},
            "preCommand": "npm install",
            "enableWeakerNestedSandbox": true,
            "ignoreViolations": {
                "filesystem": ["/proc/**"],
                "network": ["telemetry.example.com"]
            }
        }"#;

        let config = parse_config(json).unwrap();
        assert_eq!(config.network.allowed_domains.len(), 3);
        assert_eq!(config.network.http_port(), Some(8888));
        assert_eq!(config.filesystem.read_policy, ReadPolicy::AllowOnly);
        assert_eq!(config.filesystem.deny_within_allow_read.len(), 1);
        assert!(config.filesystem.allow_git_config);
        assert!(config.enable_weaker_nested_sandbox);
        assert_eq!(config.pre_command.as_deref(), Some("npm install"));

        // env preserves insertion order
        let env = config.env.as_ref().unwrap();
        let keys: Vec<&str> = env.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["CI", "A"]);

        let ignores = config.ignore_violations.as_ref().unwrap();
        assert_eq!(ignores.filesystem, vec!["/proc/**"]);
    }

    #[test]
    fn test_unknown_top_level_field_rejected() {
        let json = r#"{"network": {}, "mystery": true}"#;
        assert!(parse_config(json).is_err());
    }

    #[test]
    fn test_out_of_range_port_rejected() {
        let json = r#"{"network": {"httpProxyPort": 65536}}"#;
        assert!(parse_config(json).is_err());

        let json = r#"{"network": {"httpProxyPort": 0}}"#;
        assert!(parse_config(json).is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(parse_config("not json").is_err());
        assert!(parse_config("{\"network\": }").is_err());
    }
}
