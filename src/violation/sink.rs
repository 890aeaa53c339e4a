//! Violation sink: attribution and suppression in front of the store.
//!
//! The proxies and the audit ingests report through a shared sink that
//! stamps events with the active execution, applies the configured ignore
//! patterns, and forwards to the store.

use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use crate::config::IgnoreViolationsConfig;
use crate::pattern::PathGlob;
use crate::proxy::matcher::HostPattern;
use crate::violation::event::{ViolationEvent, ViolationKind};
use crate::violation::store::SandboxViolationStore;

/// Attribution for in-flight violations.
#[derive(Debug, Clone)]
pub struct ActiveExecution {
    pub execution_id: u64,
    pub encoded_command: String,
}

/// Shared reporting handle.
#[derive(Clone)]
pub struct ViolationSink {
    store: Arc<SandboxViolationStore>,
    fs_ignores: Arc<Vec<Regex>>,
    network_ignores: Arc<Vec<HostPattern>>,
    active: Arc<RwLock<Option<ActiveExecution>>>,
}

impl ViolationSink {
    /// Build a sink. Unparsable ignore patterns were rejected during config
    /// validation where possible; stragglers are skipped with a warning.
    pub fn new(
        store: Arc<SandboxViolationStore>,
        ignores: Option<&IgnoreViolationsConfig>,
    ) -> Self {
        let mut fs_ignores = Vec::new();
        let mut network_ignores = Vec::new();

        if let Some(ignores) = ignores {
            for pattern in &ignores.filesystem {
                match PathGlob::parse(pattern).map(|g| Regex::new(&g.to_profile_regex())) {
                    Ok(Ok(re)) => fs_ignores.push(re),
                    _ => tracing::warn!("skipping unusable filesystem ignore pattern '{pattern}'"),
                }
            }
            for pattern in &ignores.network {
                match HostPattern::parse(pattern) {
                    Ok(p) => network_ignores.push(p),
                    Err(reason) => {
                        tracing::warn!("skipping network ignore pattern '{pattern}': {reason}")
                    }
                }
            }
        }

        Self {
            store,
            fs_ignores: Arc::new(fs_ignores),
            network_ignores: Arc::new(network_ignores),
            active: Arc::new(RwLock::new(None)),
        }
    }

    /// Mark the execution that subsequent violations attribute to.
    pub fn set_active(&self, execution_id: u64, encoded_command: String) {
        *self.active.write() = Some(ActiveExecution {
            execution_id,
            encoded_command,
        });
    }

    /// Record an event: stamp attribution when missing, apply suppression,
    /// forward to the store.
    pub fn record(&self, mut event: ViolationEvent) {
        if event.execution_id.is_none() {
            if let Some(active) = self.active.read().as_ref() {
                event.execution_id = Some(active.execution_id);
                if event.encoded_command.is_empty() {
                    event.encoded_command = active.encoded_command.clone();
                }
            }
        }

        event.suppressed = self.is_suppressed(&event);
        if event.suppressed {
            tracing::debug!("suppressed {:?} violation on {}", event.kind, event.subject);
        }

        self.store.add(event);
    }

    /// Convenience for proxy denials.
    pub fn network_denied(&self, host: &str, port: u16, raw: impl Into<String>) {
        self.record(ViolationEvent::new(
            ViolationKind::Network,
            format!("{host}:{port}"),
            raw,
        ));
    }

    fn is_suppressed(&self, event: &ViolationEvent) -> bool {
        match event.kind {
            ViolationKind::Network => {
                let (host, port) = match event.subject.rsplit_once(':') {
                    Some((h, p)) => (h, p.parse::<u16>().unwrap_or(0)),
                    None => (event.subject.as_str(), 0),
                };
                let host = crate::proxy::matcher::normalize_host(host);
                self.network_ignores.iter().any(|p| p.matches(&host, port))
            }
            ViolationKind::FsRead | ViolationKind::FsWrite => self
                .fs_ignores
                .iter()
                .any(|re| re.is_match(&event.subject)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_with(ignores: IgnoreViolationsConfig) -> (Arc<SandboxViolationStore>, ViolationSink) {
        let store = Arc::new(SandboxViolationStore::new());
        let sink = ViolationSink::new(store.clone(), Some(&ignores));
        (store, sink)
    }

    #[test]
    fn test_network_suppression() {
        let (store, sink) = sink_with(IgnoreViolationsConfig {
            filesystem: vec![],
            network: vec!["telemetry.example.com".to_string()],
        });

        sink.network_denied("telemetry.example.com", 443, "deny");
        sink.network_denied("other.example.com", 443, "deny");

        assert_eq!(store.total_count(), 2);
        let visible = store.get_violations(None);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].subject, "other.example.com:443");
    }

    #[test]
    fn test_filesystem_suppression() {
        let (store, sink) = sink_with(IgnoreViolationsConfig {
            filesystem: vec!["/proc/**".to_string()],
            network: vec![],
        });

        sink.record(ViolationEvent::new(
            ViolationKind::FsRead,
            "/proc/1/maps",
            "deny",
        ));
        sink.record(ViolationEvent::new(
            ViolationKind::FsRead,
            "/etc/shadow",
            "deny",
        ));

        let visible = store.get_violations(None);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].subject, "/etc/shadow");
    }

    #[test]
    fn test_active_execution_attribution() {
        let store = Arc::new(SandboxViolationStore::new());
        let sink = ViolationSink::new(store.clone(), None);
        sink.set_active(9, "digest".to_string());

        sink.network_denied("evil.com", 443, "deny");

        let visible = store.get_violations(None);
        assert_eq!(visible[0].execution_id, Some(9));
        assert_eq!(visible[0].encoded_command, "digest");
    }
}
