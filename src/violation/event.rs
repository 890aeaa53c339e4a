//! Violation event type.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Kind of a recorded violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    FsRead,
    FsWrite,
    Network,
    SyscallDenied,
    Other,
}

/// A single sandbox violation.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationEvent {
    /// Store-assigned id, monotonically increasing.
    pub id: u64,

    /// The execution that triggered the violation, when attributable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<u64>,

    /// What was violated.
    pub kind: ViolationKind,

    /// The denied path, or `host:port` for network violations.
    pub subject: String,

    /// Offending process id, when the audit stream reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// The original audit line, verbatim.
    pub raw: String,

    /// Milliseconds since the Unix epoch.
    pub ts_ms: u64,

    /// Stable digest of the wrapped command.
    pub encoded_command: String,

    /// Matched an ignore pattern; counted but hidden from reports.
    #[serde(skip)]
    pub suppressed: bool,
}

impl ViolationEvent {
    /// Create an event; the id is assigned when it enters the store.
    pub fn new(kind: ViolationKind, subject: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            id: 0,
            execution_id: None,
            kind,
            subject: subject.into(),
            pid: None,
            raw: raw.into(),
            ts_ms: now_ms(),
            encoded_command: String::new(),
            suppressed: false,
        }
    }

    pub fn with_execution(mut self, execution_id: u64) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_encoded_command(mut self, encoded: impl Into<String>) -> Self {
        self.encoded_command = encoded.into();
        self
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stable digest of a wrapped command: lowercase hex SHA-256.
/// The same command string hashes identically across runs, so violations
/// can be attributed without retaining the literal command.
pub fn encode_command(command: &str) -> String {
    hex::encode(Sha256::digest(command.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_stable_and_distinct() {
        let a1 = encode_command("echo hello");
        let a2 = encode_command("echo hello");
        let b = encode_command("echo world");

        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.len(), 64);
        assert!(a1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_violation_json_shape() {
        let event = ViolationEvent::new(ViolationKind::Network, "evil.com:443", "deny line")
            .with_execution(7)
            .with_encoded_command(encode_command("curl evil.com"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "network");
        assert_eq!(json["execution_id"], 7);
        assert_eq!(json["subject"], "evil.com:443");
        assert_eq!(json["raw"], "deny line");
        assert!(json["ts_ms"].as_u64().is_some());
        assert!(json.get("suppressed").is_none());
    }

    #[test]
    fn test_kind_serialization() {
        for (kind, expected) in [
            (ViolationKind::FsRead, "fs_read"),
            (ViolationKind::FsWrite, "fs_write"),
            (ViolationKind::Network, "network"),
            (ViolationKind::SyscallDenied, "syscall_denied"),
            (ViolationKind::Other, "other"),
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), expected);
        }
    }
}
