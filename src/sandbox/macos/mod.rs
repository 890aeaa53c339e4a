//! macOS sandbox backend: Seatbelt profiles executed via sandbox-exec.

pub mod monitor;
pub mod profile;
pub mod wrapper;

pub use monitor::{parse_audit_line, LogMonitor};
pub use profile::{generate_log_tag, generate_profile};
pub use wrapper::{cleanup_temp_profiles, wrap_command};
