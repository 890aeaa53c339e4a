//! Linux sandbox backend: bubblewrap + seccomp + socat proxy bridges.

pub mod bridge;
pub mod bwrap;
pub mod filesystem;
pub mod probe;
pub mod seccomp;

pub use bridge::{check_socat, generate_socket_path, SocatBridge};
pub use bwrap::{check_bwrap, generate_bwrap_command};
pub use filesystem::{generate_bind_mounts, BindMount};
pub use probe::synthesize_violations;
pub use seccomp::is_seccomp_available;
