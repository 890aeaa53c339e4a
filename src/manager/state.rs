//! Internal state for the sandbox manager.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SandboxConfig;
use crate::manager::filesystem::{FsReadPlan, FsWritePlan};
use crate::proxy::{HttpProxy, Socks5Proxy};
use crate::sandbox::linux::SocatBridge;
use crate::sandbox::macos::LogMonitor;
use crate::violation::{SandboxViolationStore, ViolationSink};

/// A proxy endpoint: either caller-managed on a fixed port, or a local
/// listener owned by the manager.
pub enum ProxyEndpoint<P> {
    /// Externally supplied; no listener, no liveness probe.
    External { port: u16 },
    /// Locally bound and owned.
    Local(P),
}

macro_rules! endpoint_impl {
    ($proxy:ty) => {
        impl ProxyEndpoint<$proxy> {
            pub fn port(&self) -> u16 {
                match self {
                    ProxyEndpoint::External { port } => *port,
                    ProxyEndpoint::Local(proxy) => proxy.port(),
                }
            }

            pub fn stop(&mut self) {
                if let ProxyEndpoint::Local(proxy) = self {
                    proxy.stop();
                }
            }

            pub fn active_connections(&self) -> usize {
                match self {
                    ProxyEndpoint::External { .. } => 0,
                    ProxyEndpoint::Local(proxy) => proxy.active_connections(),
                }
            }

            pub fn is_local(&self) -> bool {
                matches!(self, ProxyEndpoint::Local(_))
            }
        }
    };
}

endpoint_impl!(HttpProxy);
endpoint_impl!(Socks5Proxy);

/// Bookkeeping for one wrapped execution.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// The effective command (pre-command guard applied).
    pub effective_command: String,
    /// Digest attributed to this execution's violations.
    pub encoded_command: String,
}

/// Everything behind the manager's state cell.
pub struct ManagerState {
    pub config: Option<SandboxConfig>,
    pub http_proxy: Option<ProxyEndpoint<HttpProxy>>,
    pub socks_proxy: Option<ProxyEndpoint<Socks5Proxy>>,
    pub read_plan: Option<FsReadPlan>,
    pub write_plan: Option<FsWritePlan>,
    pub sink: Option<ViolationSink>,
    /// Host-side socat bridges (Linux), created at first wrap.
    pub bridges: Vec<SocatBridge>,
    pub http_socket_path: Option<String>,
    pub socks_socket_path: Option<String>,
    /// Per-execution audit monitors (macOS).
    pub monitors: Vec<LogMonitor>,
    pub executions: HashMap<u64, ExecutionRecord>,
    pub last_execution: Option<u64>,
    pub initialized: bool,
    pub violation_store: Arc<SandboxViolationStore>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            config: None,
            http_proxy: None,
            socks_proxy: None,
            read_plan: None,
            write_plan: None,
            sink: None,
            bridges: Vec::new(),
            http_socket_path: None,
            socks_socket_path: None,
            monitors: Vec::new(),
            executions: HashMap::new(),
            last_execution: None,
            initialized: false,
            violation_store: Arc::new(SandboxViolationStore::new()),
        }
    }
}

impl ManagerState {
    pub fn new() -> Self {
        Self::default()
    }
}
