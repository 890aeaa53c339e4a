//! Sandbox manager: configuration lifecycle, proxy ownership, command
//! wrapping and teardown.

pub mod filesystem;
pub mod network;
pub mod state;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::sandbox::linux::{check_socat, generate_socket_path, SocatBridge};
use crate::sandbox::macos::{cleanup_temp_profiles, generate_profile, wrap_command, LogMonitor};
use crate::sandbox::{check_dependencies, detect_host};
use crate::utils::platform::Platform;
use crate::utils::render_env_prefix;
use crate::violation::store::{BroadcastListener, ExecutionListener};
use crate::violation::{encode_command, SandboxViolationStore, Subscription, ViolationSink};

use self::state::{ExecutionRecord, ManagerState};

/// One live manager per process: the sandboxed child inherits environment
/// and file descriptors once per process.
static MANAGER_LIVE: AtomicBool = AtomicBool::new(false);

/// Process-monotonic execution ids.
static EXECUTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Grace period for in-flight proxy connections on reset.
const RESET_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The sandbox manager. Owns the proxies, the violation store and the
/// compiled policy; dropping it tears everything down.
pub struct SandboxManager {
    state: Arc<RwLock<ManagerState>>,
}

impl SandboxManager {
    /// Create a manager. Fails while another instance is live in this
    /// process.
    pub fn new() -> Result<Self> {
        if MANAGER_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SandboxError::ManagerAlreadyLive);
        }

        Ok(Self {
            state: Arc::new(RwLock::new(ManagerState::new())),
        })
    }

    /// Initialize with a configuration: validate, compile the filesystem
    /// policy, start any proxy whose port was not supplied externally.
    ///
    /// Re-initializing with a structurally equal configuration is a no-op;
    /// a different configuration is rejected without touching state.
    pub async fn initialize(&self, config: SandboxConfig) -> Result<()> {
        config.validate()?;

        {
            let state = self.state.read();
            if state.initialized {
                return if state.config.as_ref() == Some(&config) {
                    Ok(())
                } else {
                    Err(SandboxError::AlreadyInitialized)
                };
            }
        }

        let platform = detect_host()?;
        let (read_plan, write_plan) = filesystem::compile_fs_plans(&config.filesystem, platform)?;

        let store = self.state.read().violation_store.clone();
        let sink = ViolationSink::new(store, config.ignore_violations.as_ref());

        let (http_proxy, socks_proxy) =
            network::initialize_proxies(&config.network, &sink).await?;

        let mut state = self.state.write();
        if state.initialized {
            // A concurrent initializer won; roll back our listeners.
            if let Some(mut proxy) = http_proxy {
                proxy.stop();
            }
            if let Some(mut proxy) = socks_proxy {
                proxy.stop();
            }
            return if state.config.as_ref() == Some(&config) {
                Ok(())
            } else {
                Err(SandboxError::AlreadyInitialized)
            };
        }

        state.http_proxy = http_proxy;
        state.socks_proxy = socks_proxy;
        state.read_plan = Some(read_plan);
        state.write_plan = Some(write_plan);
        state.sink = Some(sink);
        state.config = Some(config);
        state.initialized = true;

        tracing::info!(
            "sandbox manager initialized for {} (HTTP proxy: {:?}, SOCKS proxy: {:?})",
            platform.name(),
            state.http_proxy.as_ref().map(|p| p.port()),
            state.socks_proxy.as_ref().map(|p| p.port()),
        );

        Ok(())
    }

    /// Check if the manager is initialized.
    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// The HTTP proxy port, external or local.
    pub fn get_proxy_port(&self) -> Option<u16> {
        self.state.read().http_proxy.as_ref().map(|p| p.port())
    }

    /// The SOCKS5 proxy port, external or local.
    pub fn get_socks_proxy_port(&self) -> Option<u16> {
        self.state.read().socks_proxy.as_ref().map(|p| p.port())
    }

    /// The configured extra environment, in order.
    pub fn get_env(&self) -> Option<IndexMap<String, String>> {
        self.state.read().config.as_ref().and_then(|c| c.env.clone())
    }

    /// The configured pre-command.
    pub fn get_pre_command(&self) -> Option<String> {
        self.state
            .read()
            .config
            .as_ref()
            .and_then(|c| c.pre_command.clone())
    }

    /// The violation store.
    pub fn get_violation_store(&self) -> Arc<SandboxViolationStore> {
        self.state.read().violation_store.clone()
    }

    /// The id assigned by the most recent `wrap_with_sandbox`.
    pub fn last_execution_id(&self) -> Option<u64> {
        self.state.read().last_execution
    }

    /// Subscribe to all violations.
    pub fn subscribe(&self, listener: BroadcastListener) -> Subscription {
        self.state.read().violation_store.subscribe(listener)
    }

    /// Subscribe to one execution's violations.
    pub fn subscribe_to_execution(
        &self,
        execution_id: u64,
        listener: ExecutionListener,
    ) -> Subscription {
        self.state
            .read()
            .violation_store
            .subscribe_to_execution(execution_id, listener)
    }

    /// Wrap a command with the assembled sandbox. The result is directly
    /// executable by a POSIX shell and carries the sandbox environment.
    pub async fn wrap_with_sandbox(&self, command: &str) -> Result<String> {
        let (config, read_plan, write_plan, sink, http_port, socks_port) = {
            let state = self.state.read();
            if !state.initialized {
                return Err(SandboxError::NotInitialized);
            }
            (
                state.config.clone().ok_or(SandboxError::NotInitialized)?,
                state.read_plan.clone().ok_or(SandboxError::NotInitialized)?,
                state.write_plan.clone().ok_or(SandboxError::NotInitialized)?,
                state.sink.clone().ok_or(SandboxError::NotInitialized)?,
                state.http_proxy.as_ref().map(|p| p.port()),
                state.socks_proxy.as_ref().map(|p| p.port()),
            )
        };

        let platform = detect_host()?;

        let deps = check_dependencies(platform, &config);
        for warning in &deps.warnings {
            tracing::warn!("{}", warning);
        }
        deps.into_result()?;

        let execution_id = EXECUTION_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
        let effective = effective_command(config.pre_command.as_deref(), command);
        let encoded = encode_command(&effective);
        let env_vars = network::build_sandbox_env(http_port, socks_port, config.env.as_ref());

        let wrapped = match platform {
            Platform::MacOS => {
                let tag = crate::sandbox::macos::generate_log_tag(execution_id, &encoded);
                let profile = generate_profile(
                    &config,
                    &read_plan,
                    &write_plan,
                    http_port,
                    socks_port,
                    Some(&tag),
                );
                let wrapped = wrap_command(&effective, &profile, &env_vars, execution_id)?;

                // The log binary only exists on an actual macOS host.
                if cfg!(target_os = "macos") {
                    match LogMonitor::start(tag, sink.clone()).await {
                        Ok(monitor) => self.state.write().monitors.push(monitor),
                        Err(e) => tracing::warn!("audit monitor unavailable: {}", e),
                    }
                }

                wrapped
            }
            Platform::Linux => {
                let (http_socket, socks_socket) =
                    self.ensure_bridges(&config, http_port, socks_port).await?;

                if !crate::sandbox::linux::check_bwrap() {
                    // Dependency checking only lets this through in nested
                    // mode: run without the container layer.
                    tracing::warn!("bwrap unavailable; running without container isolation");
                    format!(
                        "{}/bin/sh -c {}",
                        render_env_prefix(&env_vars),
                        crate::utils::quote(&effective)
                    )
                } else {
                    let cwd = std::env::current_dir()?;
                    let (bwrap_cmd, warnings) = crate::sandbox::linux::generate_bwrap_command(
                        &effective,
                        &config,
                        &read_plan,
                        &write_plan,
                        &cwd,
                        http_socket.as_deref(),
                        socks_socket.as_deref(),
                        http_port,
                        socks_port,
                    )?;
                    for warning in warnings {
                        tracing::warn!("{}", warning);
                    }
                    format!("{}{}", render_env_prefix(&env_vars), bwrap_cmd)
                }
            }
        };

        {
            let mut state = self.state.write();
            state.executions.insert(
                execution_id,
                ExecutionRecord {
                    effective_command: effective,
                    encoded_command: encoded.clone(),
                },
            );
            state.last_execution = Some(execution_id);
        }
        sink.set_active(execution_id, encoded);

        tracing::debug!("wrapped command for execution {}", execution_id);

        Ok(wrapped)
    }

    /// Record the end of a wrapped execution. On Linux this drives the
    /// post-hoc violation synthesis.
    pub fn finish_execution(&self, execution_id: u64, exit_code: i32) {
        let (record, read_plan, write_plan, sink) = {
            let state = self.state.read();
            let Some(record) = state.executions.get(&execution_id).cloned() else {
                return;
            };
            let (Some(read), Some(write), Some(sink)) = (
                state.read_plan.clone(),
                state.write_plan.clone(),
                state.sink.clone(),
            ) else {
                return;
            };
            (record, read, write, sink)
        };

        if matches!(detect_host(), Ok(Platform::Linux)) {
            let events = crate::sandbox::linux::synthesize_violations(
                &record.effective_command,
                exit_code,
                &read_plan,
                &write_plan,
            );
            for event in events {
                sink.record(
                    event
                        .with_execution(execution_id)
                        .with_encoded_command(record.encoded_command.clone()),
                );
            }
        }
    }

    /// Create the socat bridges once, reusing them for later wraps.
    async fn ensure_bridges(
        &self,
        config: &SandboxConfig,
        http_port: Option<u16>,
        socks_port: Option<u16>,
    ) -> Result<(Option<String>, Option<String>)> {
        let (Some(http_port), Some(socks_port)) = (http_port, socks_port) else {
            return Ok((None, None));
        };

        {
            let state = self.state.read();
            if state.http_socket_path.is_some() {
                return Ok((
                    state.http_socket_path.clone(),
                    state.socks_socket_path.clone(),
                ));
            }
        }

        if !check_socat() {
            if config.enable_weaker_nested_sandbox {
                tracing::warn!("socat unavailable; proxy bridges skipped (nested sandbox)");
                return Ok((None, None));
            }
            return Err(SandboxError::ToolchainMissing {
                tool: "socat".to_string(),
            });
        }

        let http_socket = generate_socket_path("procbox-http");
        let socks_socket = generate_socket_path("procbox-socks");

        let http_bridge = SocatBridge::unix_to_tcp(http_socket.clone(), http_port).await?;
        let socks_bridge = match SocatBridge::unix_to_tcp(socks_socket.clone(), socks_port).await {
            Ok(bridge) => bridge,
            Err(e) => {
                drop(http_bridge);
                return Err(e);
            }
        };

        let mut state = self.state.write();
        state.bridges.push(http_bridge);
        state.bridges.push(socks_bridge);
        state.http_socket_path = Some(http_socket.display().to_string());
        state.socks_socket_path = Some(socks_socket.display().to_string());

        Ok((
            state.http_socket_path.clone(),
            state.socks_socket_path.clone(),
        ))
    }

    /// Tear everything down: stop proxies, wait for in-flight connections
    /// up to a bounded grace period, drop subscribers, remove temp files.
    /// Safe to call when uninitialized.
    pub async fn reset(&self) {
        let (http, socks, bridges, monitors, store) = {
            let mut state = self.state.write();
            let http = state.http_proxy.take();
            let socks = state.socks_proxy.take();
            let bridges = std::mem::take(&mut state.bridges);
            let monitors = std::mem::take(&mut state.monitors);
            state.http_socket_path = None;
            state.socks_socket_path = None;
            state.config = None;
            state.read_plan = None;
            state.write_plan = None;
            state.sink = None;
            state.executions.clear();
            state.last_execution = None;
            state.initialized = false;
            (http, socks, bridges, monitors, state.violation_store.clone())
        };

        let mut http = http;
        let mut socks = socks;
        if let Some(proxy) = http.as_mut() {
            proxy.stop();
        }
        if let Some(proxy) = socks.as_mut() {
            proxy.stop();
        }

        let deadline = Instant::now() + RESET_DRAIN_TIMEOUT;
        loop {
            let active = http.as_ref().map(|p| p.active_connections()).unwrap_or(0)
                + socks.as_ref().map(|p| p.active_connections()).unwrap_or(0);
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("force-closing {} in-flight proxy connections", active);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for mut bridge in bridges {
            bridge.stop().await;
        }
        for mut monitor in monitors {
            monitor.stop().await;
        }

        cleanup_temp_profiles();
        store.clear_subscribers();

        tracing::info!("sandbox manager reset");
    }
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        let mut state = self.state.write();
        if let Some(proxy) = state.http_proxy.as_mut() {
            proxy.stop();
        }
        if let Some(proxy) = state.socks_proxy.as_mut() {
            proxy.stop();
        }
        // Bridge and monitor children die through their own Drop impls.
        state.bridges.clear();
        state.monitors.clear();
        state.violation_store.clear_subscribers();
        drop(state);

        cleanup_temp_profiles();
        MANAGER_LIVE.store(false, Ordering::SeqCst);
    }
}

/// A failing pre-command aborts the run with exit code 66 before the user
/// command starts.
fn effective_command(pre_command: Option<&str>, command: &str) -> String {
    match pre_command {
        Some(pre) => format!("( {pre} ) || exit 66; {command}"),
        None => command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use parking_lot::Mutex;

    /// The liveness guard admits one manager at a time, so manager tests
    /// serialize on this lock.
    static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn restricted_config() -> SandboxConfig {
        let mut config = SandboxConfig::default();
        config.network.allowed_domains = vec!["example.com".to_string()];
        config
    }

    #[test]
    fn test_effective_command_composition() {
        assert_eq!(effective_command(None, "echo x"), "echo x");
        assert_eq!(
            effective_command(Some("exit 1"), "echo x"),
            "( exit 1 ) || exit 66; echo x"
        );
    }

    #[tokio::test]
    async fn test_singleton_guard() {
        let _lock = TEST_LOCK.lock();

        let first = SandboxManager::new().unwrap();
        assert!(matches!(
            SandboxManager::new(),
            Err(SandboxError::ManagerAlreadyLive)
        ));

        drop(first);
        let second = SandboxManager::new().unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn test_both_external_ports() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();

        let mut config = restricted_config();
        config.network.http_proxy_port = Some(9090);
        config.network.socks_proxy_port = Some(9091);

        manager.initialize(config).await.unwrap();
        assert_eq!(manager.get_proxy_port(), Some(9090));
        assert_eq!(manager.get_socks_proxy_port(), Some(9091));

        manager.reset().await;
    }

    #[tokio::test]
    async fn test_external_http_local_socks() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();

        let mut config = restricted_config();
        config.network.http_proxy_port = Some(8888);

        manager.initialize(config).await.unwrap();
        assert_eq!(manager.get_proxy_port(), Some(8888));

        let socks = manager.get_socks_proxy_port().unwrap();
        assert_ne!(socks, 8888);
        assert!(socks > 0);

        manager.reset().await;
    }

    #[tokio::test]
    async fn test_dynamic_ports_distinct() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();

        manager.initialize(restricted_config()).await.unwrap();
        let http = manager.get_proxy_port().unwrap();
        let socks = manager.get_socks_proxy_port().unwrap();

        assert!(http > 0);
        assert!(socks > 0);
        assert_ne!(http, socks);

        manager.reset().await;
    }

    #[tokio::test]
    async fn test_unrestricted_network_starts_no_proxies() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();

        manager.initialize(SandboxConfig::default()).await.unwrap();
        assert_eq!(manager.get_proxy_port(), None);
        assert_eq!(manager.get_socks_proxy_port(), None);

        manager.reset().await;
    }

    #[tokio::test]
    async fn test_initialize_idempotent_and_conflicting() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();

        let mut config = restricted_config();
        config.network.http_proxy_port = Some(9090);
        config.network.socks_proxy_port = Some(9091);

        manager.initialize(config.clone()).await.unwrap();
        let port_before = manager.get_proxy_port();

        // Same config: no-op.
        manager.initialize(config.clone()).await.unwrap();
        assert_eq!(manager.get_proxy_port(), port_before);

        // Different config: rejected, state unchanged.
        let mut other = config.clone();
        other.network.http_proxy_port = Some(9092);
        assert!(matches!(
            manager.initialize(other).await,
            Err(SandboxError::AlreadyInitialized)
        ));
        assert_eq!(manager.get_proxy_port(), port_before);

        manager.reset().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_without_state_change() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();

        let mut config = SandboxConfig::default();
        config.network.http_proxy_port = Some(65536);
        assert!(matches!(
            manager.initialize(config).await,
            Err(SandboxError::InvalidConfig { .. })
        ));
        assert!(!manager.is_initialized());

        drop(manager);
    }

    #[tokio::test]
    async fn test_reset_safe_when_uninitialized() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();
        manager.reset().await;
        manager.reset().await;
        drop(manager);
    }

    #[tokio::test]
    async fn test_wrap_requires_initialize() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();
        assert!(matches!(
            manager.wrap_with_sandbox("echo x").await,
            Err(SandboxError::NotInitialized)
        ));
        drop(manager);
    }

    #[tokio::test]
    async fn test_wrap_emits_env_and_reuses_proxies() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();

        let mut config = restricted_config();
        // External ports keep the wrap independent of local tooling, and
        // nested mode tolerates machines without bwrap/socat/seccomp.
        config.network.http_proxy_port = Some(9090);
        config.network.socks_proxy_port = Some(9091);
        config.enable_weaker_nested_sandbox = true;
        let mut env = IndexMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        config.env = Some(env);
        manager.initialize(config).await.unwrap();

        let wrapped = manager.wrap_with_sandbox("echo x").await.unwrap();
        assert!(wrapped.contains("HTTP_PROXY=http://localhost:9090"));
        assert!(wrapped.contains("HTTPS_PROXY=http://localhost:9090"));
        assert!(wrapped.contains("ALL_PROXY=socks5://localhost:9091"));
        assert!(wrapped.contains("NO_PROXY="));
        assert!(wrapped.contains("SANDBOX_RUNTIME=1"));
        assert!(wrapped.contains("TMPDIR=/tmp/claude"));
        assert!(wrapped.contains("FOO=bar"));
        assert!(wrapped.contains("echo x"));

        let http = wrapped.find("HTTP_PROXY=").unwrap();
        let runtime = wrapped.find("SANDBOX_RUNTIME=").unwrap();
        let foo = wrapped.find("FOO=bar").unwrap();
        assert!(http < runtime && runtime < foo);

        // The second wrap reuses the same proxy ports.
        let second = manager.wrap_with_sandbox("echo y").await.unwrap();
        assert!(second.contains("HTTP_PROXY=http://localhost:9090"));

        let first_id = manager.last_execution_id().unwrap();
        assert!(first_id > 0);

        manager.reset().await;
    }

    #[tokio::test]
    async fn test_pre_command_guard_in_wrapped_command() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();

        let mut config = restricted_config();
        config.network.http_proxy_port = Some(9090);
        config.network.socks_proxy_port = Some(9091);
        config.enable_weaker_nested_sandbox = true;
        config.pre_command = Some("exit 1".to_string());
        manager.initialize(config).await.unwrap();

        let wrapped = manager.wrap_with_sandbox("echo x").await.unwrap();
        assert!(wrapped.contains("( exit 1 ) || exit 66; echo x"));

        manager.reset().await;
    }

    #[tokio::test]
    async fn test_finish_execution_synthesizes_probe_violations() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();

        let mut config = restricted_config();
        config.network.http_proxy_port = Some(9090);
        config.network.socks_proxy_port = Some(9091);
        config.enable_weaker_nested_sandbox = true;
        config.filesystem.read_policy = crate::config::ReadPolicy::AllowOnly;
        config.filesystem.allow_read = vec!["/t/ok/".to_string()];
        manager.initialize(config).await.unwrap();

        manager.wrap_with_sandbox("cat /t/bad").await.unwrap();
        let execution_id = manager.last_execution_id().unwrap();

        manager.finish_execution(execution_id, 1);

        if matches!(detect_host(), Ok(Platform::Linux)) {
            let store = manager.get_violation_store();
            let violations = store.get_violations(None);
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].subject, "/t/bad");
            assert_eq!(violations[0].execution_id, Some(execution_id));
        }

        manager.reset().await;
    }

    #[tokio::test]
    async fn test_subscription_survives_reset() {
        let _lock = TEST_LOCK.lock();
        let manager = SandboxManager::new().unwrap();
        manager.initialize(restricted_config()).await.unwrap();

        let sub = manager.subscribe(Box::new(|_| {}));
        manager.reset().await;
        // Unsubscribing after teardown must be inert, not a crash.
        sub.unsubscribe();

        drop(manager);
    }
}
