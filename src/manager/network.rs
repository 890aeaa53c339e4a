//! Proxy provisioning and sandbox environment assembly.

use indexmap::IndexMap;

use crate::config::NetworkConfig;
use crate::error::{Result, SandboxError};
use crate::manager::state::ProxyEndpoint;
use crate::proxy::{HostFilter, HttpProxy, Socks5Proxy};
use crate::violation::ViolationSink;

/// Start the proxy pair for a network configuration.
///
/// Configured ports are treated as externally managed: no listener is
/// started and no liveness probe is attempted. With no network section at
/// all, filtering is disabled and no proxies run. If the second listener
/// fails to bind, the first is rolled back before the error surfaces.
pub async fn initialize_proxies(
    config: &NetworkConfig,
    sink: &ViolationSink,
) -> Result<(
    Option<ProxyEndpoint<HttpProxy>>,
    Option<ProxyEndpoint<Socks5Proxy>>,
)> {
    if config.is_unrestricted() {
        return Ok((None, None));
    }

    let filter = HostFilter::from_config(config);

    let mut http = match config.http_port() {
        Some(port) => ProxyEndpoint::External { port },
        None => {
            let mut proxy = HttpProxy::new(filter.clone(), sink.clone())
                .await
                .map_err(|e| bind_error("http", 0, e))?;
            proxy.start()?;
            ProxyEndpoint::Local(proxy)
        }
    };

    let socks = match config.socks_port() {
        Some(port) => ProxyEndpoint::External { port },
        None => {
            match Socks5Proxy::new(filter, sink.clone()).await {
                Ok(mut proxy) => {
                    proxy.start()?;
                    ProxyEndpoint::Local(proxy)
                }
                Err(e) => {
                    // No partial initialization is observable.
                    http.stop();
                    return Err(bind_error("socks", 0, e));
                }
            }
        }
    };

    tracing::debug!(
        "proxies ready - HTTP: {} ({}), SOCKS5: {} ({})",
        http.port(),
        if http.is_local() { "local" } else { "external" },
        socks.port(),
        if socks.is_local() { "local" } else { "external" },
    );

    Ok((Some(http), Some(socks)))
}

fn bind_error(which: &'static str, port: u16, err: SandboxError) -> SandboxError {
    match err {
        SandboxError::Io(cause) => SandboxError::ProxyBind { which, port, cause },
        other => other,
    }
}

/// Assemble the wrapped command's environment, in emission order: the proxy
/// variables (omitted entirely when no proxy port exists), the runtime
/// markers, then the user's entries in their original order.
pub fn build_sandbox_env(
    http_port: Option<u16>,
    socks_port: Option<u16>,
    user_env: Option<&IndexMap<String, String>>,
) -> Vec<(String, String)> {
    let mut env = Vec::new();

    if let Some(port) = http_port {
        env.push(("HTTP_PROXY".to_string(), format!("http://localhost:{port}")));
        env.push(("HTTPS_PROXY".to_string(), format!("http://localhost:{port}")));
    }
    if let Some(port) = socks_port {
        env.push(("ALL_PROXY".to_string(), format!("socks5://localhost:{port}")));
    }
    if http_port.is_some() || socks_port.is_some() {
        env.push(("NO_PROXY".to_string(), String::new()));
    }

    env.push(("SANDBOX_RUNTIME".to_string(), "1".to_string()));
    env.push(("TMPDIR".to_string(), "/tmp/claude".to_string()));

    if let Some(user_env) = user_env {
        for (key, value) in user_env {
            env.push((key.clone(), value.clone()));
        }
    }

    env
}
