//! SOCKS5 proxy server (RFC 1928), CONNECT only.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::{Result, SandboxError};
use crate::proxy::matcher::{FilterDecision, HostFilter};
use crate::proxy::relay;
use crate::violation::ViolationSink;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// SOCKS5 proxy server bound to loopback.
pub struct Socks5Proxy {
    listener: Option<TcpListener>,
    port: u16,
    filter: Arc<HostFilter>,
    sink: ViolationSink,
    shutdown_tx: Option<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl Socks5Proxy {
    /// Bind a new SOCKS5 proxy on an OS-assigned loopback port.
    pub async fn new(filter: HostFilter, sink: ViolationSink) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        tracing::debug!("SOCKS5 proxy listening on port {}", port);

        Ok(Self {
            listener: Some(listener),
            port,
            filter: Arc::new(filter),
            sink,
            shutdown_tx: None,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Start the accept loop.
    pub fn start(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| SandboxError::internal("SOCKS5 proxy already started"))?;

        let filter = self.filter.clone();
        let sink = self.sink.clone();
        let active = self.active.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(async move {
            let mut accept_shutdown = shutdown_rx.clone();
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, addr)) => {
                                let filter = filter.clone();
                                let sink = sink.clone();
                                let mut conn_shutdown = shutdown_rx.clone();
                                let active = active.clone();
                                tokio::spawn(async move {
                                    active.fetch_add(1, Ordering::SeqCst);
                                    tokio::select! {
                                        result = handle_client(stream, filter, sink) => {
                                            if let Err(e) = result {
                                                tracing::debug!("SOCKS5 error from {}: {}", addr, e);
                                            }
                                        }
                                        _ = conn_shutdown.changed() => {}
                                    }
                                    active.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                            Err(e) => {
                                tracing::error!("SOCKS5 accept error: {}", e);
                            }
                        }
                    }
                    _ = accept_shutdown.changed() => {
                        tracing::debug!("SOCKS5 proxy shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Signal shutdown: the accept loop stops and connection tasks abort.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    filter: Arc<HostFilter>,
    sink: ViolationSink,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Method negotiation.
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err("invalid SOCKS version".into());
    }

    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err("no supported authentication method".into());
    }

    stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;

    // Connection request.
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;

    if request[0] != SOCKS_VERSION {
        return Err("invalid SOCKS version in request".into());
    }

    let cmd = request[1];
    let atyp = request[3];

    if cmd != CMD_CONNECT {
        // BIND and UDP ASSOCIATE are refused.
        send_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED, "0.0.0.0", 0).await?;
        return Err(format!("unsupported SOCKS command {cmd:#04x}").into());
    }

    let (host, port) = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(&mut stream).await?;
            (std::net::Ipv4Addr::from(addr).to_string(), port)
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let mut domain = vec![0u8; len_buf[0] as usize];
            stream.read_exact(&mut domain).await?;
            let port = read_port(&mut stream).await?;
            (String::from_utf8_lossy(&domain).to_string(), port)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(&mut stream).await?;
            (std::net::Ipv6Addr::from(addr).to_string(), port)
        }
        _ => {
            send_reply(&mut stream, REP_GENERAL_FAILURE, "0.0.0.0", 0).await?;
            return Err("unsupported address type".into());
        }
    };

    tracing::debug!("SOCKS5 CONNECT {}:{}", host, port);

    if filter.check(&host, port) == FilterDecision::Deny {
        tracing::debug!("SOCKS5 denied connection to {}:{}", host, port);
        sink.network_denied(&host, port, format!("SOCKS5 CONNECT {host}:{port}"));
        send_reply(&mut stream, REP_CONNECTION_NOT_ALLOWED, "0.0.0.0", 0).await?;
        return Ok(());
    }

    let target = match relay::dial(&host, port).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("SOCKS5 dial to {}:{} failed: {}", host, port, e);
            let rep = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
                _ => REP_HOST_UNREACHABLE,
            };
            send_reply(&mut stream, rep, "0.0.0.0", 0).await?;
            return Ok(());
        }
    };

    // Upstream bytes flow only after the success reply.
    let local_addr = target.local_addr()?;
    let (bind_addr, bind_port) = match local_addr {
        SocketAddr::V4(addr) => (addr.ip().to_string(), addr.port()),
        SocketAddr::V6(addr) => (addr.ip().to_string(), addr.port()),
    };
    send_reply(&mut stream, REP_SUCCESS, &bind_addr, bind_port).await?;

    if let Err(e) = relay::relay_bidirectional(stream, target).await {
        tracing::debug!("SOCKS5 relay to {}:{} closed: {}", host, port, e);
    }

    Ok(())
}

async fn read_port(stream: &mut TcpStream) -> std::io::Result<u16> {
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    Ok(u16::from_be_bytes(port_buf))
}

/// Send a SOCKS5 reply.
async fn send_reply(
    stream: &mut TcpStream,
    rep: u8,
    addr: &str,
    port: u16,
) -> std::io::Result<()> {
    let mut reply = vec![SOCKS_VERSION, rep, 0x00];

    if let Ok(ipv4) = addr.parse::<std::net::Ipv4Addr>() {
        reply.push(ATYP_IPV4);
        reply.extend_from_slice(&ipv4.octets());
    } else if let Ok(ipv6) = addr.parse::<std::net::Ipv6Addr>() {
        reply.push(ATYP_IPV6);
        reply.extend_from_slice(&ipv6.octets());
    } else {
        reply.push(ATYP_DOMAIN);
        reply.push(addr.len() as u8);
        reply.extend_from_slice(addr.as_bytes());
    }

    reply.extend_from_slice(&port.to_be_bytes());

    stream.write_all(&reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::matcher::HostPattern;
    use crate::violation::{SandboxViolationStore, ViolationKind};

    async fn start_proxy(allow: &[&str], deny: &[&str]) -> (Socks5Proxy, Arc<SandboxViolationStore>) {
        let filter = HostFilter::new(
            allow.iter().map(|p| HostPattern::parse(p).unwrap()).collect(),
            deny.iter().map(|p| HostPattern::parse(p).unwrap()).collect(),
        );
        let store = Arc::new(SandboxViolationStore::new());
        let sink = ViolationSink::new(store.clone(), None);
        let mut proxy = Socks5Proxy::new(filter, sink).await.unwrap();
        proxy.start().unwrap();
        (proxy, store)
    }

    async fn handshake(port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
        stream
    }

    fn domain_request(cmd: u8, host: &str, port: u16) -> Vec<u8> {
        let mut req = vec![0x05, cmd, 0x00, ATYP_DOMAIN, host.len() as u8];
        req.extend_from_slice(host.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    async fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        let addr_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            _ => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                len[0] as usize
            }
        };
        let mut rest = vec![0u8; addr_len + 2];
        stream.read_exact(&mut rest).await.unwrap();
        head.to_vec()
    }

    #[tokio::test]
    async fn test_denied_host_replies_0x02() {
        let (mut proxy, store) = start_proxy(&["example.com"], &[]).await;
        let mut stream = handshake(proxy.port()).await;

        stream
            .write_all(&domain_request(CMD_CONNECT, "evil.com", 443))
            .await
            .unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply[1], REP_CONNECTION_NOT_ALLOWED);

        let violations = store.get_violations(None);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Network);
        assert_eq!(violations[0].subject, "evil.com:443");

        proxy.stop();
    }

    #[tokio::test]
    async fn test_deny_precedence_replies_0x02() {
        let (mut proxy, _store) = start_proxy(&["example.com"], &["example.com"]).await;
        let mut stream = handshake(proxy.port()).await;

        stream
            .write_all(&domain_request(CMD_CONNECT, "example.com", 443))
            .await
            .unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply[1], REP_CONNECTION_NOT_ALLOWED);

        proxy.stop();
    }

    #[tokio::test]
    async fn test_bind_command_replies_0x07() {
        let (mut proxy, _store) = start_proxy(&["*"], &[]).await;
        let mut stream = handshake(proxy.port()).await;

        stream
            .write_all(&domain_request(0x02, "example.com", 443))
            .await
            .unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);

        proxy.stop();
    }

    #[tokio::test]
    async fn test_refused_upstream_replies_0x05() {
        let (mut proxy, _store) = start_proxy(&["127.0.0.1"], &[]).await;
        let mut stream = handshake(proxy.port()).await;

        // IPv4 ATYP for 127.0.0.1:1, which is not listening.
        let mut req = vec![0x05, CMD_CONNECT, 0x00, ATYP_IPV4, 127, 0, 0, 1];
        req.extend_from_slice(&1u16.to_be_bytes());
        stream.write_all(&req).await.unwrap();
        let reply = read_reply(&mut stream).await;
        assert!(reply[1] == REP_CONNECTION_REFUSED || reply[1] == REP_HOST_UNREACHABLE);

        proxy.stop();
    }

    #[tokio::test]
    async fn test_connect_relays_after_success_reply() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut s, _)) = upstream.accept().await {
                let mut buf = [0u8; 64];
                if let Ok(n) = s.read(&mut buf).await {
                    let _ = s.write_all(&buf[..n]).await;
                }
            }
        });

        let (mut proxy, _store) = start_proxy(&["127.0.0.1"], &[]).await;
        let mut stream = handshake(proxy.port()).await;

        let mut req = vec![0x05, CMD_CONNECT, 0x00, ATYP_IPV4, 127, 0, 0, 1];
        req.extend_from_slice(&upstream_port.to_be_bytes());
        stream.write_all(&req).await.unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply[1], REP_SUCCESS);

        stream.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        proxy.stop();
    }
}
