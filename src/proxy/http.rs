//! HTTP/1.1 forward proxy with CONNECT tunneling.
//!
//! CONNECT requests are handled on the raw socket so the success line can
//! be written byte-exact (`HTTP/1.1 200 Connection Established`); plain
//! requests are replayed into hyper for header-aware forwarding.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::{Result, SandboxError};
use crate::proxy::matcher::{FilterDecision, HostFilter};
use crate::proxy::relay;
use crate::violation::ViolationSink;

const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// Cap on a buffered CONNECT request head; the client is untrusted.
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// HTTP proxy server bound to loopback.
pub struct HttpProxy {
    listener: Option<TcpListener>,
    port: u16,
    filter: Arc<HostFilter>,
    sink: ViolationSink,
    shutdown_tx: Option<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl HttpProxy {
    /// Bind a new HTTP proxy on an OS-assigned loopback port.
    pub async fn new(filter: HostFilter, sink: ViolationSink) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        tracing::debug!("HTTP proxy listening on port {}", port);

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
            .ok_or_else(|| SandboxError::internal("HTTP proxy already started"))?;

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
                                        result = handle_connection(stream, filter, sink) => {
                                            if let Err(e) = result {
                                                tracing::debug!("connection error from {}: {}", addr, e);
                                            }
                                        }
                                        _ = conn_shutdown.changed() => {}
                                    }
                                    active.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                            Err(e) => {
                                tracing::error!("HTTP proxy accept error: {}", e);
                            }
                        }
                    }
                    _ = accept_shutdown.changed() => {
                        tracing::debug!("HTTP proxy shutting down");
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

/// Sniff the request method, then dispatch: CONNECT stays on the raw
/// socket, everything else goes through hyper with the sniffed bytes
/// replayed.
async fn handle_connection(
    mut stream: TcpStream,
    filter: Arc<HostFilter>,
    sink: ViolationSink,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buffered = Vec::with_capacity(1024);

    let is_connect = loop {
        let have = buffered.len().min(CONNECT_PREFIX.len());
        if buffered[..have] != CONNECT_PREFIX[..have] {
            break false;
        }
        if buffered.len() >= CONNECT_PREFIX.len() {
            break true;
        }

        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffered.extend_from_slice(&chunk[..n]);
    };

    if is_connect {
        return handle_connect(stream, buffered, filter, sink).await;
    }

    let io = TokioIo::new(Rewind::new(buffered, stream));

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(
            io,
            service_fn(move |req| {
                let filter = filter.clone();
                let sink = sink.clone();
                async move { handle_forward(req, filter, sink).await }
            }),
        )
        .await?;

    Ok(())
}

/// CONNECT tunneling on the raw client socket. The upstream is dialed
/// before the success reply so dial failures can still surface as 502, and
/// the success line is written byte-exact before any relay traffic.
async fn handle_connect(
    mut stream: TcpStream,
    mut head: Vec<u8>,
    filter: Arc<HostFilter>,
    sink: ViolationSink,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let head_end = loop {
        if let Some(pos) = find_header_end(&head) {
            break pos;
        }
        if head.len() > MAX_REQUEST_HEAD {
            return Err("CONNECT request head too large".into());
        }

        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err("connection closed mid request head".into());
        }
        head.extend_from_slice(&chunk[..n]);
    };

    let request_line = String::from_utf8_lossy(
        head[..head_end]
            .split(|b| *b == b'\r')
            .next()
            .unwrap_or_default(),
    )
    .to_string();
    let target = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();
    let (host, port) = parse_connect_target(&target);

    tracing::debug!("CONNECT {}:{}", host, port);

    if filter.check(&host, port) == FilterDecision::Deny {
        tracing::debug!("denied CONNECT to {}:{}", host, port);
        sink.network_denied(&host, port, format!("CONNECT {host}:{port}"));
        write_plain_response(
            &mut stream,
            "403 Forbidden",
            &format!("CONNECT to {host}:{port} denied by sandbox policy\n"),
        )
        .await?;
        return Ok(());
    }

    let mut upstream = match relay::dial(&host, port).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("CONNECT dial to {}:{} failed: {}", host, port, e);
            write_plain_response(
                &mut stream,
                "502 Bad Gateway",
                &format!("upstream connect to {host}:{port} failed\n"),
            )
            .await?;
            return Ok(());
        }
    };

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    // An eager client may have pipelined bytes behind the request head.
    if head.len() > head_end {
        upstream.write_all(&head[head_end..]).await?;
    }

    if let Err(e) = relay::relay_bidirectional(stream, upstream).await {
        tracing::debug!("tunnel to {}:{} closed: {}", host, port, e);
    }

    Ok(())
}

/// Offset just past the `\r\n\r\n` header terminator, if present.
fn find_header_end(head: &[u8]) -> Option<usize> {
    head.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Split `host:port` (or `[v6]:port`) from a CONNECT target.
fn parse_connect_target(target: &str) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(443);
            return (host.to_string(), port);
        }
    }

    match target.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(443)),
        None => (target.to_string(), 443),
    }
}

async fn write_plain_response(
    stream: &mut TcpStream,
    status_line: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}

/// Plain HTTP forwarding of absolute-URI requests.
async fn handle_forward(
    mut req: Request<hyper::body::Incoming>,
    filter: Arc<HostFilter>,
    sink: ViolationSink,
) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let host = req
        .uri()
        .host()
        .map(|h| h.to_string())
        .or_else(|| {
            req.headers()
                .get(hyper::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(|h| h.split(':').next().unwrap_or(h).to_string())
        })
        .unwrap_or_default();
    let port = req.uri().port_u16().unwrap_or(80);

    tracing::debug!("HTTP {} {}:{}", req.method(), host, port);

    if filter.check(&host, port) == FilterDecision::Deny {
        tracing::debug!("denied HTTP to {}:{}", host, port);
        sink.network_denied(&host, port, format!("{} {host}:{port}", req.method()));
        return Ok(status_body(
            StatusCode::FORBIDDEN,
            &format!("access to {host}:{port} denied by sandbox policy\n"),
        ));
    }

    strip_proxy_headers(req.headers_mut());

    // Reconstruct the request line in origin form for the upstream server.
    let origin_uri: Uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .unwrap_or_else(|_| Uri::from_static("/"));
    *req.uri_mut() = origin_uri;

    let stream = match relay::dial(&host, port).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("dial to {}:{} failed: {}", host, port, e);
            return Ok(status_body(
                StatusCode::BAD_GATEWAY,
                &format!("upstream connect to {host}:{port} failed\n"),
            ));
        }
    };

    let io = TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!("handshake with {}:{} failed: {}", host, port, e);
            return Ok(status_body(StatusCode::BAD_GATEWAY, "upstream handshake failed\n"));
        }
    };

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("upstream connection error: {}", e);
        }
    });

    match sender.send_request(req).await {
        Ok(resp) => Ok(resp.map(|b| b.boxed())),
        Err(e) => {
            tracing::debug!("upstream request error: {}", e);
            Ok(status_body(StatusCode::BAD_GATEWAY, "upstream request failed\n"))
        }
    }
}

/// Hop-by-hop proxy headers must not reach the upstream.
fn strip_proxy_headers(headers: &mut hyper::HeaderMap) {
    let doomed: Vec<_> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("proxy-"))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

fn status_body(status: StatusCode, body: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(
        Full::new(Bytes::from(body.to_string()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

/// A stream that replays sniffed bytes before reading from the socket.
struct Rewind<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.offset += n;
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
