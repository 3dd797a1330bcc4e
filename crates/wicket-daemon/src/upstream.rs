use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use wicket_core::{EndpointConfig, ParsedRequest, ProxyEngine};
use wicket_observe::{Event, EventSink, EventType, FlowContext};
use wicket_policy::AccessPolicy;

use crate::line_reader::LineReader;
use crate::{send_error_response, Connection, MAX_LINE_BYTES};

/// How long to wait for the tunnel-mode log peek before giving up on it.
const TUNNEL_PEEK_TIMEOUT: Duration = Duration::from_millis(200);

/// Opens a TCP connection to `host:port`, resolving the name and trying
/// each returned address until one connects or the deadline passes.
pub(crate) async fn connect_upstream_socket(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> io::Result<TcpStream> {
    let deadline = tokio::time::Instant::now() + connect_timeout;
    let addrs = resolve_socket_addrs(host, port, deadline).await?;

    let mut last_error: Option<io::Error> = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream connect timed out",
            ));
        }
        match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(error)) => last_error = Some(error),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream connect timed out",
                ))
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "all upstream connect attempts failed",
        )
    }))
}

async fn resolve_socket_addrs(
    host: &str,
    port: u16,
    deadline: tokio::time::Instant,
) -> io::Result<Vec<SocketAddr>> {
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    if remaining.is_zero() {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "upstream address resolution timed out",
        ));
    }

    let resolved = tokio::time::timeout(remaining, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream address resolution timed out",
            )
        })?
        .map_err(|error| {
            io::Error::new(
                error.kind(),
                format!("upstream address resolution failed: {error}"),
            )
        })?;

    let addrs: Vec<SocketAddr> = resolved.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "upstream address resolution returned no socket addresses",
        ));
    }
    Ok(addrs)
}

/// Writes the rewritten request head: the request line pinned to HTTP/1.0,
/// a regenerated `Host`, and `Connection: close` since persistent
/// connections are not supported.
pub(crate) async fn establish_http_connection(
    conn: &mut Connection,
    request: &ParsedRequest,
) -> io::Result<()> {
    let head = format!(
        "{} {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n",
        request.method, request.path, request.host
    );
    conn.server_stream()?.write_all(head.as_bytes()).await
}

/// Direct mode: connect straight to the origin. For CONNECT nothing is
/// written to the server; the client gets its 200 only after its header
/// section has been consumed.
pub(crate) async fn connect_direct<P, S>(
    engine: &Arc<ProxyEngine<P, S>>,
    flow_id: u64,
    conn: &mut Connection,
    request: &ParsedRequest,
) -> io::Result<()>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    let connect_timeout = Duration::from_secs(engine.config.connect_timeout_secs);
    let context = FlowContext {
        flow_id,
        client_addr: conn.client_addr.to_string(),
        server_host: request.host.clone(),
        server_port: request.port,
    };

    match connect_upstream_socket(&request.host, request.port, connect_timeout).await {
        Ok(stream) => {
            tracing::debug!(
                host = request.host.as_str(),
                port = request.port,
                "established connection to origin"
            );
            engine.emit_event(Event::new(EventType::UpstreamConnected, context));
            conn.server = Some(LineReader::new(stream));
            if !conn.connect_method {
                establish_http_connection(conn, request).await?;
            }
            Ok(())
        }
        Err(error) => {
            tracing::warn!(
                host = request.host.as_str(),
                port = request.port,
                error = %error,
                "could not connect to origin"
            );
            engine.emit_event(
                Event::new(EventType::UpstreamConnectFailed, context)
                    .with_attribute("detail", error.to_string()),
            );
            send_error_response(conn, 500, "Unable to connect to remote server.").await?;
            Err(error)
        }
    }
}

/// Upstream-proxy mode: connect to the parent proxy and rewrite the request
/// target into the form the parent expects, `HOST:PORT` for CONNECT and
/// `http://HOST:PORT/PATH` otherwise.
pub(crate) async fn connect_to_upstream<P, S>(
    engine: &Arc<ProxyEngine<P, S>>,
    flow_id: u64,
    conn: &mut Connection,
    request: &mut ParsedRequest,
) -> io::Result<()>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    let upstream = match engine.config.upstream.clone() {
        Some(upstream) => upstream,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no upstream proxy configured",
            ))
        }
    };
    let connect_timeout = Duration::from_secs(engine.config.connect_timeout_secs);
    let context = FlowContext {
        flow_id,
        client_addr: conn.client_addr.to_string(),
        server_host: upstream.host.clone(),
        server_port: upstream.port,
    };

    let stream = match connect_upstream_socket(&upstream.host, upstream.port, connect_timeout).await
    {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(
                host = upstream.host.as_str(),
                port = upstream.port,
                error = %error,
                "could not connect to upstream proxy"
            );
            engine.emit_event(
                Event::new(EventType::UpstreamConnectFailed, context)
                    .with_attribute("detail", error.to_string()),
            );
            send_error_response(conn, 404, "Unable to connect to upstream proxy.").await?;
            return Err(error);
        }
    };

    tracing::debug!(
        host = upstream.host.as_str(),
        port = upstream.port,
        "established connection to upstream proxy"
    );
    engine.emit_event(Event::new(EventType::UpstreamConnected, context));
    conn.server = Some(LineReader::new(stream));

    request.path = if conn.connect_method {
        format!("{}:{}", request.host, request.port)
    } else {
        format!("http://{}:{}{}", request.host, request.port, request.path)
    };
    establish_http_connection(conn, request).await
}

/// Tunnel mode: every accepted connection is redirected to the configured
/// endpoint and relayed opaquely from the first byte. The first request
/// line is peeked for the log but never consumed.
pub(crate) async fn connect_to_tunnel<P, S>(
    engine: &Arc<ProxyEngine<P, S>>,
    conn: &mut Connection,
    endpoint: &EndpointConfig,
) -> io::Result<()>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    let mut peeked = [0_u8; MAX_LINE_BYTES];
    if let Ok(Ok(length)) =
        tokio::time::timeout(TUNNEL_PEEK_TIMEOUT, conn.client_stream().peek(&mut peeked)).await
    {
        let line_end = peeked[..length]
            .iter()
            .position(|&byte| byte == b'\n')
            .unwrap_or(length);
        let first_line = String::from_utf8_lossy(&peeked[..line_end]);
        tracing::debug!(request = %first_line.trim_end(), "tunnel request");
    }

    tracing::debug!(
        host = endpoint.host.as_str(),
        port = endpoint.port,
        "redirecting connection to tunnel"
    );

    let connect_timeout = Duration::from_secs(engine.config.connect_timeout_secs);
    match connect_upstream_socket(&endpoint.host, endpoint.port, connect_timeout).await {
        Ok(stream) => {
            conn.server = Some(LineReader::new(stream));
            Ok(())
        }
        Err(error) => {
            tracing::warn!(
                host = endpoint.host.as_str(),
                port = endpoint.port,
                error = %error,
                "could not connect to tunnel"
            );
            send_error_response(conn, 404, "Unable to connect to tunnel.").await?;
            Err(error)
        }
    }
}
