use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use wicket_core::{parse_request_line, protocol_version, ParsedRequest, ProxyEngine};
use wicket_http::HttpVersion;
use wicket_observe::{Event, EventSink, EventType, FlowContext, StatKind};
use wicket_policy::AccessPolicy;

mod headers;
mod line_reader;
mod relay;
mod upstream;

use line_reader::LineReader;
use relay::RelayOutcome;

/// Capacity of each relay direction buffer.
pub(crate) const MAX_BUFFER_SIZE: usize = 48 * 1024;
/// Upper bound on any single protocol line.
pub(crate) const MAX_LINE_BYTES: usize = MAX_BUFFER_SIZE / 6;

pub struct ProxyServer<P, S>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    engine: Arc<ProxyEngine<P, S>>,
}

impl<P, S> ProxyServer<P, S>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    pub fn new(engine: ProxyEngine<P, S>) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine_handle(&self) -> Arc<ProxyEngine<P, S>> {
        Arc::clone(&self.engine)
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        let bind_addr = format!(
            "{}:{}",
            self.engine.config.listen_addr, self.engine.config.listen_port
        );
        TcpListener::bind(&bind_addr).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                if let Err(error) = handle_connection(engine, stream, client_addr).await {
                    eprintln!("connection handling failed: {error}");
                }
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReasonCode {
    AclRefused,
    TunnelConnectFailed,
    RequestReadFailed,
    HeaderProcessingFailed,
    LocalResponseDelivered,
    ServerHeadersFailed,
    ConnectResponseFailed,
    RelayEof,
    RelayError,
    IdleTimeout,
}

impl CloseReasonCode {
    fn as_str(self) -> &'static str {
        match self {
            Self::AclRefused => "acl_refused",
            Self::TunnelConnectFailed => "tunnel_connect_failed",
            Self::RequestReadFailed => "request_read_failed",
            Self::HeaderProcessingFailed => "header_processing_failed",
            Self::LocalResponseDelivered => "local_response_delivered",
            Self::ServerHeadersFailed => "server_headers_failed",
            Self::ConnectResponseFailed => "connect_response_failed",
            Self::RelayEof => "relay_eof",
            Self::RelayError => "relay_error",
            Self::IdleTimeout => "idle_timeout",
        }
    }
}

/// Per-connection state. Created on accept, torn down when the worker
/// returns; sockets close on drop along every exit path.
pub(crate) struct Connection {
    pub(crate) client: LineReader<TcpStream>,
    pub(crate) server: Option<LineReader<TcpStream>>,
    pub(crate) client_addr: SocketAddr,
    pub(crate) request_line: Option<String>,
    pub(crate) version: HttpVersion,
    pub(crate) connect_method: bool,
    /// Latched once any locally generated status line has been written to
    /// the client. Every later stage checks it before writing.
    pub(crate) response_message_sent: bool,
}

impl Connection {
    fn new(stream: TcpStream, client_addr: SocketAddr) -> Self {
        Self {
            client: LineReader::new(stream),
            server: None,
            client_addr,
            request_line: None,
            version: HttpVersion::default(),
            connect_method: false,
            response_message_sent: false,
        }
    }

    pub(crate) fn client_stream(&mut self) -> &mut TcpStream {
        self.client.stream_mut()
    }

    pub(crate) fn server_stream(&mut self) -> io::Result<&mut TcpStream> {
        self.server
            .as_mut()
            .map(|reader| reader.stream_mut())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no upstream connection"))
    }
}

async fn handle_connection<P, S>(
    engine: Arc<ProxyEngine<P, S>>,
    stream: TcpStream,
    client_addr: SocketAddr,
) -> io::Result<()>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    engine.record_stat(StatKind::OpenedConnections);
    let flow_id = engine.allocate_flow_id();
    tracing::debug!(flow_id, client = %client_addr, "accepted connection");
    engine.emit_event(Event::new(
        EventType::ConnectionAccepted,
        FlowContext::unresolved(flow_id, client_addr.to_string()),
    ));

    let conn = Connection::new(stream, client_addr);
    let result = run_pipeline(&engine, flow_id, conn).await;
    engine.record_stat(StatKind::ClosedConnections);
    result
}

async fn run_pipeline<P, S>(
    engine: &Arc<ProxyEngine<P, S>>,
    flow_id: u64,
    mut conn: Connection,
) -> io::Result<()>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    let mut target: Option<(String, u16)> = None;

    if !engine.policy().check_client(&conn.client_addr.ip()) {
        engine.record_stat(StatKind::RefusedAcl);
        tracing::warn!(client = %conn.client_addr, "refused by access control");
        emit_rejected(engine, flow_id, &conn, "acl_refused");
        send_error_response(
            &mut conn,
            403,
            "You do not have authorization for using this service.",
        )
        .await?;
    } else {
        if let Some(tunnel) = engine.config.tunnel.clone() {
            match upstream::connect_to_tunnel(engine, &mut conn, &tunnel).await {
                Ok(()) => {
                    let context = FlowContext {
                        flow_id,
                        client_addr: conn.client_addr.to_string(),
                        server_host: tunnel.host.clone(),
                        server_port: tunnel.port,
                    };
                    engine.emit_event(Event::new(EventType::TunnelEstablished, context.clone()));
                    return relay_and_close(engine, context, conn).await;
                }
                Err(_) => {
                    // A 404 is latched; keep going so the queued request
                    // bytes are drained before the connection closes.
                    emit_rejected(engine, flow_id, &conn, CloseReasonCode::TunnelConnectFailed.as_str());
                }
            }
        }

        if read_request_line(&mut conn).await.is_err() {
            engine.record_stat(StatKind::BadConnections);
            emit_closed(
                engine,
                FlowContext::unresolved(flow_id, conn.client_addr.to_string()),
                CloseReasonCode::RequestReadFailed,
                None,
                None,
            );
            return Ok(());
        }

        if let Some(mut request) = process_request(engine, flow_id, &mut conn).await? {
            engine.record_stat(StatKind::Requests);
            let connected = if engine.config.upstream_configured() {
                upstream::connect_to_upstream(engine, flow_id, &mut conn, &mut request).await
            } else {
                upstream::connect_direct(engine, flow_id, &mut conn, &request).await
            };
            if connected.is_ok() {
                target = Some((request.host.clone(), request.port));
            }
        }
    }

    // The drain-or-forward join point: with an upstream attached the client
    // headers are rewritten onto it, otherwise they are consumed so the
    // socket is clear before teardown.
    if headers::process_client_headers(engine, &mut conn).await.is_err() {
        engine.record_stat(StatKind::BadConnections);
        if !conn.response_message_sent {
            emit_closed(
                engine,
                flow_context(flow_id, &conn, &target),
                CloseReasonCode::HeaderProcessingFailed,
                None,
                None,
            );
            return Ok(());
        }
    }

    if conn.response_message_sent {
        emit_closed(
            engine,
            flow_context(flow_id, &conn, &target),
            CloseReasonCode::LocalResponseDelivered,
            None,
            None,
        );
        return Ok(());
    }

    if !conn.connect_method || engine.config.upstream_configured() {
        if let Err(error) = headers::process_server_headers(&mut conn).await {
            engine.record_stat(StatKind::BadConnections);
            emit_closed(
                engine,
                flow_context(flow_id, &conn, &target),
                CloseReasonCode::ServerHeadersFailed,
                Some(error.to_string()),
                None,
            );
            return Ok(());
        }
    } else if let Err(error) = send_connect_established(&mut conn).await {
        engine.record_stat(StatKind::BadConnections);
        tracing::warn!(flow_id, "could not send CONNECT greeting to client");
        emit_closed(
            engine,
            flow_context(flow_id, &conn, &target),
            CloseReasonCode::ConnectResponseFailed,
            Some(error.to_string()),
            None,
        );
        return Ok(());
    }

    let context = flow_context(flow_id, &conn, &target);
    relay_and_close(engine, context, conn).await
}

async fn relay_and_close<P, S>(
    engine: &Arc<ProxyEngine<P, S>>,
    context: FlowContext,
    conn: Connection,
) -> io::Result<()>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    let Connection { client, server, .. } = conn;
    let Some(server) = server else {
        return Ok(());
    };
    let (client_stream, client_pending) = client.into_parts();
    let (server_stream, server_pending) = server.into_parts();
    let idle_timeout = Duration::from_secs(engine.config.idle_timeout_secs);

    let (outcome, totals) = relay::relay_connection(
        client_stream,
        server_stream,
        client_pending,
        server_pending,
        idle_timeout,
    )
    .await;

    let reason = match &outcome {
        RelayOutcome::Eof => CloseReasonCode::RelayEof,
        RelayOutcome::IdleTimeout => {
            tracing::debug!(
                flow_id = context.flow_id,
                idle_secs = engine.config.idle_timeout_secs,
                "relay idle timeout"
            );
            CloseReasonCode::IdleTimeout
        }
        RelayOutcome::TransportError(_) => CloseReasonCode::RelayError,
    };
    emit_closed(
        engine,
        context,
        reason,
        outcome.reason_detail(),
        Some((totals.from_client, totals.from_server)),
    );
    Ok(())
}

/// Reads the request line, skipping any leading blank lines.
async fn read_request_line(conn: &mut Connection) -> io::Result<()> {
    loop {
        let raw = conn.client.read_line().await?;
        let stripped = line_reader::strip_line_terminator(&raw);
        if stripped.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(stripped).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "request line was not valid UTF-8")
        })?;
        tracing::debug!(request = text, "request line");
        conn.request_line = Some(text.to_string());
        return Ok(());
    }
}

/// Classifies the request line, applies the domain filter and the stathost
/// shortcut, and captures the client protocol version. `None` means a local
/// response was latched and the pipeline should fall through to the drain.
async fn process_request<P, S>(
    engine: &Arc<ProxyEngine<P, S>>,
    flow_id: u64,
    conn: &mut Connection,
) -> io::Result<Option<ParsedRequest>>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    let line = match conn.request_line.clone() {
        Some(line) => line,
        None => return Ok(None),
    };

    let request = match parse_request_line(&line) {
        Ok(request) => request,
        Err(error) => {
            tracing::debug!(request = line.as_str(), code = error.code(), "bad request");
            engine.record_stat(StatKind::BadConnections);
            emit_rejected(engine, flow_id, conn, error.code());
            send_error_response(conn, 400, error.detail()).await?;
            return Ok(None);
        }
    };

    if request.is_connect {
        conn.connect_method = true;
    }

    if engine.policy().filter_host(&request.host) {
        engine.record_stat(StatKind::DeniedFiltered);
        tracing::warn!(host = request.host.as_str(), "refused filtered domain");
        emit_rejected(engine, flow_id, conn, "filtered_domain");
        send_error_response(conn, 404, "Connection to filtered domain is not allowed.").await?;
        return Ok(None);
    }

    if let Some(stathost) = engine.config.stathost.as_deref() {
        if stathost.eq_ignore_ascii_case(&request.host) {
            serve_stats_page(engine, flow_id, conn).await?;
            return Ok(None);
        }
    }

    if let Some(version) = protocol_version(&request.protocol) {
        conn.version = version;
    }

    let context = FlowContext {
        flow_id,
        client_addr: conn.client_addr.to_string(),
        server_host: request.host.clone(),
        server_port: request.port,
    };
    engine.emit_event(
        Event::new(EventType::RequestReceived, context)
            .with_attribute("method", request.method.clone())
            .with_attribute("connect", request.is_connect.to_string()),
    );

    Ok(Some(request))
}

async fn serve_stats_page<P, S>(
    engine: &Arc<ProxyEngine<P, S>>,
    flow_id: u64,
    conn: &mut Connection,
) -> io::Result<()>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    tracing::debug!(flow_id, "serving the stathost page");
    engine.emit_event(Event::new(
        EventType::StatsServed,
        FlowContext::unresolved(flow_id, conn.client_addr.to_string()),
    ));
    if conn.response_message_sent {
        return Ok(());
    }
    conn.response_message_sent = true;
    let page = wicket_observe::stats_response(&engine.stats_snapshot());
    conn.client_stream().write_all(page.as_bytes()).await
}

/// Writes a well-formed HTTP error page and latches the connection so no
/// later stage can emit a second status line.
pub(crate) async fn send_error_response(
    conn: &mut Connection,
    code: u16,
    detail: &str,
) -> io::Result<()> {
    if conn.response_message_sent {
        return Ok(());
    }
    conn.response_message_sent = true;
    let response = wicket_http::format_error_response(code, detail);
    conn.client_stream().write_all(response.as_bytes()).await
}

/// The synthesized response for a direct CONNECT, sent once the client's
/// header section has been consumed.
async fn send_connect_established(conn: &mut Connection) -> io::Result<()> {
    let response = format!(
        "HTTP/1.0 200 Connection established\r\nProxy-agent: {}\r\n\r\n",
        wicket_http::proxy_agent()
    );
    conn.client_stream().write_all(response.as_bytes()).await
}

fn flow_context(flow_id: u64, conn: &Connection, target: &Option<(String, u16)>) -> FlowContext {
    match target {
        Some((host, port)) => FlowContext {
            flow_id,
            client_addr: conn.client_addr.to_string(),
            server_host: host.clone(),
            server_port: *port,
        },
        None => FlowContext::unresolved(flow_id, conn.client_addr.to_string()),
    }
}

fn emit_rejected<P, S>(engine: &ProxyEngine<P, S>, flow_id: u64, conn: &Connection, code: &str)
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    engine.emit_event(
        Event::new(
            EventType::RequestRejected,
            FlowContext::unresolved(flow_id, conn.client_addr.to_string()),
        )
        .with_attribute("code", code),
    );
}

fn emit_closed<P, S>(
    engine: &ProxyEngine<P, S>,
    context: FlowContext,
    reason: CloseReasonCode,
    detail: Option<String>,
    transferred: Option<(u64, u64)>,
) where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    let mut event = Event::new(EventType::StreamClosed, context)
        .with_attribute("reason_code", reason.as_str());
    if let Some(detail) = detail {
        event = event.with_attribute("reason_detail", detail);
    }
    if let Some((from_client, from_server)) = transferred {
        event = event
            .with_attribute("bytes_from_client", from_client.to_string())
            .with_attribute("bytes_from_server", from_server.to_string());
    }
    engine.emit_event(event);
}
