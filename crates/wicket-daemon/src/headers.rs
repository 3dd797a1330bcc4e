use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWriteExt};

use wicket_core::ProxyEngine;
use wicket_http::HeaderMap;
use wicket_observe::EventSink;
use wicket_policy::AccessPolicy;

use crate::line_reader::{strip_line_terminator, LineReader};
use crate::{Connection, MAX_BUFFER_SIZE};

/// Reads header lines until the blank line that ends the section. A line
/// without a `:` fails the whole collection; the caller closes the
/// connection without any further client-visible error.
pub(crate) async fn collect_headers<S>(reader: &mut LineReader<S>) -> io::Result<HeaderMap>
where
    S: AsyncRead + Unpin,
{
    let mut headers = HeaderMap::new();
    loop {
        let raw = reader.read_line().await?;
        let stripped = strip_line_terminator(&raw);
        if stripped.is_empty() {
            return Ok(headers);
        }

        let text = std::str::from_utf8(stripped).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "header line was not valid UTF-8")
        })?;
        let colon = text.find(':').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed header line")
        })?;
        let name = &text[..colon];
        let value = text[colon..].trim_start_matches(&[':', ' ', '\t'][..]);
        headers.insert(name, value);
    }
}

/// Applies the proxy's rewrite rules to the client's header section and
/// writes the result to the upstream, then streams any declared request
/// body across.
///
/// When no upstream socket exists, or the request is a CONNECT going
/// straight to the origin, the headers are consumed and discarded so the
/// client socket is clear for whatever comes next.
pub(crate) async fn process_client_headers<P, S>(
    engine: &Arc<ProxyEngine<P, S>>,
    conn: &mut Connection,
) -> io::Result<()>
where
    P: AccessPolicy + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    let mut headers = collect_headers(&mut conn.client).await?;

    if conn.server.is_none() || (conn.connect_method && !engine.config.upstream_configured()) {
        tracing::debug!("not forwarding client headers to the remote machine");
        return Ok(());
    }

    // Headers nominated by the Connection header are hop-scoped; drop them
    // together with the Connection header itself.
    if let Some(value) = headers.remove("connection") {
        for token in wicket_http::connection_header_tokens(&value) {
            headers.remove(&token);
        }
    }

    // Capture the declared body length before emission. The header itself
    // stays in the map and is forwarded.
    let content_length = headers
        .get("content-length")
        .and_then(|value| value.trim().parse::<i64>().ok());

    let via_line = wicket_http::format_via_line(
        headers.remove("via").as_deref(),
        conn.version,
        &local_hostname(),
    );

    for name in wicket_http::HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }

    let anonymous = engine.policy().anonymous_enabled();
    let mut head = via_line;
    for (name, value) in headers.iter() {
        if anonymous && !engine.policy().anonymous_allows(&name.to_ascii_lowercase()) {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if engine.config.my_domain.is_some() {
        head.push_str(&format!("X-Tinyproxy: {}\r\n", conn.client_addr.ip()));
    }
    head.push_str("\r\n");
    conn.server_stream()?.write_all(head.as_bytes()).await?;

    match content_length {
        Some(length) if length >= 0 => pull_client_data(conn, length as u64).await,
        _ => Ok(()),
    }
}

/// Streams `remaining` request-body bytes from the client. The bytes are
/// only forwarded while no local response has pre-empted the exchange;
/// draining continues either way so an error page can still be delivered
/// over a clean socket.
pub(crate) async fn pull_client_data(conn: &mut Connection, mut remaining: u64) -> io::Result<()> {
    while remaining > 0 {
        let want = remaining.min(MAX_BUFFER_SIZE as u64) as usize;
        let chunk = conn.client.read_chunk(want).await?;
        if chunk.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before request body completed",
            ));
        }
        if !conn.response_message_sent {
            conn.server_stream()?.write_all(&chunk).await?;
        }
        remaining -= chunk.len() as u64;
    }
    Ok(())
}

/// Copies the server's response head verbatim to the client, terminator
/// bytes included, up to and including the blank line.
pub(crate) async fn process_server_headers(conn: &mut Connection) -> io::Result<()> {
    loop {
        let line = match conn.server.as_mut() {
            Some(reader) => reader.read_line().await?,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no upstream connection",
                ))
            }
        };
        conn.client_stream().write_all(&line).await?;
        if strip_line_terminator(&line).is_empty() {
            return Ok(());
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
