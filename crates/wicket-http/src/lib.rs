mod header_map;

pub use header_map::HeaderMap;

/// Product token used in `Via`, `Proxy-agent`, and `Server` headers.
pub const PACKAGE: &str = "wicket";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Headers that never cross the proxy, per RFC 2616 §13.5.1 plus `Host`,
/// which the proxy regenerates itself.
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// HTTP separator characters used when tokenising a `Connection` header
/// value into the header names it nominates for removal.
const CONNECTION_TOKEN_SEPARATORS: &[char] = &[
    '(', ')', '<', '>', '@', ',', ';', ':', '\\', '"', '/', '[', ']', '?', '=', '{', '}', ' ',
    '\t',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpVersion {
    pub major: u16,
    pub minor: u16,
}

impl Default for HttpVersion {
    fn default() -> Self {
        Self { major: 1, minor: 0 }
    }
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub fn proxy_agent() -> String {
    format!("{PACKAGE}/{VERSION}")
}

/// Splits a `Connection` header value into the non-empty tokens it carries.
/// Every token names a header the proxy must drop before forwarding.
pub fn connection_header_tokens(value: &str) -> Vec<String> {
    value
        .split(CONNECTION_TOKEN_SEPARATORS)
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
        .collect()
}

/// Formats the outbound `Via` line, extending the client's own `Via` value
/// when one was supplied.
pub fn format_via_line(existing: Option<&str>, version: HttpVersion, hostname: &str) -> String {
    match existing {
        Some(old) => format!(
            "Via: {old}, {version} {hostname} ({PACKAGE}/{VERSION})\r\n"
        ),
        None => format!("Via: {version} {hostname} ({PACKAGE}/{VERSION})\r\n"),
    }
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Proxy Error",
    }
}

/// Renders a complete HTTP/1.0 response carrying a small HTML page.
pub fn format_html_response(code: u16, title: &str, body_html: &str) -> String {
    format!(
        "HTTP/1.0 {code} {reason}\r\n\
         Server: {agent}\r\n\
         Content-Type: text/html\r\n\
         Connection: close\r\n\
         \r\n\
         <html><head><title>{title}</title></head>\r\n\
         <body>\r\n{body_html}\r\n<hr />\r\n\
         <p><em>Generated by {agent}</em></p>\r\n\
         </body></html>\r\n",
        reason = reason_phrase(code),
        agent = proxy_agent(),
    )
}

/// Renders the error page sent to the client when the proxy refuses or
/// fails a request.
pub fn format_error_response(code: u16, detail: &str) -> String {
    let reason = reason_phrase(code);
    format_html_response(
        code,
        &format!("{code} {reason}"),
        &format!("<h1>{code} {reason}</h1>\r\n<p>{detail}</p>"),
    )
}
