use wicket_http::HttpVersion;

/// A request target pulled apart from the request line. Dropped once the
/// upstream connection is established and the rewritten head is on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    /// Protocol token as received, with a leading `http` normalised to
    /// uppercase. Empty when the client sent a bare two-token request line.
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub is_connect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestParseError {
    TooFewTokens,
    InvalidHttpUrl,
    InvalidConnectTarget,
    UnknownUrlType,
}

impl RequestParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::TooFewTokens => "too_few_tokens",
            Self::InvalidHttpUrl => "invalid_http_url",
            Self::InvalidConnectTarget => "invalid_connect_target",
            Self::UnknownUrlType => "unknown_url_type",
        }
    }

    /// Text placed in the 400 error page sent back to the client.
    pub fn detail(self) -> &'static str {
        match self {
            Self::TooFewTokens => "Bad Request. No request found.",
            Self::InvalidHttpUrl | Self::InvalidConnectTarget => {
                "Bad Request. Could not parse URL."
            }
            Self::UnknownUrlType => "Bad Request. Unknown URL type.",
        }
    }
}

/// Splits `METHOD SP URL SP VERSION` and classifies the URL.
///
/// Tokens beyond the third are ignored. Absolute `http://` targets go
/// through the HTTP URL extractor; anything else is only accepted as the
/// authority form of a `CONNECT` request.
pub fn parse_request_line(line: &str) -> Result<ParsedRequest, RequestParseError> {
    let mut tokens = line.split_whitespace();
    let method = tokens.next().ok_or(RequestParseError::TooFewTokens)?;
    let url = tokens.next().ok_or(RequestParseError::TooFewTokens)?;
    let protocol = tokens.next().unwrap_or("");

    let protocol = normalize_protocol(protocol);

    if url.len() >= 7 && url.as_bytes()[..7].eq_ignore_ascii_case(b"http://") {
        let mut url = url.to_string();
        url[..4].make_ascii_lowercase();
        let (host, port, path) = extract_http_url(&url)?;
        return Ok(ParsedRequest {
            method: method.to_string(),
            protocol,
            host,
            port,
            path,
            is_connect: false,
        });
    }

    if method == "CONNECT" {
        let (host, port) = extract_connect_target(url)?;
        return Ok(ParsedRequest {
            method: method.to_string(),
            protocol,
            host,
            port,
            path: String::new(),
            is_connect: true,
        });
    }

    Err(RequestParseError::UnknownUrlType)
}

/// Parses `HTTP/<major>.<minor>` out of a normalised protocol token.
/// Returns `None` when the token does not carry a usable version, in which
/// case the connection keeps its default of 1.0.
pub fn protocol_version(protocol: &str) -> Option<HttpVersion> {
    let version_text = protocol.strip_prefix("HTTP/")?;
    let (major_text, minor_text) = version_text.split_once('.')?;
    let major = major_text.parse::<u16>().ok()?;
    let minor = leading_number(minor_text)?;
    Some(HttpVersion { major, minor })
}

fn normalize_protocol(protocol: &str) -> String {
    let mut protocol = protocol.to_string();
    if protocol.len() >= 4 && protocol.as_bytes()[..4].eq_ignore_ascii_case(b"http") {
        protocol[..4].make_ascii_uppercase();
    }
    protocol
}

/// `http://HOST[:PORT][/PATH]`. The host may not contain `:` or `/`; the
/// port defaults to 80 and the path to `/`.
fn extract_http_url(url: &str) -> Result<(String, u16, String), RequestParseError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or(RequestParseError::InvalidHttpUrl)?;

    let (authority, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], rest[slash..].to_string()),
        None => (rest, "/".to_string()),
    };

    let (host, port) = match authority.split_once(':') {
        Some((host, port_text)) => {
            let port = port_text
                .parse::<u16>()
                .map_err(|_| RequestParseError::InvalidHttpUrl)?;
            (host, port)
        }
        None => (authority, 80),
    };

    if host.is_empty() {
        return Err(RequestParseError::InvalidHttpUrl);
    }

    Ok((host.to_string(), port, path))
}

/// `HOST[:PORT]` from a CONNECT request target; the port defaults to 443.
fn extract_connect_target(url: &str) -> Result<(String, u16), RequestParseError> {
    let (host, port) = match url.split_once(':') {
        Some((host, port_text)) => {
            let port = port_text
                .parse::<u16>()
                .map_err(|_| RequestParseError::InvalidConnectTarget)?;
            (host, port)
        }
        None => (url, 443),
    };

    if host.is_empty() {
        return Err(RequestParseError::InvalidConnectTarget);
    }

    Ok((host.to_string(), port))
}

fn leading_number(text: &str) -> Option<u16> {
    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<u16>().ok()
}
