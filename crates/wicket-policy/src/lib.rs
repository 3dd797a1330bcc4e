use std::collections::HashSet;
use std::net::IpAddr;

/// Policy decisions consulted by the connection pipeline.
///
/// `check_client` gates the whole connection, `filter_host` gates individual
/// request targets, and the `anonymous_*` pair restricts which client
/// headers survive forwarding when anonymous mode is on.
pub trait AccessPolicy: Send + Sync {
    /// Returns false when the client address is refused service.
    fn check_client(&self, client: &IpAddr) -> bool;

    /// Returns true when requests for `host` must be refused.
    fn filter_host(&self, host: &str) -> bool;

    fn anonymous_enabled(&self) -> bool;

    /// Consulted only when anonymous mode is enabled. `name` is the
    /// lowercase header name.
    fn anonymous_allows(&self, name: &str) -> bool;
}

/// List-driven policy built from the runtime configuration.
///
/// Client patterns are either exact address strings or prefixes ending in
/// `.` / `:` (`"192.168."` covers the whole subnet). Domain patterns match
/// the host exactly or as a `.`-anchored suffix (`".example.com"` covers
/// every subdomain).
#[derive(Debug, Clone, Default)]
pub struct DefaultAccessPolicy {
    allowed_clients: Vec<String>,
    denied_clients: Vec<String>,
    filter_enabled: bool,
    filtered_domains: Vec<String>,
    anonymous_headers: Option<HashSet<String>>,
}

impl DefaultAccessPolicy {
    pub fn new(
        allowed_clients: Vec<String>,
        denied_clients: Vec<String>,
        filter_enabled: bool,
        filtered_domains: Vec<String>,
        anonymous_headers: Vec<String>,
    ) -> Self {
        let anonymous_headers = if anonymous_headers.is_empty() {
            None
        } else {
            Some(
                anonymous_headers
                    .into_iter()
                    .map(|name| name.to_ascii_lowercase())
                    .collect(),
            )
        };
        Self {
            allowed_clients,
            denied_clients,
            filter_enabled,
            filtered_domains,
            anonymous_headers,
        }
    }
}

impl AccessPolicy for DefaultAccessPolicy {
    fn check_client(&self, client: &IpAddr) -> bool {
        let address = client.to_string();
        if self
            .denied_clients
            .iter()
            .any(|pattern| client_matches(pattern, &address))
        {
            return false;
        }
        if self.allowed_clients.is_empty() {
            return true;
        }
        self.allowed_clients
            .iter()
            .any(|pattern| client_matches(pattern, &address))
    }

    fn filter_host(&self, host: &str) -> bool {
        if !self.filter_enabled {
            return false;
        }
        self.filtered_domains
            .iter()
            .any(|pattern| domain_matches(pattern, host))
    }

    fn anonymous_enabled(&self) -> bool {
        self.anonymous_headers.is_some()
    }

    fn anonymous_allows(&self, name: &str) -> bool {
        match &self.anonymous_headers {
            Some(allowed) => allowed.contains(name),
            None => true,
        }
    }
}

fn client_matches(pattern: &str, address: &str) -> bool {
    if pattern.ends_with('.') || pattern.ends_with(':') {
        return address.starts_with(pattern);
    }
    pattern == address
}

fn domain_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('.') {
        return host.eq_ignore_ascii_case(suffix)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", suffix.to_ascii_lowercase()));
    }
    pattern.eq_ignore_ascii_case(host)
}
