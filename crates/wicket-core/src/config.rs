use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Immutable runtime configuration. Validated once at startup and handed to
/// every worker as a shared snapshot; nothing in the connection path mutates
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Relay idle bound in seconds, measured from the last readiness wake.
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Optional parent proxy every request is forwarded through.
    pub upstream: Option<EndpointConfig>,
    /// Optional fixed TCP redirection; when set, every accepted connection
    /// is relayed to this endpoint without any HTTP processing.
    pub tunnel: Option<EndpointConfig>,
    /// Requests whose host equals this name are answered with the local
    /// statistics page instead of being proxied.
    pub stathost: Option<String>,
    /// Enables the `X-Tinyproxy` client-identity header on forwarded
    /// requests.
    pub my_domain: Option<String>,
    pub filter_enabled: bool,
    pub filtered_domains: Vec<String>,
    pub allowed_clients: Vec<String>,
    pub denied_clients: Vec<String>,
    /// A non-empty list switches on anonymous mode; only these headers are
    /// forwarded.
    pub anonymous_headers: Vec<String>,
    pub event_log_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 8888,
            idle_timeout_secs: 600,
            connect_timeout_secs: 10,
            upstream: None,
            tunnel: None,
            stathost: None,
            my_domain: None,
            filter_enabled: false,
            filtered_domains: Vec::new(),
            allowed_clients: Vec::new(),
            denied_clients: Vec::new(),
            anonymous_headers: Vec::new(),
            event_log_path: None,
        }
    }
}

impl ProxyConfig {
    pub fn upstream_configured(&self) -> bool {
        self.upstream.is_some()
    }

    pub fn tunnel_configured(&self) -> bool {
        self.tunnel.is_some()
    }

    pub fn validate(&self) -> Result<(), ProxyConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ProxyConfigError::EmptyListenAddr);
        }
        if self.idle_timeout_secs == 0 {
            return Err(ProxyConfigError::ZeroValue("idle_timeout_secs"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ProxyConfigError::ZeroValue("connect_timeout_secs"));
        }
        validate_endpoint(self.upstream.as_ref(), "upstream")?;
        validate_endpoint(self.tunnel.as_ref(), "tunnel")?;
        validate_optional_name(self.stathost.as_deref(), "stathost")?;
        validate_optional_name(self.my_domain.as_deref(), "my_domain")?;
        validate_list(&self.filtered_domains, "filtered_domains")?;
        validate_list(&self.allowed_clients, "allowed_clients")?;
        validate_list(&self.denied_clients, "denied_clients")?;
        validate_list(&self.anonymous_headers, "anonymous_headers")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyConfigError {
    #[error("listen_addr must not be empty")]
    EmptyListenAddr,
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("{field}.host must not be empty")]
    EmptyEndpointHost { field: &'static str },
    #[error("{field}.port must be greater than zero")]
    ZeroEndpointPort { field: &'static str },
    #[error("{field} must not be empty when set")]
    EmptyName { field: &'static str },
    #[error("{field} contains an empty entry")]
    EmptyListEntry { field: &'static str },
}

fn validate_endpoint(
    endpoint: Option<&EndpointConfig>,
    field: &'static str,
) -> Result<(), ProxyConfigError> {
    if let Some(endpoint) = endpoint {
        if endpoint.host.trim().is_empty() {
            return Err(ProxyConfigError::EmptyEndpointHost { field });
        }
        if endpoint.port == 0 {
            return Err(ProxyConfigError::ZeroEndpointPort { field });
        }
    }
    Ok(())
}

fn validate_optional_name(
    value: Option<&str>,
    field: &'static str,
) -> Result<(), ProxyConfigError> {
    match value {
        Some(text) if text.trim().is_empty() => Err(ProxyConfigError::EmptyName { field }),
        _ => Ok(()),
    }
}

fn validate_list(values: &[String], field: &'static str) -> Result<(), ProxyConfigError> {
    if values.iter().any(|value| value.trim().is_empty()) {
        return Err(ProxyConfigError::EmptyListEntry { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{EndpointConfig, ProxyConfig, ProxyConfigError};

    #[test]
    fn default_config_validates() {
        ProxyConfig::default().validate().expect("default is valid");
    }

    #[test]
    fn rejects_zero_idle_timeout() {
        let config = ProxyConfig {
            idle_timeout_secs: 0,
            ..ProxyConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ProxyConfigError::ZeroValue("idle_timeout_secs"))
        );
    }

    #[test]
    fn rejects_upstream_with_empty_host() {
        let config = ProxyConfig {
            upstream: Some(EndpointConfig {
                host: " ".to_string(),
                port: 3128,
            }),
            ..ProxyConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ProxyConfigError::EmptyEndpointHost { field: "upstream" })
        );
    }

    #[test]
    fn rejects_tunnel_with_zero_port() {
        let config = ProxyConfig {
            tunnel: Some(EndpointConfig {
                host: "news.example.com".to_string(),
                port: 0,
            }),
            ..ProxyConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ProxyConfigError::ZeroEndpointPort { field: "tunnel" })
        );
    }

    #[test]
    fn rejects_empty_filter_entry() {
        let config = ProxyConfig {
            filtered_domains: vec!["ads.example.com".to_string(), "".to_string()],
            ..ProxyConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ProxyConfigError::EmptyListEntry {
                field: "filtered_domains"
            })
        );
    }

    #[test]
    fn json_round_trip_preserves_endpoints() {
        let config = ProxyConfig {
            upstream: Some(EndpointConfig {
                host: "parent.example.com".to_string(),
                port: 3128,
            }),
            stathost: Some("proxy.stats".to_string()),
            ..ProxyConfig::default()
        };
        let text = serde_json::to_string(&config).expect("serialize");
        let parsed: ProxyConfig = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(parsed, config);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = serde_json::from_str::<ProxyConfig>(r#"{"listen_prot": 1}"#)
            .expect_err("unknown field must fail");
        assert!(error.to_string().contains("listen_prot"));
    }
}
