use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

mod event_log;

pub use event_log::{EventLogConfig, FileEventSink};

/// Counters kept by the proxy. Safe for concurrent increment; every worker
/// shares one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    OpenedConnections,
    ClosedConnections,
    Requests,
    BadConnections,
    DeniedFiltered,
    RefusedAcl,
}

impl StatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenedConnections => "opened_connections",
            Self::ClosedConnections => "closed_connections",
            Self::Requests => "requests",
            Self::BadConnections => "bad_connections",
            Self::DeniedFiltered => "denied_filtered",
            Self::RefusedAcl => "refused_acl",
        }
    }
}

#[derive(Debug, Default)]
pub struct StatsRegistry {
    opened_connections: AtomicU64,
    closed_connections: AtomicU64,
    requests: AtomicU64,
    bad_connections: AtomicU64,
    denied_filtered: AtomicU64,
    refused_acl: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub opened_connections: u64,
    pub closed_connections: u64,
    pub requests: u64,
    pub bad_connections: u64,
    pub denied_filtered: u64,
    pub refused_acl: u64,
}

impl StatsRegistry {
    pub fn record(&self, kind: StatKind) {
        let counter = match kind {
            StatKind::OpenedConnections => &self.opened_connections,
            StatKind::ClosedConnections => &self.closed_connections,
            StatKind::Requests => &self.requests,
            StatKind::BadConnections => &self.bad_connections,
            StatKind::DeniedFiltered => &self.denied_filtered,
            StatKind::RefusedAcl => &self.refused_acl,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            opened_connections: self.opened_connections.load(Ordering::Relaxed),
            closed_connections: self.closed_connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            bad_connections: self.bad_connections.load(Ordering::Relaxed),
            denied_filtered: self.denied_filtered.load(Ordering::Relaxed),
            refused_acl: self.refused_acl.load(Ordering::Relaxed),
        }
    }
}

/// Renders the statistics page served when a request targets the stathost.
pub fn stats_response(snapshot: &StatsSnapshot) -> String {
    let body = format!(
        "<h1>{package} {version} statistics</h1>\r\n\
         <table>\r\n\
         <tr><td>Connections opened</td><td>{opened}</td></tr>\r\n\
         <tr><td>Connections closed</td><td>{closed}</td></tr>\r\n\
         <tr><td>Requests proxied</td><td>{requests}</td></tr>\r\n\
         <tr><td>Bad connections</td><td>{bad}</td></tr>\r\n\
         <tr><td>Refused (access control)</td><td>{refused}</td></tr>\r\n\
         <tr><td>Denied (filtered domain)</td><td>{denied}</td></tr>\r\n\
         </table>",
        package = wicket_http::PACKAGE,
        version = wicket_http::VERSION,
        opened = snapshot.opened_connections,
        closed = snapshot.closed_connections,
        requests = snapshot.requests,
        bad = snapshot.bad_connections,
        refused = snapshot.refused_acl,
        denied = snapshot.denied_filtered,
    );
    wicket_http::format_html_response(200, "wicket statistics", &body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ConnectionAccepted,
    RequestReceived,
    RequestRejected,
    UpstreamConnected,
    UpstreamConnectFailed,
    TunnelEstablished,
    StatsServed,
    StreamClosed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionAccepted => "connection_accepted",
            Self::RequestReceived => "request_received",
            Self::RequestRejected => "request_rejected",
            Self::UpstreamConnected => "upstream_connected",
            Self::UpstreamConnectFailed => "upstream_connect_failed",
            Self::TunnelEstablished => "tunnel_established",
            Self::StatsServed => "stats_served",
            Self::StreamClosed => "stream_closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowContext {
    pub flow_id: u64,
    pub client_addr: String,
    pub server_host: String,
    pub server_port: u16,
}

impl FlowContext {
    /// Context for a connection whose target is not known yet.
    pub fn unresolved(flow_id: u64, client_addr: String) -> Self {
        Self {
            flow_id,
            client_addr,
            server_host: "<unknown>".to_string(),
            server_port: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub context: FlowContext,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, context: FlowContext) -> Self {
        Self {
            kind,
            context,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Collecting sink for tests.
#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}
