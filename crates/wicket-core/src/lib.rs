use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use wicket_observe::{Event, EventSink, StatKind, StatsRegistry, StatsSnapshot};
use wicket_policy::AccessPolicy;

pub mod config;
pub mod request;

pub use config::{EndpointConfig, ProxyConfig, ProxyConfigError};
pub use request::{parse_request_line, protocol_version, ParsedRequest, RequestParseError};

/// Bundles the immutable configuration snapshot, the access policy, the
/// event sink, and the shared statistics counters. One engine serves every
/// worker; workers never mutate it.
pub struct ProxyEngine<P, S>
where
    P: AccessPolicy,
    S: EventSink,
{
    pub config: Arc<ProxyConfig>,
    policy: P,
    sink: S,
    stats: Arc<StatsRegistry>,
    next_flow_id: AtomicU64,
}

impl<P, S> ProxyEngine<P, S>
where
    P: AccessPolicy,
    S: EventSink,
{
    pub fn new(config: ProxyConfig, policy: P, sink: S) -> Self {
        Self {
            config: Arc::new(config),
            policy,
            sink,
            stats: Arc::new(StatsRegistry::default()),
            next_flow_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn record_stat(&self, kind: StatKind) {
        self.stats.record(kind);
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> Arc<StatsRegistry> {
        Arc::clone(&self.stats)
    }

    pub fn emit_event(&self, event: Event) {
        self.sink.emit(event);
    }

    pub fn allocate_flow_id(&self) -> u64 {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::{ProxyConfig, ProxyEngine};
    use wicket_observe::{StatKind, VecEventSink};
    use wicket_policy::DefaultAccessPolicy;

    fn engine() -> ProxyEngine<DefaultAccessPolicy, VecEventSink> {
        ProxyEngine::new(
            ProxyConfig::default(),
            DefaultAccessPolicy::default(),
            VecEventSink::default(),
        )
    }

    #[test]
    fn flow_ids_are_unique_and_increasing() {
        let engine = engine();
        let first = engine.allocate_flow_id();
        let second = engine.allocate_flow_id();
        assert!(second > first);
    }

    #[test]
    fn stats_are_shared_through_the_handle() {
        let engine = engine();
        let handle = engine.stats_handle();
        engine.record_stat(StatKind::Requests);
        handle.record(StatKind::Requests);
        assert_eq!(engine.stats_snapshot().requests, 2);
    }
}
