use std::io;

use wicket_core::{ProxyConfig, ProxyEngine};
use wicket_daemon::ProxyServer;
use wicket_observe::{EventLogConfig, EventSink, FileEventSink, NoopEventSink};
use wicket_policy::DefaultAccessPolicy;

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => load_config(&path)?,
        None => ProxyConfig::default(),
    };
    config
        .validate()
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error.to_string()))?;

    match config.event_log_path.clone() {
        Some(path) => serve(config, FileEventSink::new(EventLogConfig::new(path))?).await,
        None => serve(config, NoopEventSink).await,
    }
}

fn load_config(path: &str) -> io::Result<ProxyConfig> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error.to_string()))
}

async fn serve<S>(config: ProxyConfig, sink: S) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let policy = DefaultAccessPolicy::new(
        config.allowed_clients.clone(),
        config.denied_clients.clone(),
        config.filter_enabled,
        config.filtered_domains.clone(),
        config.anonymous_headers.clone(),
    );
    let listen_addr = config.listen_addr.clone();
    let listen_port = config.listen_port;

    let engine = ProxyEngine::new(config, policy, sink);
    let server = ProxyServer::new(engine);

    eprintln!("starting wicket on {listen_addr}:{listen_port}");
    server.run().await
}
