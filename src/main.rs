use peerdrop::core::config::DEFAULT_RELAY_ADDR;
use peerdrop::relay::{RelayServer, TokenAuthenticator};
use peerdrop::utils::sos::SignalOfStop;
use peerdrop::workers::args::Args;
use peerdrop::workers::endpoint::{endpoint_config, Endpoint};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Init tracing with layered subscriber.
    // Note: webrtc_ice generates many "unknown TransactionID" warnings for
    // late-arriving STUN responses, which are normal. Filter these out to
    // reduce noise.
    let filter = match args.verbose {
        0 => "warn,peerdrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    if let Some(config) = endpoint_config(&args) {
        return Endpoint::run(config, sos).await;
    }

    let bind = args.bind.as_deref().unwrap_or(DEFAULT_RELAY_ADDR);
    let listener = RelayServer::bind(bind).await?;
    let server = Arc::new(RelayServer::new(Arc::new(TokenAuthenticator)));
    server.run(listener, sos).await
}
