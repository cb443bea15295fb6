use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sipcap::capture::{PacketSource, SourceMetrics};
use sipcap::collect::{self, CollectMetrics};
use sipcap::extract::{Accept, ExtractMetrics, Extractor};
use sipcap::publisher::MqttPublisher;
use sipcap::{filters, metrics};

mod cli;

use cli::Cli;

/// Messages that may queue between capture and publish before the
/// collector starts dropping.
const QUEUE_DEPTH: usize = 10_000;

const TELEMETRY_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn init_logging(level: &str) {
    let default = match level {
        "debug" => "debug",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    debug!("setting up signal handling");
    tokio::spawn(async move {
        wait_for_signal().await;
        debug!("received quit signal");
        let _ = shutdown_tx.send(true);
        // Hold the sender so receivers stay valid for the rest of the
        // shutdown sequence.
        std::future::pending::<()>().await;
    });

    debug!("compiling SIP selection filter");
    let filter = filters::compile(&cli.sip_filter).context("unable to compile SIP filter")?;

    debug!("creating MQTT publisher");
    let publisher = Arc::new(
        MqttPublisher::connect(&cli.mqtt_config(), shutdown_rx.clone())
            .await
            .context("unable to connect to MQTT broker")?,
    );

    debug!("building message collector");
    let collect_metrics = Arc::new(CollectMetrics::new().context("building collector metrics")?);
    collect_metrics.set_filter(&cli.sip_filter);
    let (accepter, collector) =
        collect::new(filter, publisher.clone(), QUEUE_DEPTH, collect_metrics.clone());
    tokio::spawn(collector.publish_loop(shutdown_rx.clone()));

    debug!("initializing pcap source");
    let source_metrics = SourceMetrics::new().context("building source metrics")?;
    let source = PacketSource::open(
        &cli.interface,
        &cli.bpf_filter,
        shutdown_rx.clone(),
        &source_metrics,
    )
    .context("unable to initialize pcap source")?;

    let extract_metrics = Arc::new(ExtractMetrics::new().context("building extraction metrics")?);

    let registry = Arc::new(Registry::new());
    source_metrics
        .register(&registry)
        .context("registering source metrics")?;
    extract_metrics
        .register(&registry)
        .context("registering extraction metrics")?;
    collect_metrics
        .register(&registry)
        .context("registering collector metrics")?;

    if !cli.metrics_addr.is_empty() {
        let listener = TcpListener::bind(&cli.metrics_addr)
            .await
            .with_context(|| format!("binding metrics endpoint {}", cli.metrics_addr))?;
        info!(address = %cli.metrics_addr, path = "/metrics", "publishing Prometheus endpoint");
        tokio::spawn(metrics::serve(listener, registry.clone(), shutdown_rx.clone()));
    }

    if !cli.telemetry_topic.is_empty() {
        tokio::spawn(telemetry_loop(
            registry.clone(),
            publisher.clone(),
            shutdown_rx.clone(),
        ));
    }

    debug!("beginning signaling capture");
    let accept: Accept = Arc::new(move |sip| accepter.accept(sip));
    Extractor::new(extract_metrics)
        .extract(source.into_packets(), accept, shutdown_rx)
        .await;

    publisher.close().await;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Periodically publish a counters snapshot to the telemetry topic.
async fn telemetry_loop(
    registry: Arc<Registry>,
    publisher: Arc<MqttPublisher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval_at(
        tokio::time::Instant::now() + TELEMETRY_INTERVAL,
        TELEMETRY_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tick.tick() => {
                let snapshot = metrics::snapshot(&registry);
                let Ok(payload) = serde_json::to_vec(&snapshot) else {
                    continue;
                };
                if let Err(err) = publisher.publish_telemetry(payload).await {
                    warn!(error = %err, "telemetry publish failed");
                }
            }
        }
    }
}
