use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::Level;

use feed_client::{HttpBackend, HttpBackendConfig};
use feed_core::{FeedConfig, FilterTag, GeoContext};
use feed_engine::{FeedSession, LoadOutcome};
use feed_store::{Database, OutboxRepo};
use feed_telemetry::{init_telemetry, MetricsRecorder, TelemetryConfig};

#[derive(Parser)]
#[command(name = "feed", about = "Feed session engine driver")]
struct Cli {
    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a session against a backend and scroll through it.
    Browse(BrowseArgs),
}

#[derive(clap::Args)]
struct BrowseArgs {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    base_url: String,
    #[arg(long)]
    lat: f64,
    #[arg(long)]
    lng: f64,
    #[arg(long, default_value_t = 10.0)]
    radius_km: f64,
    /// Number of items to scroll past.
    #[arg(long, default_value_t = 10)]
    steps: usize,
    /// Time spent on each item before moving on.
    #[arg(long, default_value_t = 1500)]
    dwell_ms: u64,
    /// all, free, farmer, discounted, or category:<id>.
    #[arg(long, default_value = "all")]
    filter: FilterTag,
    #[arg(long, default_value_t = 20)]
    page_size: usize,
    /// SQLite file holding events that could not be delivered.
    #[arg(long)]
    outbox: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json,
        ..TelemetryConfig::default()
    });

    match cli.command {
        Command::Browse(args) => browse(args, &telemetry).await,
    }
}

async fn browse(args: BrowseArgs, telemetry: &feed_telemetry::TelemetryGuard) -> anyhow::Result<()> {
    let backend = HttpBackend::new(HttpBackendConfig {
        base_url: args.base_url.clone(),
        ..HttpBackendConfig::default()
    })
    .context("building http backend")?;

    let config = FeedConfig {
        page_size: args.page_size,
        ..FeedConfig::default()
    };
    let item_height = config.item_height;

    let mut session =
        FeedSession::create(Arc::new(backend), config)?.with_metrics(telemetry.metrics());
    if let Some(path) = &args.outbox {
        let db = Database::open(path)
            .with_context(|| format!("opening outbox at {}", path.display()))?;
        session = session.with_outbox(OutboxRepo::new(db))?;
    }

    let outcome = session
        .open(GeoContext::new(args.lat, args.lng, args.radius_km))
        .await?;
    if outcome == LoadOutcome::Failed {
        session.dispose().await?;
        anyhow::bail!("first page could not be loaded from {}", args.base_url);
    }
    tracing::info!(session_id = %session.id(), ?outcome, "session open");

    if args.filter != FilterTag::All {
        session.set_filter(args.filter).await?;
    }

    let mut offset = 0.0;
    if let Some(to) = session.take_recenter() {
        offset = to;
        session.on_scroll(offset).await?;
    }

    for _ in 0..args.steps {
        tokio::time::sleep(Duration::from_millis(args.dwell_ms)).await;
        while let Some(update) = session.try_next_update() {
            session.handle_update(update).await?;
        }
        if let Some(to) = session.take_recenter() {
            offset = to;
            session.on_scroll(offset).await?;
        }

        offset += item_height;
        let response = session.on_scroll(offset).await?;
        if let Some(to) = response.recenter_to {
            offset = to;
            session.on_scroll(offset).await?;
        }
        if let Some(item) = session.current_item() {
            tracing::info!(index = ?response.real_index, item_id = %item.id, "viewing");
        } else {
            tracing::info!("nothing matches the active filter");
        }
    }

    let snapshot = session.snapshot();
    let report = session.dispose().await?;
    tracing::info!(
        fetched = snapshot.fetched_len,
        visible = snapshot.filtered_len,
        delivered = report.delivered,
        stashed = report.stashed,
        undelivered = report.undelivered,
        "session closed"
    );
    if let Some(metrics) = telemetry.metrics() {
        report_metrics(&metrics);
    }
    Ok(())
}

fn report_metrics(metrics: &MetricsRecorder) {
    let dwell = metrics.histogram_summary("feed.dwell_ms", &[]);
    if dwell.count > 0 {
        tracing::info!(
            viewings = dwell.count,
            p50_ms = dwell.p50,
            p95_ms = dwell.p95,
            "dwell summary"
        );
    }
    for sample in metrics.samples() {
        tracing::debug!(
            name = %sample.name,
            labels = ?sample.labels,
            kind = ?sample.metric_type,
            value = sample.value,
            "metric"
        );
    }
}
