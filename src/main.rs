use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use sensor_dashboard_rs::dashboard::{self, AppState};
use sensor_dashboard_rs::stream::{
    HlsProbeFactory, PlaybackPath, StreamResilienceController, StreamSupervisor,
};
use sensor_dashboard_rs::timestamp::SystemClock;
use sensor_dashboard_rs::{
    DashboardConfig, DashboardView, HttpTelemetrySource, SyncEngine, TimestampNormalizer,
};

#[derive(Parser, Debug)]
#[command(name = "sensor_dashboard")]
#[command(about = "Headless live sensor dashboard with HLS feed supervision", long_about = None)]
struct Args {
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Telemetry source base URL
    #[arg(long)]
    base_url: Option<String>,

    /// HLS playlist URL
    #[arg(long)]
    stream_url: Option<String>,

    /// Seconds between polls
    #[arg(long)]
    poll_interval: Option<f64>,

    /// Points kept per chart trace
    #[arg(long)]
    max_points: Option<usize>,

    /// Sensor whose timestamp drives `since`
    #[arg(long)]
    primary_sensor: Option<String>,

    /// `local`, `utc` or an offset like `+01:00`
    #[arg(long)]
    time_zone: Option<String>,

    /// Play the feed through a plain element instead of the segment decoder
    #[arg(long)]
    native_playback: bool,

    /// Dashboard port
    #[arg(long)]
    port: Option<u16>,
}

impl Args {
    fn into_config(self) -> Result<DashboardConfig> {
        let mut config = match &self.config {
            Some(path) => DashboardConfig::load(path)?,
            None => DashboardConfig::default(),
        };

        if let Some(base_url) = self.base_url {
            config.base_url = base_url;
        }
        if let Some(stream_url) = self.stream_url {
            config.stream.url = Some(stream_url);
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if let Some(max_points) = self.max_points {
            config.max_points = max_points;
        }
        if let Some(primary) = self.primary_sensor {
            config.primary_sensor = primary;
        }
        if let Some(zone) = self.time_zone {
            config.time_zone = zone;
        }
        if self.native_playback {
            config.stream.playback = PlaybackPath::NativeElement;
        }
        if let Some(port) = self.port {
            config.dashboard_port = port;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    log::info!("[MAIN] Sensor dashboard starting");
    log::info!("  Source: {}", config.base_url);
    log::info!("  Stream: {}", config.stream_url());
    log::info!("  Poll interval: {:.1}s", config.poll_interval_secs);

    let view = Arc::new(DashboardView::new(config.max_points));
    let source = Arc::new(HttpTelemetrySource::new(
        &config.base_url,
        config.request_timeout(),
    ));
    let export_url = source.export_url();
    let normalizer = TimestampNormalizer::new(config.zone()?, Arc::new(SystemClock));
    let engine = Arc::new(SyncEngine::new(
        source,
        view.clone(),
        normalizer,
        config.engine_config(),
    ));

    let factory = HlsProbeFactory::new(&config.stream_url(), config.probe_settings())
        .context("stream URL")?;
    let controller = StreamResilienceController::new(
        config.stream.playback,
        config.restart_policy(),
        config.stream.max_media_recoveries,
    );
    let supervisor = StreamSupervisor::new(controller, Arc::new(factory), view.clone());
    let stream_state = supervisor.subscribe();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync_task = {
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };
    let stream_task = tokio::spawn(supervisor.run(shutdown_rx.clone()));

    let state = AppState {
        engine,
        view,
        stream: stream_state,
        export_url,
    };
    let mut server_task = tokio::spawn(dashboard::start_dashboard(
        state,
        config.dashboard_port,
        shutdown_rx,
    ));

    let server_done = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            log::info!("[MAIN] Shutting down");
            None
        }
        result = &mut server_task => Some(result),
    };
    shutdown_tx.send_replace(true);

    let server_result = match server_done {
        Some(result) => result,
        None => server_task.await,
    };
    let _ = sync_task.await;
    let _ = stream_task.await;

    match server_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e).context("dashboard server"),
        Err(e) => Err(e).context("dashboard task"),
    }
}
