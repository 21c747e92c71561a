use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Local, TimeZone};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::time::{interval, Duration};
use tower_http::{services::ServeDir, trace::TraceLayer};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Parser, Debug)]
#[command(name = "mock_source")]
#[command(about = "Synthetic telemetry source for local dashboard runs", long_about = None)]
struct Args {
    /// Port to serve on
    #[arg(long, default_value = "5000")]
    port: u16,

    /// Number of generic climate sensors
    #[arg(long, default_value = "3")]
    sensors: usize,

    /// Seconds between generated readings
    #[arg(long, default_value = "5")]
    interval: u64,

    /// Readings per sensor generated up front
    #[arg(long, default_value = "300")]
    backfill: usize,

    /// Points per series returned by /history before downsampling kicks in
    #[arg(long, default_value = "100")]
    max_chart_points: usize,

    /// Directory served under /hls (playlist and segments)
    #[arg(long)]
    hls_dir: Option<PathBuf>,
}

#[derive(Clone, Debug)]
struct Row {
    timestamp: String,
    sensor: String,
    temp: f64,
    hum: f64,
}

#[derive(Default)]
struct Store {
    rows: Vec<Row>,
    shelly: Option<(String, f64, f64)>,
    cpu: f64,
}

#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<Store>>,
    sensors: usize,
    max_chart_points: usize,
}

impl AppState {
    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Deserialize)]
struct DataQuery {
    since: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let state = AppState {
        store: Arc::new(Mutex::new(Store::default())),
        sensors: args.sensors,
        max_chart_points: args.max_chart_points.max(1),
    };

    let step = Duration::from_secs(args.interval.max(1));
    let now = Local::now();
    {
        let mut store = state.store();
        for n in (1..=args.backfill).rev() {
            let at = now - chrono::Duration::seconds((n as u64 * step.as_secs()) as i64);
            generate(&mut store, args.sensors, at);
        }
    }

    let generator = state.clone();
    tokio::spawn(async move {
        let mut ticker = interval(step);
        loop {
            ticker.tick().await;
            generate(&mut generator.store(), generator.sensors, Local::now());
        }
    });

    let mut app = Router::new()
        .route("/data", get(data_handler))
        .route("/history", get(history_handler))
        .route("/clear", post(clear_handler))
        .route("/export", get(export_handler))
        .route("/ping", get(|| async { Json(json!({"status": "ok"})) }));
    if let Some(dir) = &args.hls_dir {
        app = app.nest_service("/hls", ServeDir::new(dir));
    }
    let app = app.layer(TraceLayer::new_for_http()).with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    log::info!("[MOCK] Telemetry source listening on http://{}", addr);
    log::info!("  Sensors: {} (+ Shelly, Pi)", args.sensors);
    log::info!("  Interval: {}s", step.as_secs());

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn generate<Tz: TimeZone>(store: &mut Store, sensors: usize, at: DateTime<Tz>)
where
    Tz::Offset: std::fmt::Display,
{
    let t = at.timestamp() as f64;
    let timestamp = at.format(TS_FORMAT).to_string();
    for i in 0..sensors {
        let phase = i as f64 * 0.7;
        store.rows.push(Row {
            timestamp: timestamp.clone(),
            sensor: format!("Sensor_{}", i + 1),
            temp: round1(21.0 + 2.5 * (t / 900.0 + phase).sin()),
            hum: round1(52.0 + 9.0 * (t / 1300.0 + phase).cos()),
        });
    }
    store.shelly = Some((
        timestamp,
        round1(24.0 + (t / 700.0).sin()),
        round1(120.0 + 40.0 * (t / 300.0).sin().abs()),
    ));
    store.cpu = round1(15.0 + 10.0 * (t / 60.0).sin().abs());
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Newest row per sensor, sensors in first-seen order
fn latest_per_sensor(rows: &[Row]) -> Vec<&Row> {
    let mut latest: Vec<&Row> = Vec::new();
    for row in rows {
        match latest.iter_mut().find(|r| r.sensor == row.sensor) {
            Some(slot) => *slot = row,
            None => latest.push(row),
        }
    }
    latest
}

async fn data_handler(
    State(state): State<AppState>,
    Query(query): Query<DataQuery>,
) -> Json<Value> {
    let store = state.store();
    let latest = latest_per_sensor(&store.rows);
    // sensors with nothing newer than `since` still report their last value
    if let Some(since) = query.since.as_deref() {
        log::debug!(
            "[MOCK] {} sensor(s) have data newer than {}",
            latest.iter().filter(|r| r.timestamp.as_str() > since).count(),
            since
        );
    }

    let mut result = Map::new();
    for row in latest {
        result.insert(
            row.sensor.clone(),
            json!({"timestamp": row.timestamp, "temp": row.temp, "hum": row.hum}),
        );
    }
    if let Some((timestamp, temp, apower)) = &store.shelly {
        result.insert(
            "Shelly".to_string(),
            json!({"timestamp": timestamp, "temp": temp, "apower": apower}),
        );
    }
    result.insert("Pi".to_string(), json!({"temp": 48.5, "cpu": store.cpu}));
    Json(Value::Object(result))
}

async fn history_handler(State(state): State<AppState>) -> Json<Value> {
    let store = state.store();
    let today = Local::now().format("%Y-%m-%d 00:00:00").to_string();

    let mut grouped: Vec<(String, Vec<&Row>)> = Vec::new();
    for row in store.rows.iter().filter(|r| r.timestamp >= today) {
        match grouped.iter_mut().find(|(sensor, _)| *sensor == row.sensor) {
            Some((_, rows)) => rows.push(row),
            None => grouped.push((row.sensor.clone(), vec![row])),
        }
    }

    let mut data = Map::new();
    for (sensor, rows) in grouped {
        let timestamps: Vec<&str> = rows.iter().map(|r| r.timestamp.as_str()).collect();
        let temps: Vec<f64> = rows.iter().map(|r| r.temp).collect();
        let hums: Vec<f64> = rows.iter().map(|r| r.hum).collect();
        let temp_idx = downsample(&temps, state.max_chart_points);
        let hum_idx = downsample(&hums, state.max_chart_points);
        data.insert(
            sensor,
            json!({
                "timestamps": temp_idx.iter().map(|&i| timestamps[i]).collect::<Vec<_>>(),
                "temp": temp_idx.iter().map(|&i| temps[i]).collect::<Vec<_>>(),
                "hum": hum_idx.iter().map(|&i| hums[i]).collect::<Vec<_>>(),
            }),
        );
    }
    if let Some((_, temp, apower)) = &store.shelly {
        data.insert("Shelly".to_string(), json!({"temp": temp, "apower": apower}));
    }
    data.insert("Pi".to_string(), json!({"temp": 48.5, "cpu": store.cpu}));
    Json(Value::Object(data))
}

async fn clear_handler(State(state): State<AppState>) -> Json<Value> {
    let mut store = state.store();
    let removed = store.rows.len();
    store.rows.clear();
    log::info!("[MOCK] Cleared {} readings", removed);
    Json(json!({"status": "ok"}))
}

async fn export_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store();
    let mut csv = String::from("timestamp,sensor_id,temperature,humidity\n");
    for row in &store.rows {
        csv.push_str(&format!(
            "{},{},{},{}\n",
            row.timestamp, row.sensor, row.temp, row.hum
        ));
    }
    (
        [
            (header::CONTENT_TYPE, "text/csv"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"sensor_data.csv\"",
            ),
        ],
        csv,
    )
}

/// Min/max bucket downsampling; returns indices into `values`
///
/// Each of the `max_points` buckets contributes its minimum and maximum in
/// time order, so a series of any length keeps its peaks.
fn downsample(values: &[f64], max_points: usize) -> Vec<usize> {
    let n = values.len();
    if n <= max_points {
        return (0..n).collect();
    }
    let step = n as f64 / max_points as f64;
    let mut picked = Vec::with_capacity(max_points * 2);
    for bucket in 0..max_points {
        let start = (bucket as f64 * step) as usize;
        let end = (((bucket + 1) as f64 * step) as usize).min(n);
        if start >= end {
            continue;
        }
        let window = &values[start..end];
        let mut min_idx = 0;
        let mut max_idx = 0;
        for (i, v) in window.iter().enumerate() {
            if *v < window[min_idx] {
                min_idx = i;
            }
            if *v > window[max_idx] {
                max_idx = i;
            }
        }
        let (first, second) = (min_idx.min(max_idx), min_idx.max(max_idx));
        picked.push(start + first);
        if second != first {
            picked.push(start + second);
        }
    }
    picked
}
