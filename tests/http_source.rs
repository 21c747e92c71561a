use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sensor_dashboard_rs::model::Metric;
use sensor_dashboard_rs::timestamp::{FixedClock, TimestampNormalizer, Zone};
use sensor_dashboard_rs::{
    DashboardView, EngineConfig, HttpTelemetrySource, SourceError, SyncEngine, TelemetrySource,
    TickOutcome,
};

#[derive(Clone, Default)]
struct Server {
    seen_since: Arc<Mutex<Vec<Option<String>>>>,
    fail_data: Arc<Mutex<bool>>,
}

async fn history() -> Json<Value> {
    Json(json!({
        "Sensor_2": {"timestamps": ["2024-01-01 09:00:00", "2024-01-01 09:00:05"], "temp": [19.5, 19.6], "hum": [50.0, null]},
        "Shelly": {"temp": 30.1, "apower": 120.0},
        "Sensor_1": {"timestamps": ["2024-01-01 09:00:00"], "temp": [21.0], "hum": [45.0]},
        "Pi": {"temp": 48.0, "cpu": 12.5}
    }))
}

async fn data(
    State(server): State<Server>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    server
        .seen_since
        .lock()
        .unwrap()
        .push(query.get("since").cloned());
    if *server.fail_data.lock().unwrap() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "Sensor_1": {"timestamp": "2024-01-01 09:01:00", "temp": 21.4, "hum": 44.0},
        "Sensor_2": {"timestamp": "2024-01-01 09:01:00", "temp": 19.9, "hum": 51.0},
        "Shelly": {"timestamp": "2024-01-01 09:01:00", "temp": 30.3, "apower": 118.0},
        "Sensor_9": {"timestamp": "2024-01-01 09:01:00", "temp": 1.0, "hum": 1.0}
    })))
}

async fn clear() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn serve(server: Server) -> String {
    let app = Router::new()
        .route("/history", get(history))
        .route("/data", get(data))
        .route("/clear", post(clear))
        .with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn history_then_polls_over_http() {
    let server = Server::default();
    let base = serve(server.clone()).await;

    let source = Arc::new(HttpTelemetrySource::new(&base, Duration::from_secs(5)));
    let view = Arc::new(DashboardView::new(50));
    let normalizer =
        TimestampNormalizer::new(Zone::utc(), Arc::new(FixedClock(1_704_110_400_000)));
    let engine = SyncEngine::new(source.clone(), view.clone(), normalizer, EngineConfig::default());

    engine.on_historical_load(source.fetch_history().await.unwrap());
    let registry = engine.registry();
    assert_eq!(registry.sensors(), &["Sensor_2".to_string(), "Sensor_1".to_string()]);
    assert_eq!(engine.series(Metric::Temperature, 0).len(), 2);
    assert_eq!(engine.series(Metric::Humidity, 0).len(), 1);

    let TickOutcome::Applied(summary) = engine.poll_tick().await else {
        panic!("first poll not applied");
    };
    assert_eq!(summary.sensors, 2);
    assert_eq!(summary.appended, 4);
    assert_eq!(summary.dropped, vec!["Sensor_9".to_string()]);
    assert_eq!(summary.aggregate.map(|a| a.count), Some(2));
    assert_eq!(
        engine.watermark().map(|w| w.to_string()),
        Some("2024-01-01 09:01:00".to_string())
    );

    // same readings again: tiles refresh, nothing appended
    let TickOutcome::Applied(summary) = engine.poll_tick().await else {
        panic!("second poll not applied");
    };
    assert_eq!(summary.appended, 0);

    assert_eq!(
        *server.seen_since.lock().unwrap(),
        vec![None, Some("2024-01-01 09:01:00".to_string())]
    );

    let snapshot = view.snapshot();
    assert_eq!(snapshot.tiles["Shelly"]["apower"], Some(118.0));
    assert_eq!(snapshot.tiles["Pi"]["cpu"], Some(12.5));
    assert!(snapshot.tiles.get("Sensor_9").is_none());
}

#[tokio::test]
async fn http_failure_leaves_state_untouched() {
    let server = Server::default();
    *server.fail_data.lock().unwrap() = true;
    let base = serve(server.clone()).await;

    let source = Arc::new(HttpTelemetrySource::new(&base, Duration::from_secs(5)));
    let engine = SyncEngine::new(
        source.clone(),
        Arc::new(DashboardView::new(50)),
        TimestampNormalizer::new(Zone::utc(), Arc::new(FixedClock(1_704_110_400_000))),
        EngineConfig::default(),
    );
    engine.on_historical_load(source.fetch_history().await.unwrap());

    match engine.poll_tick().await {
        TickOutcome::Failed(SourceError::Http(503)) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(engine.watermark(), None);
    assert_eq!(engine.series(Metric::Temperature, 1).len(), 1);
}

#[tokio::test]
async fn clear_posts_to_source() {
    let base = serve(Server::default()).await;
    let source = HttpTelemetrySource::new(&base, Duration::from_secs(5));
    source.clear().await.unwrap();
    assert_eq!(source.export_url(), format!("{}/export", base));
}
