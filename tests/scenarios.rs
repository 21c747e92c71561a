use approx::assert_relative_eq;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

use sensor_dashboard_rs::model::{HistorySnapshot, Metric, PollSnapshot};
use sensor_dashboard_rs::sink::{Aggregate, RenderCommand, RenderSink};
use sensor_dashboard_rs::stream::{
    ErrorKind, PlaybackPath, RestartPolicy, StreamAction, StreamEvent,
    StreamResilienceController, StreamState,
};
use sensor_dashboard_rs::timestamp::{FixedClock, TimestampNormalizer, Zone};
use sensor_dashboard_rs::window::ChartWindowManager;
use sensor_dashboard_rs::{
    DashboardView, EngineConfig, SourceError, SyncEngine, TelemetrySource, TickOutcome,
};

// 2024-01-01 12:00:00 UTC
const NOW: i64 = 1_704_110_400_000;

/// Source whose next `/data` call can be held until the test releases it
#[derive(Default)]
struct GatedSource {
    history: Value,
    responses: Mutex<VecDeque<Value>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    entered: Notify,
    requests: Mutex<Vec<Option<String>>>,
    clears: AtomicUsize,
}

impl GatedSource {
    fn with_history(history: Value) -> Self {
        GatedSource {
            history,
            ..Default::default()
        }
    }

    fn respond(&self, value: Value) {
        self.responses.lock().unwrap().push_back(value);
    }

    fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    fn requests(&self) -> Vec<Option<String>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelemetrySource for GatedSource {
    async fn fetch_history(&self) -> Result<HistorySnapshot, SourceError> {
        Ok(HistorySnapshot::from_value(self.history.clone()))
    }

    async fn fetch_data(&self, since: Option<&str>) -> Result<PollSnapshot, SourceError> {
        self.requests.lock().unwrap().push(since.map(str::to_string));
        let gate = self.gate.lock().unwrap().take();
        self.entered.notify_one();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let value = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| json!({}));
        PollSnapshot::parse(&value)
    }

    async fn clear(&self) -> Result<(), SourceError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn engine_with(source: Arc<GatedSource>, primary: &str) -> (Arc<SyncEngine>, Arc<DashboardView>) {
    let view = Arc::new(DashboardView::new(50));
    let normalizer = TimestampNormalizer::new(Zone::utc(), Arc::new(FixedClock(NOW)));
    let config = EngineConfig {
        primary_sensor: primary.to_string(),
        ..Default::default()
    };
    let engine = Arc::new(SyncEngine::new(source, view.clone(), normalizer, config));
    (engine, view)
}

#[test]
fn historical_load_assigns_slots_and_seeds_series() {
    let source = Arc::new(GatedSource::default());
    let (engine, view) = engine_with(source, "S1");
    engine.on_historical_load(HistorySnapshot::from_value(
        json!({"S1": {"temp": [20, 21], "hum": [40, 41]}}),
    ));

    assert_eq!(engine.registry().slot("S1"), Some(0));
    for metric in Metric::CHARTED {
        assert_eq!(engine.series(metric, 0).len(), 2);
    }
    let snapshot = view.snapshot();
    let temp = snapshot.trace(Metric::Temperature, 0).unwrap();
    assert_eq!(temp.sensor, "S1");
    assert_eq!(temp.points.len(), 2);
    assert_eq!(snapshot.tiles["S1"]["temp"], Some(21.0));
}

#[tokio::test]
async fn poll_appends_reading_and_aggregates() {
    let source = Arc::new(GatedSource::default());
    let (engine, view) = engine_with(source.clone(), "S1");
    engine.on_historical_load(HistorySnapshot::from_value(
        json!({"S1": {"temp": [], "hum": []}}),
    ));
    source.respond(json!({"S1": {"temp": 22, "hum": 42, "timestamp": "2024-01-01 10:00:00"}}));

    let TickOutcome::Applied(summary) = engine.poll_tick().await else {
        panic!("poll was not applied");
    };

    let temp = engine.series(Metric::Temperature, 0);
    assert_eq!(temp.len(), 1);
    // 10:00:00 read as UTC wall time
    assert_eq!(temp[0].timestamp_ms, 1_704_103_200_000);
    assert_relative_eq!(temp[0].value, 22.0);

    let aggregate = summary.aggregate.unwrap();
    assert_relative_eq!(aggregate.temp, 22.0);
    assert_relative_eq!(aggregate.hum, 42.0);
    assert_eq!(aggregate.count, 1);
    assert_eq!(
        view.snapshot().aggregate,
        Some(Aggregate {
            temp: 22.0,
            hum: 42.0,
            count: 1
        })
    );
    assert!(summary.watermark_advanced);
}

#[tokio::test]
async fn poll_after_recent_history_appends_older_source_reading() {
    let source = Arc::new(GatedSource::with_history(
        json!({"S1": {"temp": [20, 21], "hum": [40, 41]}}),
    ));
    let (engine, view) = engine_with(source.clone(), "S1");
    engine.on_historical_load(source.fetch_history().await.unwrap());
    // back-filled history ends 5s before the clock, after this reading
    assert_eq!(engine.series(Metric::Temperature, 0)[1].timestamp_ms, NOW - 5_000);

    source.respond(json!({"S1": {"temp": 22, "hum": 42, "timestamp": "2024-01-01 10:00:00"}}));
    let TickOutcome::Applied(summary) = engine.poll_tick().await else {
        panic!("poll was not applied");
    };

    assert_eq!(summary.appended, 2);
    for metric in Metric::CHARTED {
        let series = engine.series(metric, 0);
        assert_eq!(series.len(), 3);
        assert_eq!(series[2].timestamp_ms, 1_704_103_200_000);
    }
    let snapshot = view.snapshot();
    let hum = snapshot.trace(Metric::Humidity, 0).unwrap();
    assert_relative_eq!(hum.points.back().unwrap().value, 42.0);
}

#[tokio::test]
async fn sensor_absent_from_tick_is_excluded() {
    let source = Arc::new(GatedSource::with_history(json!({
        "S1": {"temp": [], "hum": []},
        "S2": {"temp": [30], "hum": [60]},
        "S3": {"temp": [], "hum": []}
    })));
    let (engine, view) = engine_with(source.clone(), "S1");
    engine.on_historical_load(source.fetch_history().await.unwrap());

    source.respond(json!({
        "S1": {"temp": 20, "hum": 40, "timestamp": "2024-01-01 10:00:00"},
        "S3": {"temp": 24, "hum": 50, "timestamp": "2024-01-01 10:00:00"}
    }));
    let TickOutcome::Applied(summary) = engine.poll_tick().await else {
        panic!("poll was not applied");
    };

    assert_eq!(summary.sensors, 2);
    assert_eq!(summary.appended, 4);
    let aggregate = summary.aggregate.unwrap();
    assert_eq!(aggregate.count, 2);
    assert_relative_eq!(aggregate.temp, 22.0);
    assert_relative_eq!(aggregate.hum, 45.0);

    // S2 keeps its slot and its history, untouched
    assert_eq!(engine.registry().slot("S2"), Some(1));
    let s2 = engine.series(Metric::Temperature, 1);
    assert_eq!(s2.len(), 1);
    assert_relative_eq!(s2[0].value, 30.0);
    assert_eq!(view.snapshot().tiles["S2"]["temp"], Some(30.0));
}

#[tokio::test]
async fn reading_without_timestamp_is_stamped_with_clock() {
    let source = Arc::new(GatedSource::with_history(json!({"S1": {"temp": [], "hum": []}})));
    let (engine, _) = engine_with(source.clone(), "S1");
    engine.on_historical_load(source.fetch_history().await.unwrap());

    source.respond(json!({"S1": {"temp": 22, "hum": 42}}));
    assert!(matches!(engine.poll_tick().await, TickOutcome::Applied(_)));

    for metric in Metric::CHARTED {
        let series = engine.series(metric, 0);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].timestamp_ms, NOW);
    }
}

#[test]
fn window_keeps_newest_fifty_points() {
    struct Discard;
    impl RenderSink for Discard {
        fn render(&self, _command: RenderCommand) {}
    }

    let mut chart = ChartWindowManager::new(Metric::Temperature, 1, 50);
    for i in 0..51 {
        chart.append(0, i * 1000, 100.0 + i as f64, &Discard).unwrap();
    }
    let series = chart.series(0).unwrap();
    assert_eq!(series.len(), 50);
    assert_relative_eq!(series.front().unwrap().value, 101.0);
}

#[test]
fn network_error_reloads_then_fatal_error_restarts() {
    let mut controller =
        StreamResilienceController::new(PlaybackPath::Decoder, RestartPolicy::default(), 3);
    controller.handle(StreamEvent::Start);
    controller.handle(StreamEvent::ManifestParsed);
    controller.handle(StreamEvent::FrameRendered);
    assert_eq!(controller.state(), StreamState::Playing);

    let actions = controller.handle(StreamEvent::fatal(ErrorKind::Network, "segment 404"));
    assert_eq!(actions, vec![StreamAction::ReloadSource]);
    assert_ne!(controller.state(), StreamState::FatalRestarting);

    let actions = controller.handle(StreamEvent::fatal(ErrorKind::Other, "decoder gone"));
    assert_eq!(
        actions,
        vec![
            StreamAction::Teardown,
            StreamAction::ScheduleRestart(Duration::from_secs(3))
        ]
    );
    assert_eq!(controller.state(), StreamState::FatalRestarting);

    let actions = controller.handle(StreamEvent::RestartElapsed);
    assert_eq!(actions, vec![StreamAction::Attach]);
    assert_eq!(controller.state(), StreamState::Attaching);
}

#[tokio::test]
async fn stale_response_after_clear_is_discarded() {
    let source = Arc::new(GatedSource::with_history(
        json!({"S1": {"temp": [20], "hum": [40]}}),
    ));
    let (engine, view) = engine_with(source.clone(), "S1");
    engine.on_historical_load(source.fetch_history().await.unwrap());

    source.respond(json!({"S1": {"temp": 21, "hum": 41, "timestamp": "2024-01-01 11:00:00"}}));
    assert!(matches!(engine.poll_tick().await, TickOutcome::Applied(_)));
    assert_eq!(engine.watermark().unwrap().to_string(), "2024-01-01 11:00:00");

    // the next poll is held in flight while the user clears
    let release = source.hold_next();
    source.respond(json!({"S1": {"temp": 99, "hum": 99, "timestamp": "2024-01-01 11:00:10"}}));
    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.poll_tick().await })
    };
    source.entered.notified().await;

    engine.reset().await.unwrap();
    assert_eq!(source.clears.load(Ordering::SeqCst), 1);
    release.send(()).unwrap();

    assert!(matches!(pending.await.unwrap(), TickOutcome::Stale));
    for metric in Metric::CHARTED {
        assert!(engine.series(metric, 0).is_empty());
    }
    assert!(view
        .snapshot()
        .trace(Metric::Temperature, 0)
        .unwrap()
        .points
        .is_empty());
    assert_eq!(engine.watermark(), None);

    // the next poll starts over without a watermark
    engine.poll_tick().await;
    assert_eq!(
        source.requests(),
        vec![None, Some("2024-01-01 11:00:00".to_string()), None]
    );
}

#[tokio::test]
async fn concurrent_tick_is_skipped_not_queued() {
    let source = Arc::new(GatedSource::with_history(json!({"S1": {"temp": [], "hum": []}})));
    let (engine, _) = engine_with(source.clone(), "S1");
    engine.on_historical_load(source.fetch_history().await.unwrap());

    let release = source.hold_next();
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.poll_tick().await })
    };
    source.entered.notified().await;

    assert!(matches!(engine.poll_tick().await, TickOutcome::Skipped));
    release.send(()).unwrap();
    assert!(matches!(first.await.unwrap(), TickOutcome::Applied(_)));
    assert_eq!(source.requests().len(), 1);
}
