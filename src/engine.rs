use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::cursor::SyncCursor;
use crate::error::SourceError;
use crate::model::{HistorySnapshot, Metric, PollSnapshot, SensorId, SensorReading};
use crate::registry::SensorRegistry;
use crate::sink::{Aggregate, RenderCommand, RenderSink};
use crate::source::TelemetrySource;
use crate::timestamp::{RawTimestamp, TimestampNormalizer};
use crate::window::{ChartWindowManager, SeriesPoint, DEFAULT_MAX_POINTS};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub max_points: usize,
    /// Sensor whose timestamp drives the sync watermark
    pub primary_sensor: SensorId,
    /// Single-instance tiles kept off the charts
    pub reserved: Vec<SensorId>,
    /// Spacing used to back-fill history that came without timestamps
    pub history_spacing: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            poll_interval: Duration::from_secs(10),
            max_points: DEFAULT_MAX_POINTS,
            primary_sensor: "Shelly".to_string(),
            reserved: vec!["Shelly".to_string(), "Pi".to_string()],
            history_spacing: Duration::from_secs(5),
        }
    }
}

/// What one poll tick did
#[derive(Debug)]
pub enum TickOutcome {
    Applied(TickSummary),
    /// A previous poll was still in flight
    Skipped,
    /// Response belonged to a cursor epoch that a reset invalidated
    Stale,
    Failed(SourceError),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickSummary {
    /// Registered sensors present in the response
    pub sensors: usize,
    /// Points appended across all charts
    pub appended: usize,
    /// Response entries with no slot and no reserved tile
    pub dropped: Vec<SensorId>,
    pub aggregate: Option<Aggregate>,
    pub watermark_advanced: bool,
}

struct EngineState {
    registry: SensorRegistry,
    cursor: SyncCursor,
    charts: Vec<ChartWindowManager>,
    /// Newest source timestamp per chart and slot; re-emitted readings at or
    /// below it are not re-appended. Back-filled history never lands here.
    last_applied: Vec<Vec<Option<i64>>>,
}

impl EngineState {
    fn empty(max_points: usize) -> Self {
        EngineState {
            registry: SensorRegistry::default(),
            cursor: SyncCursor::new(),
            charts: Metric::CHARTED
                .iter()
                .map(|m| ChartWindowManager::new(*m, 0, max_points))
                .collect(),
            last_applied: Vec::new(),
        }
    }
}

#[derive(Default)]
struct AggregateAccumulator {
    temp_sum: f64,
    hum_sum: f64,
    count: usize,
}

impl AggregateAccumulator {
    fn add(&mut self, temp: f64, hum: f64) {
        self.temp_sum += temp;
        self.hum_sum += hum;
        self.count += 1;
    }

    fn finish(&self) -> Option<Aggregate> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(Aggregate {
            temp: self.temp_sum / n,
            hum: self.hum_sum / n,
            count: self.count,
        })
    }
}

/// Clears the in-flight flag however the poll ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps per-sensor charts in step with a polled telemetry source
///
/// # Lifecycle
/// 1. `on_historical_load` once: registry, seeded series, initial render
/// 2. `poll_tick` on a fixed interval: fetch since the watermark, merge,
///    advance the watermark
/// 3. `reset` on a clear: server history wiped, cursor epoch bumped, blank
///    charts rendered
///
/// Polls are serialized. State is behind a std mutex that is never held
/// across an await, so a reset can land while a fetch is outstanding; the
/// response is then recognised by its epoch tag and dropped.
pub struct SyncEngine {
    source: Arc<dyn TelemetrySource>,
    sink: Arc<dyn RenderSink>,
    normalizer: TimestampNormalizer,
    config: EngineConfig,
    state: Mutex<EngineState>,
    polling: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        sink: Arc<dyn RenderSink>,
        normalizer: TimestampNormalizer,
        config: EngineConfig,
    ) -> Self {
        let state = EngineState::empty(config.max_points);
        SyncEngine {
            source,
            sink,
            normalizer,
            config,
            state: Mutex::new(state),
            polling: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Build the registry and render history. Called once per session.
    pub fn on_historical_load(&self, snapshot: HistorySnapshot) {
        let registry = SensorRegistry::build(&snapshot, &self.config.reserved);
        let now = self.normalizer.now_ms();
        let spacing = self.config.history_spacing.as_millis() as i64;

        let mut charts: Vec<ChartWindowManager> = Metric::CHARTED
            .iter()
            .map(|m| ChartWindowManager::new(*m, registry.len(), self.config.max_points))
            .collect();
        let mut last_applied = vec![vec![None; registry.len()]; charts.len()];

        for (slot, id) in registry.sensors().iter().enumerate() {
            let Some(history) = snapshot.series(id) else {
                log::warn!("[SYNC] History entry for {} is not an object", id);
                continue;
            };
            // Values past the end of a partial timestamp list are dropped by the zip
            let stamped = !history.timestamps.is_empty();
            let timestamps: Vec<i64> = if stamped {
                history
                    .timestamps
                    .iter()
                    .map(|raw| self.normalizer.normalize(raw))
                    .collect()
            } else {
                let n = history.len() as i64;
                (0..n).map(|i| now - (n - i) * spacing).collect()
            };

            let mut latest = BTreeMap::new();
            for (c, chart) in charts.iter_mut().enumerate() {
                let metric = chart.metric();
                let values = history.values(metric);
                let points: Vec<SeriesPoint> = values
                    .iter()
                    .zip(&timestamps)
                    .filter_map(|(v, ts)| {
                        v.map(|value| SeriesPoint {
                            timestamp_ms: *ts,
                            value,
                        })
                    })
                    .collect();
                latest.insert(metric.key().to_string(), values.iter().rev().find_map(|v| *v));
                if let Err(e) = chart.seed(slot, points) {
                    log::warn!("[SYNC] Cannot seed {}: {}", id, e);
                }
                if stamped {
                    last_applied[c][slot] = chart.newest(slot).map(|p| p.timestamp_ms);
                }
            }

            self.sink.render(RenderCommand::UpdateTile {
                sensor: id.clone(),
                values: latest,
            });
        }

        for id in registry.reserved() {
            if let Some(scalars) = snapshot.scalars(id) {
                self.render_tile(id, &scalars);
            }
        }

        for chart in &charts {
            self.sink.render(RenderCommand::InitTraces {
                metric: chart.metric(),
                traces: chart.traces(registry.sensors()),
            });
        }

        let mut state = self.state();
        state.registry = registry;
        state.charts = charts;
        state.last_applied = last_applied;
    }

    /// One poll: fetch since the watermark and merge the response
    pub async fn poll_tick(&self) -> TickOutcome {
        if self.polling.swap(true, Ordering::AcqRel) {
            log::debug!("[SYNC] Previous poll still in flight, skipping tick");
            return TickOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.polling);

        let request = self.state().cursor.query();
        let snapshot = match self.source.fetch_data(request.since.as_deref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("[SYNC] Poll failed (since={:?}): {}", request.since, e);
                return TickOutcome::Failed(e);
            }
        };

        let mut state = self.state();
        if !state.cursor.accepts(&request) {
            log::info!(
                "[SYNC] Discarding stale response from epoch {} (now {})",
                request.epoch,
                state.cursor.epoch()
            );
            return TickOutcome::Stale;
        }
        TickOutcome::Applied(self.apply(&mut state, &snapshot))
    }

    fn apply(&self, state: &mut EngineState, snapshot: &PollSnapshot) -> TickSummary {
        let EngineState {
            registry,
            cursor,
            charts,
            last_applied,
        } = state;
        let mut summary = TickSummary::default();
        let mut aggregate = AggregateAccumulator::default();

        for id in registry.reserved() {
            if let Some(reading) = snapshot.get(id) {
                self.render_tile(id, reading);
            }
        }

        for (slot, id) in registry.sensors().iter().enumerate() {
            let Some(reading) = snapshot.get(id) else {
                continue;
            };
            summary.sensors += 1;
            self.render_tile(id, reading);

            let temp = reading.charted(Metric::Temperature);
            let hum = reading.charted(Metric::Humidity);
            if let (Some(t), Some(h)) = (temp, hum) {
                aggregate.add(t, h);
            }

            let ts = self.normalizer.normalize(&reading.timestamp);
            for (c, chart) in charts.iter_mut().enumerate() {
                let Some(value) = reading.charted(chart.metric()) else {
                    continue;
                };
                if matches!(last_applied[c][slot], Some(last) if ts <= last) {
                    log::debug!(
                        "[SYNC] {} re-sent {} at {}, not appending",
                        id,
                        chart.metric().key(),
                        ts
                    );
                    continue;
                }
                match chart.append(slot, ts, value, self.sink.as_ref()) {
                    Ok(_) => {
                        summary.appended += 1;
                        last_applied[c][slot] = Some(ts);
                    }
                    Err(e) => log::warn!("[SYNC] {}: {}", id, e),
                }
            }
        }

        for (id, _) in &snapshot.readings {
            if registry.slot(id).is_none() && !registry.is_reserved(id) {
                log::warn!("[SYNC] No slot for sensor {}, update dropped", id);
                summary.dropped.push(id.clone());
            }
        }

        summary.aggregate = aggregate.finish();
        self.sink.render(RenderCommand::UpdateAggregate {
            aggregate: summary.aggregate,
        });

        if let Some(primary) = snapshot.get(&self.config.primary_sensor) {
            summary.watermark_advanced = cursor.observe_primary(&primary.timestamp, &self.normalizer);
        }
        summary
    }

    fn render_tile(&self, id: &str, reading: &SensorReading) {
        self.sink.render(RenderCommand::UpdateTile {
            sensor: id.to_string(),
            values: reading.metrics.clone(),
        });
    }

    /// Clear server history, then local state
    ///
    /// Local state is left alone when the source refuses the clear, so the
    /// charts keep matching what the server still holds.
    pub async fn reset(&self) -> Result<(), SourceError> {
        self.source.clear().await?;
        self.reset_view();
        Ok(())
    }

    /// Drop every series point and the watermark; slots are kept
    pub fn reset_view(&self) {
        let mut guard = self.state();
        let state = &mut *guard;
        state.cursor.reset();
        state
            .last_applied
            .iter_mut()
            .flatten()
            .for_each(|t| *t = None);
        for chart in state.charts.iter_mut() {
            chart.clear();
            self.sink.render(RenderCommand::InitTraces {
                metric: chart.metric(),
                traces: chart.traces(state.registry.sensors()),
            });
        }
        self.sink
            .render(RenderCommand::UpdateAggregate { aggregate: None });
        log::info!("[SYNC] Reset to epoch {}", state.cursor.epoch());
    }

    /// Load history, then poll every `poll_interval` until `shutdown` flips
    ///
    /// Nothing in here ends the loop except the shutdown signal: failed
    /// history leaves an empty registry, failed polls wait for the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let snapshot = match self.source.fetch_history().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("[SYNC] History load failed, starting with no sensors: {}", e);
                HistorySnapshot::default()
            }
        };
        self.on_historical_load(snapshot);

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!(
            "[SYNC] Polling every {:.1}s",
            self.config.poll_interval.as_secs_f64()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let TickOutcome::Applied(summary) = self.poll_tick().await {
                        log::debug!("[SYNC] Tick applied: {:?}", summary);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("[SYNC] Poll loop stopped");
    }

    pub fn registry(&self) -> SensorRegistry {
        self.state().registry.clone()
    }

    pub fn series(&self, metric: Metric, slot: usize) -> Vec<SeriesPoint> {
        self.state()
            .charts
            .iter()
            .find(|c| c.metric() == metric)
            .and_then(|c| c.series(slot))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn watermark(&self) -> Option<RawTimestamp> {
        self.state().cursor.watermark().cloned()
    }

    pub fn epoch(&self) -> u64 {
        self.state().cursor.epoch()
    }
}
