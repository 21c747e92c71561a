//! Server-side copy of what the browser is showing.
//!
//! `DashboardView` is the `RenderSink` the binary hands to the engine and the
//! stream supervisor. It folds every command into a snapshot (served on
//! `/state` and sent to new websocket clients) and re-broadcasts the command
//! itself so connected clients can apply it incrementally.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::model::{Metric, SensorId};
use crate::sink::{Aggregate, RenderCommand, RenderSink, TraceInit};
use crate::window::{SeriesPoint, VisibleWindow};

const BROADCAST_CAPACITY: usize = 256;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TraceView {
    pub sensor: SensorId,
    pub points: VecDeque<SeriesPoint>,
    pub window: Option<VisibleWindow>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViewSnapshot {
    /// Bumped on every applied command
    pub revision: u64,
    pub charts: BTreeMap<Metric, Vec<TraceView>>,
    pub tiles: BTreeMap<SensorId, BTreeMap<String, Option<f64>>>,
    pub aggregate: Option<Aggregate>,
    pub feed_overlay: bool,
}

impl Default for ViewSnapshot {
    fn default() -> Self {
        ViewSnapshot {
            revision: 0,
            charts: BTreeMap::new(),
            tiles: BTreeMap::new(),
            aggregate: None,
            // overlay stays up until the feed proves it is playing
            feed_overlay: true,
        }
    }
}

impl ViewSnapshot {
    pub fn trace(&self, metric: Metric, slot: usize) -> Option<&TraceView> {
        self.charts.get(&metric).and_then(|traces| traces.get(slot))
    }

    fn apply(&mut self, command: &RenderCommand, max_points: usize) {
        match command {
            RenderCommand::InitTraces { metric, traces } => {
                self.charts
                    .insert(*metric, traces.iter().map(trace_view).collect());
            }
            RenderCommand::ExtendTrace {
                metric,
                slot,
                point,
            } => {
                let traces = self.charts.entry(*metric).or_default();
                if traces.len() <= *slot {
                    traces.resize_with(slot + 1, TraceView::default);
                }
                let points = &mut traces[*slot].points;
                points.push_back(*point);
                while points.len() > max_points {
                    points.pop_front();
                }
            }
            RenderCommand::SetWindow {
                metric,
                slot,
                window,
            } => {
                if let Some(trace) = self
                    .charts
                    .get_mut(metric)
                    .and_then(|traces| traces.get_mut(*slot))
                {
                    trace.window = Some(*window);
                }
            }
            RenderCommand::UpdateTile { sensor, values } => {
                self.tiles.insert(sensor.clone(), values.clone());
            }
            RenderCommand::UpdateAggregate { aggregate } => {
                self.aggregate = *aggregate;
            }
            RenderCommand::FeedOverlay { visible } => {
                self.feed_overlay = *visible;
            }
        }
        self.revision += 1;
    }
}

fn trace_view(init: &TraceInit) -> TraceView {
    TraceView {
        sensor: init.sensor.clone(),
        points: init.points.iter().copied().collect(),
        window: None,
    }
}

pub struct DashboardView {
    max_points: usize,
    snapshot: Mutex<ViewSnapshot>,
    updates: broadcast::Sender<RenderCommand>,
}

impl DashboardView {
    pub fn new(max_points: usize) -> Self {
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        DashboardView {
            max_points: max_points.max(1),
            snapshot: Mutex::new(ViewSnapshot::default()),
            updates,
        }
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.lock().clone()
    }

    /// Current snapshot plus a receiver for exactly the commands rendered after it
    pub fn snapshot_and_subscribe(&self) -> (ViewSnapshot, broadcast::Receiver<RenderCommand>) {
        let snapshot = self.lock();
        (snapshot.clone(), self.updates.subscribe())
    }

    fn lock(&self) -> MutexGuard<'_, ViewSnapshot> {
        self.snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RenderSink for DashboardView {
    fn render(&self, command: RenderCommand) {
        // Sent under the lock so a concurrent snapshot_and_subscribe sees each
        // command in exactly one of the snapshot or the receiver
        let mut snapshot = self.lock();
        snapshot.apply(&command, self.max_points);
        // no subscribers is fine
        let _ = self.updates.send(command);
    }
}
