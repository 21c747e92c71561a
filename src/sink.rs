//! Render instructions emitted by the sync engine and the stream supervisor.
//!
//! The engine never draws anything itself. It describes what changed as a
//! `RenderCommand` and hands it to a `RenderSink`; the sink decides how to
//! show it (websocket push, a GUI, a test recorder).

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

use crate::model::{Metric, SensorId};
use crate::window::{SeriesPoint, VisibleWindow};

/// Full trace contents for one slot, used for initial and blank renders
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraceInit {
    pub slot: usize,
    pub sensor: SensorId,
    pub points: Vec<SeriesPoint>,
}

/// Mean of temperature and humidity across sensors that reported both this tick
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Aggregate {
    pub temp: f64,
    pub hum: f64,
    pub count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderCommand {
    /// Replace every trace of a chart
    InitTraces {
        metric: Metric,
        traces: Vec<TraceInit>,
    },
    /// Append one point to a trace
    ExtendTrace {
        metric: Metric,
        slot: usize,
        point: SeriesPoint,
    },
    /// Visible time range of a trace after eviction
    SetWindow {
        metric: Metric,
        slot: usize,
        window: VisibleWindow,
    },
    /// Latest values for a summary tile; None renders as "--"
    UpdateTile {
        sensor: SensorId,
        values: BTreeMap<String, Option<f64>>,
    },
    /// None when no sensor reported both metrics
    UpdateAggregate { aggregate: Option<Aggregate> },
    /// "Feed unavailable" overlay over the video
    FeedOverlay { visible: bool },
}

pub trait RenderSink: Send + Sync {
    fn render(&self, command: RenderCommand);
}

impl<T: RenderSink + ?Sized> RenderSink for Arc<T> {
    fn render(&self, command: RenderCommand) {
        (**self).render(command)
    }
}

/// Forwards commands to a tokio channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<RenderCommand>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<RenderCommand>) -> Self {
        ChannelSink { tx }
    }
}

impl RenderSink for ChannelSink {
    fn render(&self, command: RenderCommand) {
        if self.tx.send(command).is_err() {
            log::debug!("[SINK] Receiver dropped, render command discarded");
        }
    }
}

/// Keeps every command in memory
#[derive(Clone, Default)]
pub struct RecordingSink {
    commands: Arc<Mutex<Vec<RenderCommand>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<RenderCommand> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Drain and return everything recorded so far
    pub fn take(&self) -> Vec<RenderCommand> {
        self.commands
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default()
    }

    pub fn extended(&self, metric: Metric, slot: usize) -> Vec<SeriesPoint> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                RenderCommand::ExtendTrace {
                    metric: m,
                    slot: s,
                    point,
                } if m == metric && s == slot => Some(point),
                _ => None,
            })
            .collect()
    }
}

impl RenderSink for RecordingSink {
    fn render(&self, command: RenderCommand) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
    }
}
