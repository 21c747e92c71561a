use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::WindowError;
use crate::model::{Metric, SensorId};
use crate::sink::{RenderCommand, RenderSink, TraceInit};

pub const DEFAULT_MAX_POINTS: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// Time range covered by the retained points of one series
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleWindow {
    pub oldest_ms: i64,
    pub newest_ms: i64,
}

/// Bounded per-slot series for one chart
///
/// Each slot keeps at most `max_points` points in arrival order. Appending
/// past the cap evicts from the front (oldest first) and tells the sink
/// the new visible window. Points are never reordered; callers feed
/// non-decreasing timestamps per slot.
pub struct ChartWindowManager {
    metric: Metric,
    max_points: usize,
    series: Vec<VecDeque<SeriesPoint>>,
}

impl ChartWindowManager {
    pub fn new(metric: Metric, slots: usize, max_points: usize) -> Self {
        let max_points = max_points.max(1);
        ChartWindowManager {
            metric,
            max_points,
            series: (0..slots)
                .map(|_| VecDeque::with_capacity(max_points + 1))
                .collect(),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    pub fn slots(&self) -> usize {
        self.series.len()
    }

    /// Load initial points for a slot, keeping only the newest `max_points`
    pub fn seed<I>(&mut self, slot: usize, points: I) -> Result<(), WindowError>
    where
        I: IntoIterator<Item = SeriesPoint>,
    {
        let max_points = self.max_points;
        let series = self.series_mut(slot)?;
        series.clear();
        series.extend(points);
        while series.len() > max_points {
            series.pop_front();
        }
        Ok(())
    }

    /// Append one point and render it.
    ///
    /// Returns the new visible window when the append evicted anything.
    pub fn append(
        &mut self,
        slot: usize,
        timestamp_ms: i64,
        value: f64,
        sink: &dyn RenderSink,
    ) -> Result<Option<VisibleWindow>, WindowError> {
        let max_points = self.max_points;
        let metric = self.metric;
        let point = SeriesPoint {
            timestamp_ms,
            value,
        };

        let series = self.series_mut(slot)?;
        series.push_back(point);
        let mut evicted = 0;
        while series.len() > max_points {
            series.pop_front();
            evicted += 1;
        }
        let window = if evicted > 0 { bounds(series) } else { None };

        sink.render(RenderCommand::ExtendTrace {
            metric,
            slot,
            point,
        });
        if let Some(window) = window {
            sink.render(RenderCommand::SetWindow {
                metric,
                slot,
                window,
            });
        }
        Ok(window)
    }

    pub fn series(&self, slot: usize) -> Option<&VecDeque<SeriesPoint>> {
        self.series.get(slot)
    }

    pub fn newest(&self, slot: usize) -> Option<SeriesPoint> {
        self.series.get(slot).and_then(|s| s.back().copied())
    }

    pub fn window(&self, slot: usize) -> Option<VisibleWindow> {
        self.series.get(slot).and_then(bounds)
    }

    /// Empty every slot; slot count is unchanged
    pub fn clear(&mut self) {
        self.series.iter_mut().for_each(VecDeque::clear);
    }

    /// Current contents of every slot, labelled with `sensors[slot]`
    pub fn traces(&self, sensors: &[SensorId]) -> Vec<TraceInit> {
        self.series
            .iter()
            .enumerate()
            .map(|(slot, series)| TraceInit {
                slot,
                sensor: sensors.get(slot).cloned().unwrap_or_default(),
                points: series.iter().copied().collect(),
            })
            .collect()
    }

    fn series_mut(&mut self, slot: usize) -> Result<&mut VecDeque<SeriesPoint>, WindowError> {
        let slots = self.series.len();
        self.series
            .get_mut(slot)
            .ok_or(WindowError::UnknownSlot { slot, slots })
    }
}

fn bounds(series: &VecDeque<SeriesPoint>) -> Option<VisibleWindow> {
    Some(VisibleWindow {
        oldest_ms: series.front()?.timestamp_ms,
        newest_ms: series.back()?.timestamp_ms,
    })
}
