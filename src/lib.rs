//! Live telemetry dashboard client.
//!
//! Polls a telemetry source, keeps bounded per-sensor chart series in sync
//! with it, and keeps a live HLS feed attached across failures. Everything
//! visible goes through a [`sink::RenderSink`].

pub mod config;
pub mod cursor;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod model;
pub mod registry;
pub mod sink;
pub mod source;
pub mod stream;
pub mod timestamp;
pub mod view;
pub mod window;

pub use config::DashboardConfig;
pub use engine::{EngineConfig, SyncEngine, TickOutcome, TickSummary};
pub use error::{ConfigError, SourceError, StreamError, WindowError};
pub use sink::{RenderCommand, RenderSink};
pub use source::{HttpTelemetrySource, TelemetrySource};
pub use timestamp::{RawTimestamp, TimestampNormalizer, Zone};
pub use view::DashboardView;
