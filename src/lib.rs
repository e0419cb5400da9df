// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod analytics;
pub mod api;
pub mod batch;
pub mod config;
pub mod detector;
pub mod gateway;
pub mod ingest;
pub mod stats;
pub mod stream;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, OpsState};
pub use crate::batch::BatchProcessor;
pub use crate::detector::CriticalEventDetector;
pub use crate::gateway::{AnalyticsEngine, DynAnalytics, DynGateway, PersistenceGateway};
pub use crate::ingest::Dispatcher;
pub use crate::stats::StatisticsRegistry;
pub use crate::stream::StreamSupervisor;
