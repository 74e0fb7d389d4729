pub mod rest;
pub mod ws;

use std::sync::Arc;

use crate::broadcast::BroadcastHub;
use crate::config::AppConfig;
use crate::opportunity_filter::OpportunityFilter;
use crate::orchestrator::Orchestrator;
use crate::parquet_writer::WriterHandle;

/// Shared state handed to every axum handler, mirroring the teacher's
/// single `Arc<AppState>` wired through `.with_state(...)`.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub opportunities: Arc<OpportunityFilter>,
    pub writer: WriterHandle,
    /// Chart-frame fan-out for `/ws/realtime_charts`, separate from
    /// `orchestrator.broadcast` (the `SpreadEvent` feed for execution
    /// bots) since the two sockets carry different wire payloads.
    pub chart_hub: BroadcastHub,
}
