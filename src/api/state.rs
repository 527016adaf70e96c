use std::sync::Arc;

use crate::correlate::{CorrelationEngine, IncidentStore};
use crate::ingest::IngestGateway;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<IngestGateway>,
    pub engine: Arc<CorrelationEngine>,
    pub store: Arc<IncidentStore>,
}
