use crate::bench::Orchestrator;
use crate::storage::MeasurementStore;
use crate::tracker::ExecutionTracker;

#[derive(Clone)]
pub struct AppState {
    pub tracker: ExecutionTracker,
    pub orchestrator: Orchestrator,
    pub measurements: MeasurementStore,
}
