use chrono::Utc;
use payrecon_types::{
    time, DateRange, Discrepancy, Operation, ReconciliationRun, RunCounts, RunError, RunId,
    RunStatus, RunStore, RunTrigger,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Default)]
struct RunState {
    runs: Vec<ReconciliationRun>,
    discrepancies: Vec<Discrepancy>,
}

impl RunState {
    fn running_mut(&mut self, id: RunId) -> Result<&mut ReconciliationRun, RunError> {
        let run = self
            .runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or(RunError::NotFound { id })?;
        if run.status == RunStatus::Running {
            Ok(run)
        } else {
            Err(RunError::NotRunning {
                id,
                status: run.status,
            })
        }
    }
}

/// Thread-safe in-memory run store. The mutex doubles as the run lock.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRunStore {
    state: Arc<Mutex<RunState>>,
}

impl InMemoryRunStore {
    /// Create a new empty run store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, operation: Operation) -> Result<MutexGuard<'_, RunState>, RunError> {
        self.state
            .lock()
            .map_err(|_| RunError::StoreFailure { operation })
    }
}

impl RunStore for InMemoryRunStore {
    async fn try_begin(
        &self,
        range: DateRange,
        trigger: RunTrigger,
        stale_after: Duration,
    ) -> Result<ReconciliationRun, RunError> {
        let mut state = self.lock(Operation::WriteRun)?;
        let now = Utc::now();

        if let Some(active) = state
            .runs
            .iter_mut()
            .find(|run| run.status == RunStatus::Running)
        {
            if time::add_duration(active.started_at, stale_after) > now {
                return Err(RunError::LockContention { active: active.id });
            }
            warn!(run_id = %active.id, "[reconciliation.abandon] marking stale run as failed");
            active.status = RunStatus::Failed;
            active.finished_at = Some(now);
            active.error = Some("abandoned: still running after the staleness window".to_owned());
        }

        let run = ReconciliationRun {
            id: RunId::generate(),
            range,
            status: RunStatus::Running,
            trigger,
            counts: RunCounts::default(),
            attempts: 0,
            started_at: now,
            finished_at: None,
            error: None,
        };
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn record_discrepancy(&self, discrepancy: &Discrepancy) -> Result<(), RunError> {
        let mut state = self.lock(Operation::WriteRun)?;
        let _ = state.running_mut(discrepancy.run_id)?;

        if let Some(existing) = state
            .discrepancies
            .iter_mut()
            .find(|existing| existing.id == discrepancy.id)
        {
            *existing = discrepancy.clone();
        } else {
            state.discrepancies.push(discrepancy.clone());
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: RunId,
        counts: RunCounts,
        attempts: u32,
        status: RunStatus,
    ) -> Result<ReconciliationRun, RunError> {
        let mut state = self.lock(Operation::WriteRun)?;
        let run = state.running_mut(id)?;
        run.status = status;
        run.counts = counts;
        run.attempts = attempts;
        run.finished_at = Some(Utc::now());
        Ok(run.clone())
    }

    async fn fail(
        &self,
        id: RunId,
        counts: RunCounts,
        attempts: u32,
        error: &str,
    ) -> Result<ReconciliationRun, RunError> {
        let mut state = self.lock(Operation::WriteRun)?;
        let run = state.running_mut(id)?;
        run.status = RunStatus::Failed;
        run.counts = counts;
        run.attempts = attempts;
        run.finished_at = Some(Utc::now());
        run.error = Some(error.to_owned());
        Ok(run.clone())
    }

    async fn get(&self, id: RunId) -> Result<Option<ReconciliationRun>, RunError> {
        let state = self.lock(Operation::ReadRun)?;
        Ok(state.runs.iter().find(|run| run.id == id).cloned())
    }

    async fn discrepancies(&self, id: RunId) -> Result<Vec<Discrepancy>, RunError> {
        let state = self.lock(Operation::ReadRun)?;
        let mut found: Vec<Discrepancy> = state
            .discrepancies
            .iter()
            .filter(|discrepancy| discrepancy.run_id == id)
            .cloned()
            .collect();
        found.sort_by(|a, b| (&a.external_ref, a.id).cmp(&(&b.external_ref, b.id)));
        Ok(found)
    }

    async fn latest(&self) -> Result<Option<ReconciliationRun>, RunError> {
        let state = self.lock(Operation::ReadRun)?;
        Ok(state
            .runs
            .iter()
            .max_by_key(|run| (run.started_at, run.id))
            .cloned())
    }
}
