//! Orchestration runtime.
//!
//! Orchestration code must be deterministic modulo activity outputs: no
//! wall-clock reads, no ambient randomness, no I/O outside
//! [`WorkflowCtx::activity`]. Every activity outcome (success or failure)
//! is recorded before the orchestration observes it, so re-running an
//! instance against its history replays decisions without repeating side
//! effects.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::rules::LockMode;

use super::activities::ActivityHandler;
use super::store::{HistoryStore, RecordedEvent};
use super::{dualwrite, ActivityError, KubeResponse, WorkflowError, WriteInput, DEFAULT_WORKFLOW_TIMEOUT};

/// History event name used for timers.
const SLEEP_EVENT: &str = "sleep";

#[derive(Serialize, Deserialize)]
enum RecordedOutcome {
    #[serde(rename = "ok")]
    Ok(serde_json::Value),
    #[serde(rename = "err")]
    Err(ActivityError),
}

/// Handle given to orchestration functions. All non-determinism crosses the
/// activity boundary through this type.
pub struct WorkflowCtx {
    instance_id: String,
    seq: u32,
    history: Vec<RecordedEvent>,
    store: HistoryStore,
    activities: ActivityHandler,
}

impl WorkflowCtx {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Execute (or replay) the next activity. Outcomes are persisted before
    /// they are returned, which makes the activity boundary a durable
    /// suspension point.
    pub async fn activity<I, O>(&mut self, name: &str, input: &I) -> Result<O, ActivityError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let seq = self.next_seq();
        let outcome = match self.recorded(seq) {
            Some(event) => {
                if event.name != name {
                    return Err(ActivityError::Internal(format!(
                        "history divergence at seq {seq}: recorded {:?}, replaying {:?}",
                        event.name, name
                    )));
                }
                serde_json::from_str::<RecordedOutcome>(&event.outcome).map_err(|e| {
                    ActivityError::Internal(format!("corrupt history at seq {seq}: {e}"))
                })?
            }
            None => {
                let input = serde_json::to_value(input)
                    .map_err(|e| ActivityError::Internal(format!("activity input encode: {e}")))?;
                let outcome = match self.activities.execute(name, input).await {
                    Ok(value) => RecordedOutcome::Ok(value),
                    Err(err) => RecordedOutcome::Err(err),
                };
                let serialized = serde_json::to_string(&outcome)
                    .map_err(|e| ActivityError::Internal(format!("activity outcome encode: {e}")))?;
                self.store
                    .record_event(&self.instance_id, seq, name, &serialized)
                    .map_err(|e| {
                        ActivityError::Internal(format!("failed to persist history: {e}"))
                    })?;
                outcome
            }
        };

        match outcome {
            RecordedOutcome::Ok(value) => serde_json::from_value(value).map_err(|e| {
                ActivityError::Internal(format!("activity {name} result decode: {e}"))
            }),
            RecordedOutcome::Err(err) => Err(err),
        }
    }

    /// Durable timer. Replays skip sleeps that already completed.
    pub async fn sleep(&mut self, duration: Duration) {
        let seq = self.next_seq();
        if self.recorded(seq).is_some() {
            return;
        }
        tokio::time::sleep(duration).await;
        if let Err(e) =
            self.store
                .record_event(&self.instance_id, seq, SLEEP_EVENT, r#"{"ok":null}"#)
        {
            warn!(instance = %self.instance_id, error = %e, "failed to record timer event");
        }
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn recorded(&self, seq: u32) -> Option<&RecordedEvent> {
        self.history.iter().find(|event| event.seq == seq)
    }
}

/// Dispatches dual-write orchestrations and resumes interrupted ones.
#[derive(Clone)]
pub struct WorkflowEngine {
    store: HistoryStore,
    activities: ActivityHandler,
    timeout: Duration,
}

impl WorkflowEngine {
    pub fn new(store: HistoryStore, activities: ActivityHandler) -> Self {
        Self {
            store,
            activities,
            timeout: DEFAULT_WORKFLOW_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a dual-write workflow and wait for its result.
    ///
    /// The orchestration runs on its own task: if the caller's wait times
    /// out (or the caller goes away), the workflow still runs to completion
    /// and its effects are preserved.
    pub async fn dispatch(
        &self,
        strategy: LockMode,
        input: WriteInput,
    ) -> Result<KubeResponse, WorkflowError> {
        input.validate()?;
        let instance_id = uuid::Uuid::new_v4().to_string();
        let input_json = serde_json::to_string(&input)
            .map_err(|e| WorkflowError::Internal(format!("workflow input encode: {e}")))?;
        self.store
            .create_instance(&instance_id, strategy_name(strategy), &input_json)
            .map_err(|e| WorkflowError::Internal(format!("workflow store: {e}")))?;

        let engine = self.clone();
        let id = instance_id.clone();
        let handle =
            tokio::spawn(async move { engine.run_instance(id, strategy, input, Vec::new()).await });

        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(WorkflowError::Internal(format!(
                "workflow task failed: {join_err}"
            ))),
            Err(_) => {
                warn!(instance = %instance_id, "client wait expired; workflow continues in the background");
                Err(WorkflowError::Timeout(self.timeout))
            }
        };
        let outcome = match &result {
            Ok(_) => "completed",
            Err(WorkflowError::Timeout(_)) => "timeout",
            Err(_) => "failed",
        };
        crate::metrics::record_workflow(
            strategy_name(strategy),
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn run_instance(
        &self,
        instance_id: String,
        strategy: LockMode,
        input: WriteInput,
        history: Vec<RecordedEvent>,
    ) -> Result<KubeResponse, WorkflowError> {
        let mut ctx = WorkflowCtx {
            instance_id: instance_id.clone(),
            seq: 0,
            history,
            store: self.store.clone(),
            activities: self.activities.clone(),
        };

        let result = match strategy {
            LockMode::Pessimistic => dualwrite::pessimistic_write(&mut ctx, &input).await,
            LockMode::Optimistic => dualwrite::optimistic_write(&mut ctx, &input).await,
        };

        let (status, payload) = match &result {
            Ok(resp) => ("completed", serde_json::to_string(resp).ok()),
            Err(err) => ("failed", serde_json::to_string(err).ok()),
        };
        if let Err(e) = self
            .store
            .complete_instance(&instance_id, status, payload.as_deref())
        {
            error!(instance = %instance_id, error = %e, "failed to mark workflow complete");
        }
        result
    }

    /// Replay every instance left running by a previous process. Called once
    /// at startup; completed activities are not re-executed.
    pub async fn resume_pending(&self) -> usize {
        let pending = match self.store.pending_instances() {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "failed to list pending workflows");
                return 0;
            }
        };

        let mut resumed = 0;
        for instance in pending {
            let Some(strategy) = parse_strategy(&instance.strategy) else {
                error!(instance = %instance.id, strategy = %instance.strategy, "unknown workflow strategy; skipping");
                continue;
            };
            let input: WriteInput = match serde_json::from_str(&instance.input) {
                Ok(input) => input,
                Err(e) => {
                    error!(instance = %instance.id, error = %e, "undecodable workflow input; skipping");
                    continue;
                }
            };
            let history = match self.store.history(&instance.id) {
                Ok(history) => history,
                Err(e) => {
                    error!(instance = %instance.id, error = %e, "unreadable workflow history; skipping");
                    continue;
                }
            };

            info!(instance = %instance.id, strategy = %instance.strategy, "resuming interrupted workflow");
            // Result and final status are recorded by run_instance.
            let _ = self
                .run_instance(instance.id.clone(), strategy, input, history)
                .await;
            resumed += 1;
        }
        resumed
    }
}

pub(crate) fn strategy_name(mode: LockMode) -> &'static str {
    match mode {
        LockMode::Pessimistic => "pessimistic-dual-write",
        LockMode::Optimistic => "optimistic-dual-write",
    }
}

fn parse_strategy(name: &str) -> Option<LockMode> {
    match name {
        "pessimistic-dual-write" => Some(LockMode::Pessimistic),
        "optimistic-dual-write" => Some(LockMode::Optimistic),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names_round_trip() {
        for mode in [LockMode::Pessimistic, LockMode::Optimistic] {
            assert_eq!(parse_strategy(strategy_name(mode)), Some(mode));
        }
        assert_eq!(parse_strategy("unknown"), None);
    }
}
