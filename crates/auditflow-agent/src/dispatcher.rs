use std::sync::Arc;

use tracing::{error, info};

use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::event::EventBus;
use auditflow_core::types::{Step, StepStatus, TurnEvent};

use crate::step_executor::StepExecutor;

/// One node handed to the dispatcher: the step plus its completed upstream
/// results as (label, text) pairs.
#[derive(Clone)]
pub struct StepDispatch {
    pub step: Step,
    pub upstream: Vec<(String, String)>,
}

/// Terminal state a dispatched node reached.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Draft produced; awaiting the user's approval.
    Review { draft: String },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct WaveReport {
    pub step_id: String,
    pub outcome: StepOutcome,
}

/// Runs one wave of ready steps concurrently.
///
/// Every node gets an `executing` status immediately and a terminal
/// `review`/`error` status once its executor finishes. The dispatcher never
/// marks a step complete — approval is a separate host action that persists
/// the result with `completed = true`.
///
/// Caller precondition: `dispatch` takes exactly one ready frontier, and the
/// planner must be re-run after every approval before the next wave. Waves
/// are never precomputed more than one ahead, because approvals are the only
/// thing that changes readiness.
pub struct WaveDispatcher {
    executor: Arc<StepExecutor>,
    event_bus: Arc<EventBus>,
}

impl WaveDispatcher {
    pub fn new(executor: Arc<StepExecutor>, event_bus: Arc<EventBus>) -> Self {
        Self {
            executor,
            event_bus,
        }
    }

    /// Dispatch one wave; resolves once every node has reached `review` or
    /// `error`. Cross-node event ordering is not defined — consumers key by
    /// step id.
    pub async fn dispatch(&self, wave: Vec<StepDispatch>) -> Result<Vec<WaveReport>> {
        info!(nodes = wave.len(), "Dispatching wave");

        let tasks: Vec<_> = wave
            .into_iter()
            .map(|dispatch| {
                let executor = Arc::clone(&self.executor);
                let bus = Arc::clone(&self.event_bus);
                async move {
                    let step_id = dispatch.step.id.clone();
                    bus.publish(TurnEvent::StepStatus {
                        step_id: step_id.clone(),
                        status: StepStatus::Executing,
                    });

                    match executor.execute(&dispatch.step, &dispatch.upstream).await {
                        Ok(draft) => {
                            bus.publish(TurnEvent::StepStatus {
                                step_id: step_id.clone(),
                                status: StepStatus::Review {
                                    draft: draft.clone(),
                                },
                            });
                            Ok(WaveReport {
                                step_id,
                                outcome: StepOutcome::Review { draft },
                            })
                        }
                        // A stop halts the whole wave; nothing is rolled back.
                        Err(AuditflowError::Cancelled) => Err(AuditflowError::Cancelled),
                        Err(e) => {
                            error!(step_id = %step_id, error = %e, "Step execution failed");
                            bus.publish(TurnEvent::StepStatus {
                                step_id: step_id.clone(),
                                status: StepStatus::Error {
                                    message: e.to_string(),
                                },
                            });
                            Ok(WaveReport {
                                step_id,
                                outcome: StepOutcome::Error {
                                    message: e.to_string(),
                                },
                            })
                        }
                    }
                }
            })
            .collect();

        futures::future::join_all(tasks).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use auditflow_test_utils::ScriptedModel;

    use crate::delegation::HelperAgent;
    use crate::persona::Persona;
    use crate::turn_loop::TurnRouter;

    use super::*;

    struct NullRouter;

    impl TurnRouter for NullRouter {
        fn route(
            &self,
            _call_id: &str,
            name: &str,
            _arguments: serde_json::Value,
        ) -> futures::future::BoxFuture<'_, Result<auditflow_core::types::ToolResult>> {
            let name = name.to_string();
            Box::pin(async move { Err(AuditflowError::ToolNotFound(name)) })
        }
    }

    fn executor(model: Arc<ScriptedModel>, bus: Arc<EventBus>) -> Arc<StepExecutor> {
        let helpers = vec![Arc::new(HelperAgent {
            persona: Persona::new("data_query", "Data Query", "You query data."),
            tools: vec![],
            router: Arc::new(NullRouter),
        })];
        Arc::new(StepExecutor::new(model, helpers, bus))
    }

    fn dispatch_for(step_id: &str) -> StepDispatch {
        StepDispatch {
            step: Step::new(step_id, format!("Step {}", step_id)),
            upstream: vec![],
        }
    }

    #[tokio::test]
    async fn both_nodes_start_before_either_reaches_review() {
        let model = Arc::new(ScriptedModel::new());
        model.push_text("draft one");
        model.push_text("draft two");

        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let dispatcher = WaveDispatcher::new(executor(model, bus.clone()), bus);

        let reports = dispatcher
            .dispatch(vec![dispatch_for("a"), dispatch_for("b")])
            .await
            .unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports
            .iter()
            .all(|r| matches!(r.outcome, StepOutcome::Review { .. })));

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TurnEvent::StepStatus { step_id, status } = event {
                statuses.push((step_id, status));
            }
        }
        // Two independent executing events precede any review event.
        let first_review = statuses
            .iter()
            .position(|(_, s)| matches!(s, StepStatus::Review { .. }))
            .unwrap();
        let executing_before = statuses[..first_review]
            .iter()
            .filter(|(_, s)| *s == StepStatus::Executing)
            .count();
        assert_eq!(executing_before, 2);

        let reviews = statuses
            .iter()
            .filter(|(_, s)| matches!(s, StepStatus::Review { .. }))
            .count();
        assert_eq!(reviews, 2);
    }

    #[tokio::test]
    async fn failed_node_reports_error_and_others_still_review() {
        let model = Arc::new(ScriptedModel::new());
        // Node a draws a model failure, node b a clean draft. The scripted
        // queue is shared, so order the failure first.
        model.push_error("provider down");
        model.push_text("draft b");

        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let dispatcher = WaveDispatcher::new(executor(model, bus.clone()), bus);

        let reports = dispatcher
            .dispatch(vec![dispatch_for("a"), dispatch_for("b")])
            .await
            .unwrap();

        let errors = reports
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Error { .. }))
            .count();
        let reviews = reports
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Review { .. }))
            .count();
        assert_eq!((errors, reviews), (1, 1));

        let mut error_statuses = 0;
        while let Ok(event) = rx.try_recv() {
            if let TurnEvent::StepStatus {
                status: StepStatus::Error { .. },
                ..
            } = event
            {
                error_statuses += 1;
            }
        }
        assert_eq!(error_statuses, 1);
    }

    #[tokio::test]
    async fn empty_wave_is_a_no_op() {
        let model = Arc::new(ScriptedModel::new());
        let bus = Arc::new(EventBus::default());
        let dispatcher = WaveDispatcher::new(executor(model, bus.clone()), bus);
        let reports = dispatcher.dispatch(vec![]).await.unwrap();
        assert!(reports.is_empty());
    }
}
