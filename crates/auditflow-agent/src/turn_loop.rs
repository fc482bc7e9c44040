use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use auditflow_core::config::AgentConfig;
use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::event::EventBus;
use auditflow_core::traits::ModelClient;
use auditflow_core::types::*;
use auditflow_tools::ToolRegistry;

/// Routing function injected into a turn loop.
///
/// Implementations convert their own recoverable failures into
/// `ToolResult::error`; anything returned as `Err` is converted by the loop,
/// except `Cancelled`, which aborts the run.
pub trait TurnRouter: Send + Sync + 'static {
    fn route(
        &self,
        call_id: &str,
        name: &str,
        arguments: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolResult>>;
}

/// Routes every call to the tool registry — the datastore path.
pub struct RegistryRouter {
    registry: Arc<ToolRegistry>,
    ctx: ToolContext,
}

impl RegistryRouter {
    pub fn new(registry: Arc<ToolRegistry>, ctx: ToolContext) -> Self {
        Self { registry, ctx }
    }
}

impl TurnRouter for RegistryRouter {
    fn route(
        &self,
        _call_id: &str,
        name: &str,
        arguments: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        let name = name.to_string();
        Box::pin(async move { self.registry.execute(&name, arguments, self.ctx.clone()).await })
    }
}

/// Drives one conversational turn to termination.
///
/// Compose → generate → emit → route, repeated until a generated turn
/// carries no tool call. The conversation log is owned by the loop and only
/// ever appended to. Cancellation is observed at both suspension points: the
/// model call and the router call.
pub struct TurnLoop {
    model: Arc<dyn ModelClient>,
    router: Arc<dyn TurnRouter>,
    system_instruction: String,
    tools: Vec<ToolDefinition>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
    max_turns: usize,
    max_duration: Duration,
    step_label: Option<String>,
}

impl TurnLoop {
    pub fn new(
        model: Arc<dyn ModelClient>,
        system_instruction: impl Into<String>,
        tools: Vec<ToolDefinition>,
        router: Arc<dyn TurnRouter>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let defaults = AgentConfig::default();
        Self {
            model,
            router,
            system_instruction: system_instruction.into(),
            tools,
            event_bus,
            cancel: CancellationToken::new(),
            max_turns: defaults.max_turns,
            max_duration: Duration::from_secs(defaults.max_duration_secs),
            step_label: None,
        }
    }

    pub fn with_config(mut self, config: &AgentConfig) -> Self {
        self.max_turns = config.max_turns;
        self.max_duration = Duration::from_secs(config.max_duration_secs);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Tag activity events with the owning step label (display grouping
    /// only).
    pub fn with_step_label(mut self, label: impl Into<String>) -> Self {
        self.step_label = Some(label.into());
        self
    }

    /// Get a cancellation token for this loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Publish a fatal event and hand back the error. `Cancelled` is not an
    /// error for the event stream — it never goes through here.
    fn fatal(&self, err: AuditflowError) -> AuditflowError {
        self.event_bus.publish(TurnEvent::Fatal {
            error: err.to_string(),
        });
        err
    }

    /// Run one conversational turn: prior history plus new user content.
    pub async fn run(&self, prior_turns: Vec<Turn>, content: UserContent) -> Result<TurnOutcome> {
        let start = Instant::now();

        let mut turns = prior_turns;
        turns.push(content.into_turn());

        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut accumulated = String::new();

        for turn_index in 0..self.max_turns {
            if self.cancel.is_cancelled() {
                return Err(AuditflowError::Cancelled);
            }
            if start.elapsed() > self.max_duration {
                return Err(self.fatal(AuditflowError::MaxDurationExceeded(
                    self.max_duration.as_secs(),
                )));
            }

            debug!(turn = turn_index, "Generating model turn");

            let request = ModelRequest {
                system_instruction: self.system_instruction.clone(),
                tools: self.tools.clone(),
                turns: turns.clone(),
            };

            let generated = tokio::select! {
                result = self.model.generate(request) => result,
                _ = self.cancel.cancelled() => return Err(AuditflowError::Cancelled),
            };

            // A failure in the model call itself is fatal to this loop.
            let response = match generated {
                Ok(r) => r,
                Err(AuditflowError::Cancelled) => return Err(AuditflowError::Cancelled),
                Err(e) => return Err(self.fatal(e)),
            };

            usage.input_tokens += response.usage.input_tokens;
            usage.output_tokens += response.usage.output_tokens;

            // Emit an event per part immediately so a streaming consumer
            // sees partial progress.
            let mut calls: Vec<(String, String, serde_json::Value)> = Vec::new();
            for part in &response.parts {
                match part {
                    ContentPart::Text { text } => {
                        self.event_bus.publish(TurnEvent::Text(text.clone()));
                        if !accumulated.is_empty() {
                            accumulated.push('\n');
                        }
                        accumulated.push_str(text);
                    }
                    ContentPart::ToolCall {
                        id,
                        name,
                        arguments,
                    } => {
                        let mut record = ToolCallRecord::pending(name.clone(), arguments.clone());
                        record.status = ToolCallStatus::Running;
                        record.step_label = self.step_label.clone();
                        records.push(record);

                        self.event_bus.publish(TurnEvent::ToolCallStarted {
                            call_id: id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                            step_label: self.step_label.clone(),
                        });
                        calls.push((id.clone(), name.clone(), arguments.clone()));
                    }
                    ContentPart::CodeArtifact {
                        language, output, ..
                    } => {
                        self.event_bus.publish(TurnEvent::CodeExecutionStarted {
                            language: language.clone(),
                            step_label: self.step_label.clone(),
                        });
                        self.event_bus.publish(TurnEvent::CodeExecutionFinished {
                            language: language.clone(),
                            output: output.clone(),
                            step_label: self.step_label.clone(),
                        });
                    }
                    // Not produced by the model capability.
                    ContentPart::ToolResponse { .. } | ContentPart::InlineData { .. } => {}
                }
            }

            turns.push(Turn::assistant(response.parts.clone()));

            if calls.is_empty() {
                info!(
                    turns = turn_index + 1,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Turn loop complete"
                );
                self.event_bus.publish(TurnEvent::Terminal {
                    text: accumulated.clone(),
                });
                return Ok(TurnOutcome {
                    text: accumulated,
                    tool_calls: records,
                    usage,
                });
            }

            // Route each call sequentially, in call order.
            let record_base = records.len() - calls.len();
            for (offset, (call_id, name, arguments)) in calls.into_iter().enumerate() {
                // A stop between calls prevents any further routing.
                if self.cancel.is_cancelled() {
                    return Err(AuditflowError::Cancelled);
                }

                let routed = tokio::select! {
                    result = self.router.route(&call_id, &name, arguments) => result,
                    _ = self.cancel.cancelled() => return Err(AuditflowError::Cancelled),
                };

                let tool_result = match routed {
                    Ok(r) => r,
                    Err(AuditflowError::Cancelled) => return Err(AuditflowError::Cancelled),
                    // Recoverable: hand the failure back to the model as
                    // data and keep the conversation going.
                    Err(e) => {
                        error!(tool = %name, error = %e, "Tool routing failed");
                        ToolResult::error(e.to_string())
                    }
                };

                records[record_base + offset].finish(&tool_result);
                self.event_bus.publish(TurnEvent::ToolCallFinished {
                    call_id: call_id.clone(),
                    name,
                    result: tool_result.clone(),
                    step_label: self.step_label.clone(),
                });

                turns.push(Turn::tool_response(
                    call_id,
                    tool_result.content,
                    tool_result.is_error,
                ));
            }
        }

        Err(self.fatal(AuditflowError::MaxTurnsExceeded(self.max_turns)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use auditflow_test_utils::{ScriptedModel, StallingModel};
    use serde_json::json;

    use super::*;

    /// Router double that records calls and replies from a queue.
    struct TestRouter {
        calls: Mutex<Vec<String>>,
        replies: Mutex<Vec<Result<ToolResult>>>,
    }

    impl TestRouter {
        fn always_ok() -> Self {
            Self {
                calls: Mutex::new(vec![]),
                replies: Mutex::new(vec![]),
            }
        }

        fn with_replies(replies: Vec<Result<ToolResult>>) -> Self {
            Self {
                calls: Mutex::new(vec![]),
                replies: Mutex::new(replies),
            }
        }

        fn call_names(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TurnRouter for TestRouter {
        fn route(
            &self,
            _call_id: &str,
            name: &str,
            _arguments: serde_json::Value,
        ) -> BoxFuture<'_, Result<ToolResult>> {
            let name = name.to_string();
            Box::pin(async move {
                self.calls.lock().unwrap().push(name.clone());
                let mut replies = self.replies.lock().unwrap();
                if replies.is_empty() {
                    Ok(ToolResult::success(format!("{} ok", name)))
                } else {
                    replies.remove(0)
                }
            })
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn three_chained_tool_calls_emit_three_pairs_in_order() {
        let model = Arc::new(ScriptedModel::new());
        model.push_tool_call("c1", "get_workflow", json!({"workflow": "w"}));
        model.push_tool_call("c2", "get_workflow_progress", json!({"workflow": "w"}));
        model.push_tool_call("c3", "save_step_result", json!({"workflow": "w"}));
        model.push_text("All three done.");

        let router = Arc::new(TestRouter::always_ok());
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();

        let turn_loop = TurnLoop::new(
            model.clone(),
            "You are an audit assistant.",
            vec![],
            router.clone(),
            bus,
        );
        let outcome = turn_loop
            .run(vec![], UserContent::text("check my workflow"))
            .await
            .unwrap();

        assert_eq!(outcome.text, "All three done.");
        assert_eq!(outcome.tool_calls.len(), 3);
        assert_eq!(
            outcome
                .tool_calls
                .iter()
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>(),
            vec!["get_workflow", "get_workflow_progress", "save_step_result"]
        );
        assert!(outcome
            .tool_calls
            .iter()
            .all(|r| r.status == ToolCallStatus::Completed));
        assert_eq!(
            router.call_names(),
            vec!["get_workflow", "get_workflow_progress", "save_step_result"]
        );

        // Event order: started/finished pairs strictly before the terminal.
        let events = drain(&mut rx);
        let mut pairs = Vec::new();
        let mut terminal_seen = false;
        for event in &events {
            match event {
                TurnEvent::ToolCallStarted { call_id, .. } => {
                    assert!(!terminal_seen);
                    pairs.push((call_id.clone(), false));
                }
                TurnEvent::ToolCallFinished { call_id, .. } => {
                    let last = pairs.last_mut().unwrap();
                    assert_eq!(&last.0, call_id, "finished must follow its start");
                    last.1 = true;
                }
                TurnEvent::Terminal { .. } => terminal_seen = true,
                _ => {}
            }
        }
        assert!(terminal_seen);
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|(_, finished)| *finished));
        assert_eq!(
            pairs.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["c1", "c2", "c3"]
        );
    }

    #[tokio::test]
    async fn router_error_is_fed_back_and_loop_continues() {
        let model = Arc::new(ScriptedModel::new());
        model.push_tool_call("c1", "update_workflow", json!({"workflow": "w"}));
        model.push_text("Sorry, that workflow belongs to someone else.");

        let router = Arc::new(TestRouter::with_replies(vec![Err(
            AuditflowError::NotAuthorized("workflow 'w' belongs to another user".into()),
        )]));
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();

        let turn_loop = TurnLoop::new(model, "sys", vec![], router, bus);
        let outcome = turn_loop
            .run(vec![], UserContent::text("rename it"))
            .await
            .unwrap();

        assert!(outcome.text.contains("Sorry"));
        assert_eq!(outcome.tool_calls[0].status, ToolCallStatus::Error);

        let events = drain(&mut rx);
        let finished = events
            .iter()
            .find_map(|e| match e {
                TurnEvent::ToolCallFinished { result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap();
        assert!(finished.is_error);
        assert!(finished.content.contains("Not authorized"));
    }

    #[tokio::test]
    async fn model_failure_is_fatal_with_single_event() {
        let model = Arc::new(ScriptedModel::new());
        model.push_error("upstream 500");

        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let turn_loop = TurnLoop::new(
            model,
            "sys",
            vec![],
            Arc::new(TestRouter::always_ok()),
            bus,
        );

        let err = turn_loop
            .run(vec![], UserContent::text("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditflowError::ModelCallFailed(_)));

        let events = drain(&mut rx);
        let fatals = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::Fatal { .. }))
            .count();
        assert_eq!(fatals, 1);
        assert!(!events.iter().any(|e| matches!(e, TurnEvent::Terminal { .. })));
    }

    #[tokio::test]
    async fn code_artifacts_emit_start_and_finish() {
        let model = Arc::new(ScriptedModel::new());
        model.push_parts(vec![
            ContentPart::CodeArtifact {
                language: "python".into(),
                code: "print(1+1)".into(),
                output: Some("2".into()),
            },
            ContentPart::Text {
                text: "The answer is 2.".into(),
            },
        ]);

        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let turn_loop = TurnLoop::new(
            model,
            "sys",
            vec![],
            Arc::new(TestRouter::always_ok()),
            bus,
        );

        turn_loop
            .run(vec![], UserContent::text("compute"))
            .await
            .unwrap();

        let events = drain(&mut rx);
        let started = events
            .iter()
            .position(|e| matches!(e, TurnEvent::CodeExecutionStarted { .. }))
            .unwrap();
        let finished = events
            .iter()
            .position(|e| matches!(e, TurnEvent::CodeExecutionFinished { .. }))
            .unwrap();
        assert!(started < finished);
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_model_call() {
        let bus = Arc::new(EventBus::default());
        let turn_loop = Arc::new(TurnLoop::new(
            Arc::new(StallingModel),
            "sys",
            vec![],
            Arc::new(TestRouter::always_ok()) as Arc<dyn TurnRouter>,
            bus,
        ));
        let cancel = turn_loop.cancel_token();

        let handle = {
            let turn_loop = turn_loop.clone();
            tokio::spawn(async move { turn_loop.run(vec![], UserContent::text("hi")).await })
        };

        tokio::task::yield_now().await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, AuditflowError::Cancelled));
    }

    #[tokio::test]
    async fn exhausting_max_turns_is_fatal() {
        let model = Arc::new(ScriptedModel::new());
        // Always answers with another tool call.
        for i in 0..4 {
            model.push_tool_call(&format!("c{}", i), "get_workflow", json!({"workflow": "w"}));
        }

        let bus = Arc::new(EventBus::default());
        let config = AgentConfig {
            max_turns: 2,
            ..AgentConfig::default()
        };
        let turn_loop = TurnLoop::new(
            model,
            "sys",
            vec![],
            Arc::new(TestRouter::always_ok()),
            bus,
        )
        .with_config(&config);

        let err = turn_loop
            .run(vec![], UserContent::text("loop forever"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditflowError::MaxTurnsExceeded(2)));
    }
}
