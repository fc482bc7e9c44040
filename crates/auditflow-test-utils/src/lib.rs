//! Test doubles for the model capability plus workflow fixtures.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::traits::ModelClient;
use auditflow_core::types::*;

enum ScriptEntry {
    Respond(Result<ModelResponse>),
    /// Never resolves — the call parks until cancelled.
    Stall,
}

/// A model client that replays a queued script of responses.
///
/// Each `generate` call yields once to the scheduler (so concurrent loops
/// interleave the way a network client would) and then pops the next entry;
/// an exhausted script fails the call so a runaway loop surfaces as a test
/// failure instead of a hang.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<ScriptEntry>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a response made of raw parts.
    pub fn push_parts(&self, parts: Vec<ContentPart>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(ScriptEntry::Respond(Ok(ModelResponse {
                parts,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })));
    }

    /// Enqueue a plain-text terminal response.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push_parts(vec![ContentPart::Text { text: text.into() }]);
    }

    /// Enqueue a response containing a single tool call.
    pub fn push_tool_call(&self, id: &str, name: &str, arguments: serde_json::Value) {
        self.push_parts(vec![ContentPart::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }]);
    }

    /// Enqueue a model failure.
    pub fn push_error(&self, message: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(ScriptEntry::Respond(Err(AuditflowError::ModelCallFailed(
                message.into(),
            ))));
    }

    /// Enqueue a call that never resolves, for cancellation tests.
    pub fn push_stall(&self) {
        self.responses.lock().unwrap().push_back(ScriptEntry::Stall);
    }

    /// Requests recorded so far, in call order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelClient for ScriptedModel {
    fn generate(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.requests.lock().unwrap().push(request);
            let entry = self.responses.lock().unwrap().pop_front();
            match entry {
                Some(ScriptEntry::Respond(response)) => response,
                Some(ScriptEntry::Stall) => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                None => Err(AuditflowError::ModelCallFailed(
                    "scripted model exhausted".into(),
                )),
            }
        })
    }
}

/// A model client whose calls never resolve — for cancellation tests.
pub struct StallingModel;

impl ModelClient for StallingModel {
    fn generate(&self, _request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        Box::pin(async move {
            futures::future::pending::<()>().await;
            unreachable!()
        })
    }
}

/// A workflow where C depends on both A and B (fan-in).
pub fn fan_in_workflow(user: &str) -> Workflow {
    let mut wf = Workflow::new(UserId::from_str(user), "fan-in", "Fan-in Review");
    wf.steps.push(Step::new("a", "Gather logs"));
    wf.steps.push(Step::new("b", "Gather configs"));
    wf.steps
        .push(Step::new("c", "Correlate findings").with_instructions("compare a and b"));
    wf.dependencies.push(Dependency::new("a", "c"));
    wf.dependencies.push(Dependency::new("b", "c"));
    wf
}

/// A strictly linear three-step workflow.
pub fn chain_workflow(user: &str) -> Workflow {
    let mut wf = Workflow::new(UserId::from_str(user), "chain", "Chained Review");
    wf.steps.push(Step::new("one", "First"));
    wf.steps.push(Step::new("two", "Second"));
    wf.steps.push(Step::new("three", "Third"));
    wf.dependencies.push(Dependency::new("one", "two"));
    wf.dependencies.push(Dependency::new("two", "three"));
    wf
}
