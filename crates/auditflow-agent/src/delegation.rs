use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use auditflow_core::config::AgentConfig;
use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::event::EventBus;
use auditflow_core::traits::ModelClient;
use auditflow_core::types::*;
use auditflow_tools::ToolRegistry;

use crate::persona::Persona;
use crate::turn_loop::{RegistryRouter, TurnLoop, TurnRouter};

/// Reserved tool name for delegation.
pub const DELEGATE_TOOL: &str = "delegate";

/// Routing decision for one tool call, resolved exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Datastore,
    Delegate,
}

pub fn resolve(name: &str) -> RouteTarget {
    if name == DELEGATE_TOOL {
        RouteTarget::Delegate
    } else {
        RouteTarget::Datastore
    }
}

/// An instantiated helper: persona plus its tool catalog and router.
///
/// Helpers are built from the datastore registry only — the delegate tool is
/// added to catalogs by `DelegatingRouter::catalog` alone, so a helper's
/// catalog structurally cannot contain it. That enforces one-level
/// delegation by construction rather than convention.
pub struct HelperAgent {
    pub persona: Persona,
    pub tools: Vec<ToolDefinition>,
    pub router: Arc<dyn TurnRouter>,
}

impl HelperAgent {
    pub fn from_persona(
        persona: Persona,
        registry: Arc<ToolRegistry>,
        ctx: ToolContext,
    ) -> Self {
        let tools = registry.definitions_for(&persona.tools);
        let router = Arc::new(RegistryRouter::new(registry, ctx));
        Self {
            persona,
            tools,
            router,
        }
    }
}

#[derive(Deserialize)]
struct DelegateInput {
    target: String,
    task: String,
}

/// Router wrapper that intercepts the reserved `delegate` call and spawns a
/// helper loop for it; everything else goes to the datastore router.
///
/// Helper tool/code events are forwarded inline to the parent's stream while
/// the helper's text is accumulated into a single synthesized function
/// response. Cancelling the parent cancels any in-flight helper via a child
/// token.
pub struct DelegatingRouter {
    model: Arc<dyn ModelClient>,
    datastore: Option<Arc<dyn TurnRouter>>,
    helpers: HashMap<String, Arc<HelperAgent>>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
    agent_config: AgentConfig,
    step_label: Option<String>,
}

impl DelegatingRouter {
    pub fn new(
        model: Arc<dyn ModelClient>,
        helpers: Vec<HelperAgent>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self::from_shared(
            model,
            helpers.into_iter().map(Arc::new).collect(),
            event_bus,
        )
    }

    /// Build from already-shared helpers, e.g. one pool reused across
    /// concurrently executing steps.
    pub fn from_shared(
        model: Arc<dyn ModelClient>,
        helpers: Vec<Arc<HelperAgent>>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let helpers = helpers
            .into_iter()
            .map(|h| (h.persona.id.clone(), h))
            .collect();
        Self {
            model,
            datastore: None,
            helpers,
            event_bus,
            cancel: CancellationToken::new(),
            agent_config: AgentConfig::default(),
            step_label: None,
        }
    }

    /// Route non-delegate calls to this router. Without one, any
    /// non-delegate call is reported back as an unknown tool.
    pub fn with_datastore(mut self, router: Arc<dyn TurnRouter>) -> Self {
        self.datastore = Some(router);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_config(mut self, config: &AgentConfig) -> Self {
        self.agent_config = config.clone();
        self
    }

    pub fn with_step_label(mut self, label: impl Into<String>) -> Self {
        self.step_label = Some(label.into());
        self
    }

    /// The delegate tool definition, with the allow-list baked into the
    /// schema.
    pub fn delegate_definition(&self) -> ToolDefinition {
        let mut targets: Vec<&str> = self.helpers.keys().map(|k| k.as_str()).collect();
        targets.sort();
        ToolDefinition {
            name: DELEGATE_TOOL.to_string(),
            description: "Hand a sub-task to a specialized helper agent and get its \
                          result back as text."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "target": {
                        "type": "string",
                        "enum": targets,
                        "description": "Helper to delegate to"
                    },
                    "task": {
                        "type": "string",
                        "description": "The sub-task, phrased as a complete instruction"
                    }
                },
                "required": ["target", "task"]
            }),
        }
    }

    /// Parent-facing catalog: the datastore definitions plus `delegate`.
    pub fn catalog(&self, datastore_definitions: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
        let mut defs = datastore_definitions;
        defs.push(self.delegate_definition());
        defs
    }

    async fn delegate(&self, arguments: serde_json::Value) -> Result<ToolResult> {
        let input: DelegateInput = serde_json::from_value(arguments)
            .map_err(|e| AuditflowError::InvalidArgument(e.to_string()))?;

        let Some(helper) = self.helpers.get(&input.target) else {
            // Recoverable — the parent model may retry with a valid target.
            let mut known: Vec<&str> = self.helpers.keys().map(|k| k.as_str()).collect();
            known.sort();
            warn!(target = %input.target, "Delegate target not in allow-list");
            return Ok(ToolResult::error(format!(
                "Unknown helper '{}'. Available helpers: {}",
                input.target,
                known.join(", ")
            )));
        };

        info!(target = %helper.persona.id, "Delegating sub-task");
        self.event_bus.publish(TurnEvent::DelegationStarted {
            target: helper.persona.id.clone(),
            step_label: self.step_label.clone(),
        });

        // The helper publishes to its own bus; tool/code activity is
        // forwarded inline, text stays private and comes back as the
        // synthesized function response.
        let child_bus = Arc::new(EventBus::new(self.agent_config.event_capacity));
        let mut activity = child_bus.subscribe();

        let mut child = TurnLoop::new(
            self.model.clone(),
            helper.persona.system_instruction.clone(),
            helper.tools.clone(),
            helper.router.clone(),
            child_bus,
        )
        .with_config(&self.agent_config)
        .with_cancel(self.cancel.child_token());
        if let Some(ref label) = self.step_label {
            child = child.with_step_label(label.clone());
        }

        let task = input.task;
        let run = async move { child.run(vec![], UserContent::text(task)).await };
        let forward = async {
            loop {
                match activity.recv().await {
                    Ok(event) if event.is_activity() => self.event_bus.publish(event),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Helper event stream lagged");
                    }
                }
            }
        };

        let (outcome, _) = tokio::join!(run, forward);

        match outcome {
            Ok(result) => {
                self.event_bus.publish(TurnEvent::DelegationFinished {
                    target: helper.persona.id.clone(),
                    succeeded: true,
                    step_label: self.step_label.clone(),
                });
                Ok(ToolResult::success(format!("result: {}", result.text)))
            }
            // The parent is being torn down too; don't mask it as a tool
            // failure.
            Err(AuditflowError::Cancelled) => Err(AuditflowError::Cancelled),
            Err(e) => {
                self.event_bus.publish(TurnEvent::DelegationFinished {
                    target: helper.persona.id.clone(),
                    succeeded: false,
                    step_label: self.step_label.clone(),
                });
                Ok(ToolResult::error(format!("error: {}", e)))
            }
        }
    }
}

impl TurnRouter for DelegatingRouter {
    fn route(
        &self,
        call_id: &str,
        name: &str,
        arguments: serde_json::Value,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        let call_id = call_id.to_string();
        let name = name.to_string();
        Box::pin(async move {
            match resolve(&name) {
                RouteTarget::Delegate => self.delegate(arguments).await,
                RouteTarget::Datastore => match self.datastore {
                    Some(ref router) => router.route(&call_id, &name, arguments).await,
                    None => Err(AuditflowError::ToolNotFound(name)),
                },
            }
        })
    }
}
