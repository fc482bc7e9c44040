use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use auditflow_core::config::AgentConfig;
use auditflow_core::error::Result;
use auditflow_core::event::EventBus;
use auditflow_core::traits::ModelClient;
use auditflow_core::types::{Step, UserContent};

use crate::delegation::{DelegatingRouter, HelperAgent};
use crate::turn_loop::TurnLoop;

const STEP_SYSTEM_PROMPT: &str = "You execute exactly one audit step and produce its \
deliverable. Delegate data lookups to the data_query helper and calculations or log \
analysis to the code_analysis helper. Reply with the finished deliverable text only — \
no preamble, no questions.";

/// Runs one graph step to a draft deliverable.
///
/// The loop it drives is narrowly scoped: its only tool is `delegate`, and
/// every event it emits carries the step's label so the host can show live
/// activity ("this step is querying data") while the draft is still being
/// produced.
pub struct StepExecutor {
    model: Arc<dyn ModelClient>,
    helpers: Vec<Arc<HelperAgent>>,
    event_bus: Arc<EventBus>,
    config: AgentConfig,
    cancel: CancellationToken,
}

impl StepExecutor {
    pub fn new(
        model: Arc<dyn ModelClient>,
        helpers: Vec<Arc<HelperAgent>>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            model,
            helpers,
            event_bus,
            config: AgentConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: &AgentConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Drive the step to a draft result. `upstream` holds the completed
    /// dependency results as (label, text) pairs.
    pub async fn execute(&self, step: &Step, upstream: &[(String, String)]) -> Result<String> {
        info!(step_id = %step.id, label = %step.label, "Executing step");

        let token = self.cancel.child_token();
        let router = Arc::new(
            DelegatingRouter::from_shared(
                self.model.clone(),
                self.helpers.clone(),
                self.event_bus.clone(),
            )
            .with_config(&self.config)
            .with_cancel(token.clone())
            .with_step_label(step.label.clone()),
        );

        // Delegation is the only tool this loop sees.
        let catalog = vec![router.delegate_definition()];

        let turn_loop = TurnLoop::new(
            self.model.clone(),
            STEP_SYSTEM_PROMPT,
            catalog,
            router,
            self.event_bus.clone(),
        )
        .with_config(&self.config)
        .with_cancel(token)
        .with_step_label(step.label.clone());

        let prompt = build_step_prompt(step, upstream);
        let outcome = turn_loop.run(vec![], UserContent::text(prompt)).await?;
        Ok(outcome.text)
    }
}

fn build_step_prompt(step: &Step, upstream: &[(String, String)]) -> String {
    let mut prompt = String::new();

    prompt.push_str("## Step\n\n");
    prompt.push_str(&format!("**{}**", step.label));
    if !step.description.is_empty() {
        prompt.push_str(&format!(": {}", step.description));
    }
    prompt.push('\n');
    if !step.instructions.is_empty() {
        prompt.push_str(&format!("\nInstructions: {}\n", step.instructions));
    }

    if !upstream.is_empty() {
        prompt.push_str("\n## Completed upstream results\n\n");
        for (label, text) in upstream {
            prompt.push_str(&format!("**{}**: {}\n", label, text));
        }
    }

    prompt.push_str("\nProduce exactly the deliverable for this step.");
    prompt
}
