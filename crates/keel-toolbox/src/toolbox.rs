//! Model-driven tool selection and execution.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use keel_core::{Client, CoreError, WorkflowDeclaration};
use keel_protocols::{EnqueueOptions, SelectionError, WorkflowKind};

use crate::error::ToolboxError;
use crate::provider::{GenerateRequest, LlmProvider};
use crate::result::ToolResult;
use crate::selection::{SelectionResponse, ToolSelection};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Prompts a model to choose among registered tools, validates what comes
/// back, and optionally executes the choices.
///
/// The model is untrusted: every response is parsed, checked against the
/// tool catalog, and its arguments validated against the chosen tool's
/// input schema. A rejected response is re-prompted with the rejection
/// reason, up to a bounded number of attempts.
pub struct Toolbox {
    client: Client,
    provider: Arc<dyn LlmProvider>,
    tools: Vec<Arc<WorkflowDeclaration>>,
    max_attempts: u32,
}

impl std::fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolbox")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Toolbox {
    /// Build a toolbox over every tool declaration in the client's
    /// registry. Agents are never selectable.
    pub fn new(client: Client, provider: Arc<dyn LlmProvider>) -> Self {
        let mut tools: Vec<Arc<WorkflowDeclaration>> = client
            .registry()
            .declarations()
            .filter(|d| d.kind() == WorkflowKind::Tool)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        Self {
            client,
            provider,
            tools,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Restrict the selectable tools to the named subset.
    pub fn restricted_to(mut self, names: &[&str]) -> Result<Self, ToolboxError> {
        let mut tools = Vec::with_capacity(names.len());
        for name in names {
            let decl = self
                .client
                .registry()
                .get(name)
                .ok_or_else(|| CoreError::UnknownDeclaration(name.to_string()))?;
            if decl.kind() != WorkflowKind::Tool {
                return Err(ToolboxError::NotATool(name.to_string()));
            }
            tools.push(decl);
        }
        self.tools = tools;
        Ok(self)
    }

    /// Selection attempt budget, counting provider failures and rejected
    /// responses alike.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Names of the selectable tools.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|d| d.name()).collect()
    }

    /// Ask the model to select up to `max_tools` tools for the task.
    ///
    /// Returned selections are deduplicated by tool name, validated against
    /// each tool's input schema, and capped at `max_tools`.
    pub async fn pick(
        &self,
        prompt: &str,
        max_tools: usize,
    ) -> Result<Vec<ToolSelection>, SelectionError> {
        let schema = self.selection_schema(max_tools);
        let base = self.selection_prompt(prompt, max_tools);
        let mut last_error: Option<String> = None;

        for attempt in 1..=self.max_attempts {
            let full_prompt = match &last_error {
                None => base.clone(),
                Some(reason) => format!(
                    "{base}\n\nYour previous response was rejected: {reason}\n\
                     Respond again with only valid JSON."
                ),
            };

            let response = match self
                .provider
                .generate(GenerateRequest {
                    prompt: full_prompt,
                    schema: schema.clone(),
                })
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("selection attempt {} provider call failed: {}", attempt, e);
                    last_error = Some(e.to_string());
                    continue;
                }
            };

            match self.parse_selections(&response.content, max_tools) {
                Ok(selections) => return Ok(selections),
                Err(e) => {
                    debug!("selection attempt {} rejected: {}", attempt, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(SelectionError::AttemptsExhausted {
            attempts: self.max_attempts,
            last_error: last_error.unwrap_or_default(),
        })
    }

    /// Select one tool and run it to completion.
    pub async fn pick_and_run(&self, prompt: &str) -> Result<ToolResult, ToolboxError> {
        let mut selections = self.pick(prompt, 1).await?;
        let selection = selections.swap_remove(0);
        self.execute(selection).await
    }

    /// Select up to `max_tools` tools and run each to completion, in
    /// selection order. The first execution failure aborts the rest.
    pub async fn pick_and_run_many(
        &self,
        prompt: &str,
        max_tools: usize,
    ) -> Result<Vec<ToolResult>, ToolboxError> {
        let selections = self.pick(prompt, max_tools).await?;
        let mut results = Vec::with_capacity(selections.len());
        for selection in selections {
            results.push(self.execute(selection).await?);
        }
        Ok(results)
    }

    async fn execute(&self, selection: ToolSelection) -> Result<ToolResult, ToolboxError> {
        let output = self
            .client
            .run(
                &selection.name,
                selection.args.clone(),
                EnqueueOptions::default(),
            )
            .await?;
        Ok(ToolResult {
            name: selection.name,
            args: selection.args,
            output,
        })
    }

    fn parse_selections(
        &self,
        content: &str,
        max_tools: usize,
    ) -> Result<Vec<ToolSelection>, SelectionError> {
        let parsed: SelectionResponse =
            serde_json::from_str(content).map_err(|e| SelectionError::Unparseable(e.to_string()))?;
        if parsed.selections.is_empty() {
            return Err(SelectionError::NoSelection);
        }

        let mut seen = HashSet::new();
        let mut selections = Vec::new();
        for selection in parsed.selections {
            if !seen.insert(selection.name.clone()) {
                continue;
            }
            let decl = self
                .tools
                .iter()
                .find(|d| d.name() == selection.name)
                .ok_or_else(|| SelectionError::UnknownTool(selection.name.clone()))?;
            decl.validate_input(&selection.args)
                .map_err(|e| SelectionError::InvalidArguments {
                    name: selection.name.clone(),
                    message: e.message,
                })?;
            selections.push(selection);
            if selections.len() == max_tools {
                break;
            }
        }
        Ok(selections)
    }

    fn selection_prompt(&self, prompt: &str, max_tools: usize) -> String {
        let mut catalog = String::new();
        for decl in &self.tools {
            catalog.push_str(&format!(
                "- {}: {}\n  input schema: {}\n",
                decl.name(),
                decl.description().unwrap_or("(no description)"),
                decl.input_schema()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "{}".to_string()),
            ));
        }
        format!(
            "You select tools to accomplish a task.\n\nAvailable tools:\n{catalog}\n\
             Task: {prompt}\n\n\
             Select at most {max_tools} tool(s). Respond with a single JSON object of \
             the form {{\"selections\": [{{\"name\": ..., \"args\": ...}}]}} where each \
             \"args\" satisfies the chosen tool's input schema."
        )
    }

    fn selection_schema(&self, max_tools: usize) -> serde_json::Value {
        let names: Vec<&str> = self.tools.iter().map(|d| d.name()).collect();
        json!({
            "type": "object",
            "properties": {
                "selections": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": max_tools,
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string", "enum": names},
                            "args": {"type": "object"}
                        },
                        "required": ["name", "args"]
                    }
                }
            },
            "required": ["selections"]
        })
    }
}
