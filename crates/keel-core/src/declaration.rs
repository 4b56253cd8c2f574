//! Workflow declarations and the `declare` builder.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keel_durable::{
    AgentHandler, DurableContext, FnAgentHandler, FnTaskHandler, TaskContext, TaskHandler,
};
use keel_protocols::{
    parse_duration, ConcurrencyPolicy, ConcurrencyStrategy, DurableError, EnqueueOptions,
    HandlerError, Priority, RunError, SubtaskSpec, TaskRun, WorkflowKind,
};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// The handler a declaration dispatches to, by kind.
pub enum HandlerRef {
    /// Tool handler on a plain context.
    Tool(Arc<dyn TaskHandler>),
    /// Agent handler on a durable replay context.
    Agent(Arc<dyn AgentHandler>),
}

/// An immutable, registered workflow: pure function from input to output
/// plus its execution envelope (schemas, timeouts, retries, concurrency).
pub struct WorkflowDeclaration {
    name: String,
    kind: WorkflowKind,
    description: Option<String>,
    input_schema: Option<serde_json::Value>,
    output_schema: Option<serde_json::Value>,
    input_validator: Option<jsonschema::Validator>,
    output_validator: Option<jsonschema::Validator>,
    execution_timeout: Duration,
    schedule_timeout: Duration,
    retries: u32,
    retry_backoff: Duration,
    priority: Priority,
    concurrency: Option<ConcurrencyPolicy>,
    handler: HandlerRef,
}

impl std::fmt::Debug for WorkflowDeclaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDeclaration")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl WorkflowDeclaration {
    /// Declaration name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declaration kind.
    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    /// Human-readable description, used when prompting for tool selection.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Declared input schema.
    pub fn input_schema(&self) -> Option<&serde_json::Value> {
        self.input_schema.as_ref()
    }

    /// The handler this declaration dispatches to.
    pub fn handler(&self) -> &HandlerRef {
        &self.handler
    }

    /// Wall-clock budget for one execution attempt.
    pub fn execution_timeout(&self) -> Duration {
        self.execution_timeout
    }

    /// Validate a payload against the input schema. Violations are
    /// non-retryable: the handler never runs on bad input.
    pub fn validate_input(&self, input: &serde_json::Value) -> Result<(), RunError> {
        Self::validate(self.input_validator.as_ref(), input, "input")
    }

    /// Validate a handler result against the output schema.
    pub fn validate_output(&self, output: &serde_json::Value) -> Result<(), RunError> {
        Self::validate(self.output_validator.as_ref(), output, "output")
    }

    fn validate(
        validator: Option<&jsonschema::Validator>,
        value: &serde_json::Value,
        what: &str,
    ) -> Result<(), RunError> {
        let Some(validator) = validator else {
            return Ok(());
        };
        if validator.is_valid(value) {
            return Ok(());
        }
        let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
        Err(RunError::validation(format!(
            "{what} schema violation: {}",
            errors.join("; ")
        )))
    }

    /// Delay before retry attempt `retry_count + 1`, doubling per attempt.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(16));
        self.retry_backoff.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }

    /// Enqueue parameters for calling this declaration as a subtask.
    pub fn subtask(&self) -> SubtaskSpec {
        SubtaskSpec {
            name: self.name.clone(),
            kind: self.kind,
            max_retries: self.retries,
            priority: self.priority,
            execution_timeout: self.execution_timeout,
            schedule_timeout: self.schedule_timeout,
            concurrency: self.concurrency.clone(),
        }
    }

    /// Build a top-level run of this declaration, applying per-call
    /// overrides on top of the declared defaults.
    pub fn new_run(&self, input: serde_json::Value, opts: &EnqueueOptions) -> TaskRun {
        let concurrency = self.concurrency.as_ref().map(|p| p.resolve(&input));
        let mut run = TaskRun::new(&self.name, self.kind, input)
            .with_priority(opts.priority.unwrap_or(self.priority))
            .with_max_retries(opts.max_retries.unwrap_or(self.retries))
            .with_timeouts(self.execution_timeout, self.schedule_timeout);
        if let Some(at) = opts.scheduled_at {
            run = run.with_scheduled_at(at);
        }
        run.metadata = opts.metadata.clone();
        run.concurrency = concurrency;
        run
    }
}

/// Start declaring a workflow.
pub fn declare(kind: WorkflowKind, name: impl Into<String>) -> DeclarationBuilder {
    DeclarationBuilder {
        name: name.into(),
        kind,
        description: None,
        input_schema: None,
        output_schema: None,
        execution_timeout: None,
        schedule_timeout: None,
        retry_backoff: None,
        retries: 0,
        priority: Priority::Normal,
        concurrency: None,
        handler: None,
    }
}

/// Builder for [`WorkflowDeclaration`]. Duration strings and schemas are
/// parsed and compiled in [`build`](DeclarationBuilder::build); a bad value
/// is a startup error, never a runtime one.
pub struct DeclarationBuilder {
    name: String,
    kind: WorkflowKind,
    description: Option<String>,
    input_schema: Option<serde_json::Value>,
    output_schema: Option<serde_json::Value>,
    execution_timeout: Option<String>,
    schedule_timeout: Option<String>,
    retry_backoff: Option<String>,
    retries: u32,
    priority: Priority,
    concurrency: Option<ConcurrencyPolicy>,
    handler: Option<HandlerRef>,
}

impl DeclarationBuilder {
    /// Human-readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Input JSON Schema.
    pub fn input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Output JSON Schema.
    pub fn output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Input schema generated from a Rust type.
    pub fn input_type<T: schemars::JsonSchema>(self) -> Self {
        let schema = schemars::schema_for!(T);
        self.input_schema(serde_json::to_value(schema).unwrap_or(serde_json::Value::Null))
    }

    /// Output schema generated from a Rust type.
    pub fn output_type<T: schemars::JsonSchema>(self) -> Self {
        let schema = schemars::schema_for!(T);
        self.output_schema(serde_json::to_value(schema).unwrap_or(serde_json::Value::Null))
    }

    /// Execution timeout as a duration string (`"30s"`, `"5m"`).
    pub fn execution_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.execution_timeout = Some(timeout.into());
        self
    }

    /// Schedule timeout as a duration string.
    pub fn schedule_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.schedule_timeout = Some(timeout.into());
        self
    }

    /// Base retry delay as a duration string; doubles per attempt.
    pub fn retry_backoff(mut self, backoff: impl Into<String>) -> Self {
        self.retry_backoff = Some(backoff.into());
        self
    }

    /// Retry budget for handler failures.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Default priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Concurrency bound: at most `max_runs` runs sharing the evaluated
    /// `key_expr` may be running at once.
    pub fn concurrency(
        mut self,
        key_expr: impl Into<String>,
        max_runs: u32,
        strategy: ConcurrencyStrategy,
    ) -> Self {
        self.concurrency = Some(ConcurrencyPolicy {
            key_expr: key_expr.into(),
            max_runs,
            strategy,
        });
        self
    }

    /// Register an async function as the tool handler.
    pub fn tool<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<TaskContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        self.handler = Some(HandlerRef::Tool(Arc::new(FnTaskHandler(f))));
        self
    }

    /// Register an async function as the agent handler.
    pub fn agent<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<DurableContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, DurableError>> + Send + 'static,
    {
        self.handler = Some(HandlerRef::Agent(Arc::new(FnAgentHandler(f))));
        self
    }

    /// Register a tool handler trait object.
    pub fn tool_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(HandlerRef::Tool(handler));
        self
    }

    /// Register an agent handler trait object.
    pub fn agent_handler(mut self, handler: Arc<dyn AgentHandler>) -> Self {
        self.handler = Some(HandlerRef::Agent(handler));
        self
    }

    /// Finish the declaration: parse durations, compile schemas, and check
    /// the handler against the declared kind.
    pub fn build(self) -> Result<WorkflowDeclaration, super::error::CoreError> {
        use super::error::CoreError;

        let parse = |s: Option<String>, default: Duration| -> Result<Duration, CoreError> {
            match s {
                Some(s) => parse_duration(&s).map_err(|source| CoreError::InvalidDuration {
                    name: self.name.clone(),
                    source,
                }),
                None => Ok(default),
            }
        };
        let execution_timeout = parse(self.execution_timeout.clone(), Duration::from_secs(60))?;
        let schedule_timeout = parse(self.schedule_timeout.clone(), Duration::from_secs(300))?;
        let retry_backoff = parse(self.retry_backoff.clone(), Duration::from_secs(5))?;

        let compile = |schema: &Option<serde_json::Value>| -> Result<
            Option<jsonschema::Validator>,
            CoreError,
        > {
            match schema {
                Some(schema) => jsonschema::Validator::new(schema)
                    .map(Some)
                    .map_err(|e| CoreError::InvalidSchema {
                        name: self.name.clone(),
                        message: e.to_string(),
                    }),
                None => Ok(None),
            }
        };
        let input_validator = compile(&self.input_schema)?;
        let output_validator = compile(&self.output_schema)?;

        let handler = self
            .handler
            .ok_or_else(|| CoreError::MissingHandler(self.name.clone()))?;
        let matches = matches!(
            (&handler, self.kind),
            (HandlerRef::Tool(_), WorkflowKind::Tool) | (HandlerRef::Agent(_), WorkflowKind::Agent)
        );
        if !matches {
            return Err(CoreError::KindMismatch(self.name));
        }

        Ok(WorkflowDeclaration {
            name: self.name,
            kind: self.kind,
            description: self.description,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            input_validator,
            output_validator,
            execution_timeout,
            schedule_timeout,
            retries: self.retries,
            retry_backoff,
            priority: self.priority,
            concurrency: self.concurrency,
            handler,
        })
    }
}
