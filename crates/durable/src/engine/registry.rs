//! Workflow registry for type-erased workflow execution
//!
//! Definitions are keyed by `(type, version)` so instances pinned to an older
//! version keep replaying against the code that started them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::workflow::{Workflow, WorkflowContext, WorkflowError, WorkflowSignal, WorkflowState};

/// Type-erased workflow interface
///
/// This trait allows the engine to drive workflows without knowing their
/// concrete types. Input and output cross it as JSON.
pub trait AnyWorkflow: Send + Sync {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &'static str;

    /// Definition version
    fn version(&self) -> u32;

    /// Run the body with JSON input
    fn run(&self, ctx: WorkflowContext, input: Value) -> BoxFuture<'_, Result<Value, WorkflowError>>;

    /// Fold a received signal into replay state
    fn handle_signal(&self, state: &mut WorkflowState, signal: &WorkflowSignal);
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn version(&self) -> u32 {
        W::VERSION
    }

    fn run(&self, ctx: WorkflowContext, input: Value) -> BoxFuture<'_, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let input: W::Input = serde_json::from_value(input).map_err(|e| {
                WorkflowError::new(format!("invalid workflow input: {e}")).with_code("INVALID_INPUT")
            })?;
            let output = self.inner.execute(ctx, input).await?;
            Ok(serde_json::to_value(output)?)
        })
    }

    fn handle_signal(&self, state: &mut WorkflowState, signal: &WorkflowSignal) {
        self.inner.handle_signal(state, signal)
    }
}

/// Registry of workflow definitions
pub struct WorkflowRegistry {
    definitions: HashMap<(String, u32), Arc<dyn AnyWorkflow>>,
    latest: HashMap<String, u32>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
            latest: HashMap::new(),
        }
    }

    /// Register a workflow definition under its type and version
    ///
    /// Registering two versions of the same type keeps both; new instances
    /// start on the highest one.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register(OnboardingV1);
    /// registry.register(OnboardingV2);
    /// ```
    pub fn register<W: Workflow>(&mut self, workflow: W) {
        let version = W::VERSION;
        self.definitions.insert(
            (W::TYPE.to_string(), version),
            Arc::new(WorkflowWrapper { inner: workflow }),
        );

        let latest = self.latest.entry(W::TYPE.to_string()).or_insert(version);
        if *latest < version {
            *latest = version;
        }
    }

    /// Definition for an exact version
    pub fn get(&self, workflow_type: &str, version: u32) -> Result<Arc<dyn AnyWorkflow>, RegistryError> {
        if !self.latest.contains_key(workflow_type) {
            return Err(RegistryError::UnknownWorkflowType(workflow_type.to_string()));
        }
        self.definitions
            .get(&(workflow_type.to_string(), version))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownVersion {
                workflow_type: workflow_type.to_string(),
                version,
            })
    }

    /// Highest registered version of a type
    pub fn latest(&self, workflow_type: &str) -> Result<Arc<dyn AnyWorkflow>, RegistryError> {
        let version = self
            .latest
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;
        self.get(workflow_type, *version)
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.latest.contains_key(workflow_type)
    }

    /// Get the number of registered definitions (all versions)
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.latest.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut definitions: Vec<_> = self.definitions.keys().collect();
        definitions.sort();
        f.debug_struct("WorkflowRegistry")
            .field("definitions", &definitions)
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Type is registered but not at this version
    #[error("workflow type {workflow_type} has no registered version {version}")]
    UnknownVersion { workflow_type: String, version: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestInput {
        value: i32,
    }

    struct TestWorkflow;

    #[async_trait]
    impl Workflow for TestWorkflow {
        const TYPE: &'static str = "test_workflow";
        type Input = TestInput;
        type Output = i32;

        async fn execute(
            &self,
            _ctx: WorkflowContext,
            input: Self::Input,
        ) -> Result<Self::Output, WorkflowError> {
            Ok(input.value * 2)
        }
    }

    struct TestWorkflowV2;

    #[async_trait]
    impl Workflow for TestWorkflowV2 {
        const TYPE: &'static str = "test_workflow";
        const VERSION: u32 = 2;
        type Input = TestInput;
        type Output = i32;

        async fn execute(
            &self,
            _ctx: WorkflowContext,
            input: Self::Input,
        ) -> Result<Self::Output, WorkflowError> {
            Ok(input.value * 3)
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = WorkflowRegistry::new();
        registry.register(TestWorkflow);

        assert!(registry.contains("test_workflow"));
        assert!(!registry.contains("unknown"));

        let workflow = registry.get("test_workflow", 1).unwrap();
        assert_eq!(workflow.workflow_type(), "test_workflow");
        assert_eq!(workflow.version(), 1);
    }

    #[test]
    fn test_latest_version_wins_for_new_instances() {
        let mut registry = WorkflowRegistry::new();
        registry.register(TestWorkflowV2);
        registry.register(TestWorkflow);

        assert_eq!(registry.latest("test_workflow").unwrap().version(), 2);
        assert_eq!(registry.get("test_workflow", 1).unwrap().version(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unknown_type_and_version() {
        let mut registry = WorkflowRegistry::new();
        assert!(matches!(
            registry.latest("unknown"),
            Err(RegistryError::UnknownWorkflowType(_))
        ));

        registry.register(TestWorkflow);
        assert!(matches!(
            registry.get("test_workflow", 7),
            Err(RegistryError::UnknownVersion { version: 7, .. })
        ));
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = WorkflowRegistry::new();
        registry.register(TestWorkflow);

        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("test_workflow"));
    }

    #[test]
    fn test_workflow_types_iterator() {
        let mut registry = WorkflowRegistry::new();
        registry.register(TestWorkflow);
        registry.register(TestWorkflowV2);

        let types: Vec<_> = registry.workflow_types().collect();
        assert_eq!(types, vec!["test_workflow"]);
    }
}
