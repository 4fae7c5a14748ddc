//! Activity registry for type-erased activity dispatch

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};

/// Type-erased activity trait for dynamic dispatch
#[async_trait]
pub trait AnyActivity: Send + Sync {
    fn activity_type(&self) -> &'static str;

    async fn execute(&self, ctx: &ActivityContext, payload: Value) -> Result<Value, ActivityError>;

    async fn compensate(&self, ctx: &ActivityContext, payload: Value)
        -> Result<Value, ActivityError>;

    async fn on_failure(&self, ctx: &ActivityContext, error: &ActivityError);
}

struct ActivityWrapper<A: Activity> {
    inner: A,
}

fn decode_input<A: Activity>(payload: Value) -> Result<A::Input, ActivityError> {
    serde_json::from_value(payload).map_err(|e| {
        ActivityError::non_retryable(format!("invalid input for {}: {}", A::TYPE, e))
            .with_type("INVALID_INPUT")
    })
}

#[async_trait]
impl<A: Activity> AnyActivity for ActivityWrapper<A> {
    fn activity_type(&self) -> &'static str {
        A::TYPE
    }

    async fn execute(&self, ctx: &ActivityContext, payload: Value) -> Result<Value, ActivityError> {
        let input = decode_input::<A>(payload)?;
        let output = self.inner.execute(ctx, input).await?;
        serde_json::to_value(output).map_err(|e| {
            ActivityError::non_retryable(format!("failed to encode output of {}: {}", A::TYPE, e))
                .with_type("SERIALIZATION")
        })
    }

    async fn compensate(
        &self,
        ctx: &ActivityContext,
        payload: Value,
    ) -> Result<Value, ActivityError> {
        let input = decode_input::<A>(payload)?;
        self.inner.compensate(ctx, input).await
    }

    async fn on_failure(&self, ctx: &ActivityContext, error: &ActivityError) {
        self.inner.on_failure(ctx, error).await
    }
}

/// Registry of activity implementations keyed by type
#[derive(Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn AnyActivity>>,
}

impl ActivityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity implementation, replacing any previous one of the same type
    pub fn register<A: Activity>(&mut self, activity: A) {
        self.activities
            .insert(A::TYPE.to_string(), Arc::new(ActivityWrapper { inner: activity }));
    }

    pub fn get(&self, activity_type: &str) -> Option<Arc<dyn AnyActivity>> {
        self.activities.get(activity_type).cloned()
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    /// Registered types, sorted
    pub fn activity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.activities.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Serialize, Deserialize)]
    struct Amount {
        cents: u64,
    }

    struct Charge;

    #[async_trait]
    impl Activity for Charge {
        const TYPE: &'static str = "charge";
        type Input = Amount;
        type Output = Amount;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            Ok(input)
        }

        async fn compensate(
            &self,
            _ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Value, ActivityError> {
            Ok(json!({"refunded": input.cents}))
        }
    }

    fn ctx() -> ActivityContext {
        ActivityContext::new(Uuid::now_v7(), 0, "charge", 1, 1)
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let mut registry = ActivityRegistry::new();
        registry.register(Charge);

        assert!(registry.contains("charge"));
        assert_eq!(registry.activity_types(), vec!["charge".to_string()]);

        let activity = registry.get("charge").unwrap();
        let output = activity.execute(&ctx(), json!({"cents": 500})).await.unwrap();
        assert_eq!(output, json!({"cents": 500}));

        let refund = activity.compensate(&ctx(), json!({"cents": 500})).await.unwrap();
        assert_eq!(refund, json!({"refunded": 500}));
    }

    #[tokio::test]
    async fn test_invalid_input_is_not_retryable() {
        let mut registry = ActivityRegistry::new();
        registry.register(Charge);

        let error = registry
            .get("charge")
            .unwrap()
            .execute(&ctx(), json!({"wrong": true}))
            .await
            .unwrap_err();

        assert!(!error.retryable);
        assert_eq!(error.error_type.as_deref(), Some("INVALID_INPUT"));
    }

    #[test]
    fn test_unknown_activity() {
        let registry = ActivityRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("missing").is_none());
    }
}
