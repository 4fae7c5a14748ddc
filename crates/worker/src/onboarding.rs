// Demo onboarding workflow
//
// Create the user record, send a welcome email, wait three days, send a
// follow-up. The activities only log; swap them for real implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use steadfast_durable::prelude::*;
use uuid::Uuid;

/// How long to wait between the welcome and follow-up emails
pub const FOLLOW_UP_DELAY: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewUser {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: String,
}

// ============================================================================
// Activities
// ============================================================================

pub struct CreateUserRecord;

#[async_trait]
impl Activity for CreateUserRecord {
    const TYPE: &'static str = "create_user_record";
    type Input = NewUser;
    type Output = UserRecord;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: NewUser,
    ) -> Result<UserRecord, ActivityError> {
        let id = Uuid::now_v7().to_string();
        tracing::info!(
            user_id = %id,
            email = %input.email,
            idempotency_key = %ctx.idempotency_key(),
            "created user record"
        );
        Ok(UserRecord {
            id,
            email: input.email,
            name: input.name,
        })
    }

    async fn compensate(
        &self,
        _ctx: &ActivityContext,
        input: NewUser,
    ) -> Result<serde_json::Value, ActivityError> {
        tracing::info!(email = %input.email, "deleted user record");
        Ok(serde_json::Value::Null)
    }
}

pub struct SendWelcomeEmail;

#[async_trait]
impl Activity for SendWelcomeEmail {
    const TYPE: &'static str = "send_welcome_email";
    type Input = UserRecord;
    type Output = ();

    async fn execute(&self, ctx: &ActivityContext, user: UserRecord) -> Result<(), ActivityError> {
        tracing::info!(user_id = %user.id, email = %user.email, attempt = ctx.attempt, "sent welcome email");
        Ok(())
    }
}

pub struct SendFollowUpEmail;

#[async_trait]
impl Activity for SendFollowUpEmail {
    const TYPE: &'static str = "send_follow_up_email";
    type Input = UserRecord;
    type Output = ();

    async fn execute(&self, ctx: &ActivityContext, user: UserRecord) -> Result<(), ActivityError> {
        tracing::info!(user_id = %user.id, email = %user.email, attempt = ctx.attempt, "sent follow-up email");
        Ok(())
    }
}

// ============================================================================
// Workflow
// ============================================================================

pub struct Onboarding;

#[async_trait]
impl Workflow for Onboarding {
    const TYPE: &'static str = "onboarding";
    type Input = NewUser;
    type Output = String;

    async fn execute(&self, ctx: WorkflowContext, input: NewUser) -> Result<String, WorkflowError> {
        let user = ctx.activity::<CreateUserRecord>(input).await?;
        ctx.activity::<SendWelcomeEmail>(user.clone()).await?;
        ctx.sleep(FOLLOW_UP_DELAY).await;
        ctx.activity::<SendFollowUpEmail>(user.clone()).await?;
        Ok(format!("Onboarding complete for user: {}", user.id))
    }
}

/// Register the demo workflow with an engine
pub fn register_workflows<S: HistoryStore>(engine: &mut WorkflowEngine<S>) {
    engine.register(Onboarding);
}

/// Registry with the demo activities
pub fn activity_registry() -> ActivityRegistry {
    let mut registry = ActivityRegistry::new();
    registry.register(CreateUserRecord);
    registry.register(SendWelcomeEmail);
    registry.register(SendFollowUpEmail);
    registry
}
