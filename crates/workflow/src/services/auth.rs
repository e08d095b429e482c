//! Auth collaborator: session tokens and customer profiles.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::UserId;
use domain::CustomerInfo;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, WorkflowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Admin,
}

/// An authenticated caller as reported by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn customer(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Customer,
        }
    }

    pub fn admin(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Trait for the external authentication service.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Resolves a bearer token. `None` means the token is unknown or expired.
    async fn authenticate(&self, token: &str) -> Result<Option<Caller>>;

    /// Loads the contact details stored for a registered user.
    async fn profile(&self, user_id: &UserId) -> Result<Option<CustomerInfo>>;
}

#[derive(Debug, Default)]
struct InMemoryAuthState {
    sessions: HashMap<String, Caller>,
    profiles: HashMap<UserId, CustomerInfo>,
    fail_on_profile: bool,
    profile_delay: Option<std::time::Duration>,
}

/// In-memory auth service for tests and database-less runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuthService {
    state: Arc<RwLock<InMemoryAuthState>>,
}

impl InMemoryAuthService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token for `caller`.
    pub async fn add_session(&self, token: impl Into<String>, caller: Caller) {
        self.state
            .write()
            .await
            .sessions
            .insert(token.into(), caller);
    }

    pub async fn add_profile(&self, user_id: UserId, info: CustomerInfo) {
        self.state.write().await.profiles.insert(user_id, info);
    }

    /// Configures profile lookups to fail.
    pub async fn set_fail_on_profile(&self, fail: bool) {
        self.state.write().await.fail_on_profile = fail;
    }

    /// Makes profile lookups sleep before answering.
    pub async fn set_profile_delay(&self, delay: Option<std::time::Duration>) {
        self.state.write().await.profile_delay = delay;
    }
}

#[async_trait]
impl AuthService for InMemoryAuthService {
    async fn authenticate(&self, token: &str) -> Result<Option<Caller>> {
        Ok(self.state.read().await.sessions.get(token).cloned())
    }

    async fn profile(&self, user_id: &UserId) -> Result<Option<CustomerInfo>> {
        let delay = self.state.read().await.profile_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.read().await;
        if state.fail_on_profile {
            return Err(WorkflowError::upstream("auth service", "profile lookup failed"));
        }
        Ok(state.profiles.get(user_id).cloned())
    }
}
