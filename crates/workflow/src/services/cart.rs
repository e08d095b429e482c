//! Cart collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Sku, UserId};
use tokio::sync::RwLock;

use crate::error::{Result, WorkflowError};

/// Trait for the external cart service.
#[async_trait]
pub trait CartService: Send + Sync {
    /// Removes the given variants from the user's cart.
    async fn remove_items(&self, user_id: &UserId, skus: &[Sku]) -> Result<()>;
}

#[derive(Debug, Default)]
struct InMemoryCartState {
    carts: HashMap<UserId, Vec<Sku>>,
    fail_on_remove: bool,
}

/// In-memory cart service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCartService {
    state: Arc<RwLock<InMemoryCartState>>,
}

impl InMemoryCartService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_item(&self, user_id: &UserId, sku: impl Into<Sku>) {
        self.state
            .write()
            .await
            .carts
            .entry(user_id.clone())
            .or_default()
            .push(sku.into());
    }

    /// Returns the skus currently in the user's cart.
    pub async fn cart(&self, user_id: &UserId) -> Vec<Sku> {
        self.state
            .read()
            .await
            .carts
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_fail_on_remove(&self, fail: bool) {
        self.state.write().await.fail_on_remove = fail;
    }
}

#[async_trait]
impl CartService for InMemoryCartService {
    async fn remove_items(&self, user_id: &UserId, skus: &[Sku]) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_on_remove {
            return Err(WorkflowError::upstream("cart service", "cart unavailable"));
        }
        if let Some(cart) = state.carts.get_mut(user_id) {
            cart.retain(|sku| !skus.contains(sku));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_only_ordered_skus() {
        let carts = InMemoryCartService::new();
        let user = UserId::new("user-1");
        carts.add_item(&user, "A").await;
        carts.add_item(&user, "B").await;

        carts.remove_items(&user, &[Sku::new("A")]).await.unwrap();
        assert_eq!(carts.cart(&user).await, vec![Sku::new("B")]);
    }

    #[tokio::test]
    async fn test_fail_on_remove() {
        let carts = InMemoryCartService::new();
        carts.set_fail_on_remove(true).await;
        assert!(
            carts
                .remove_items(&UserId::new("user-1"), &[])
                .await
                .is_err()
        );
    }
}
