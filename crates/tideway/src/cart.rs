//! Shopping-cart domain and the per-state sales view

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tideway_core::{
    error::Result,
    types::{Batch, Delta},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::handler::BatchHandler;
use crate::materializer::Materializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Viewed,
    Added,
    Purchased,
}

/// One customer interaction with a cart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartAction {
    pub id: String,
    pub cart_id: u32,
    pub action: ActionType,
    pub item: String,
    pub price: f64,
    pub buyer_state: String,
}

impl CartAction {
    pub fn new(
        cart_id: u32,
        action: ActionType,
        item: impl Into<String>,
        price: f64,
        buyer_state: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cart_id,
            action,
            item: item.into(),
            price,
            buyer_state: buyer_state.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Contribution of this action to its state's sales view
    pub fn sales_delta(&self) -> Delta {
        match self.action {
            ActionType::Purchased => Delta::new(1, self.price),
            ActionType::Viewed | ActionType::Added => Delta::default(),
        }
    }
}

/// Sum the sales deltas of a batch by buyer state
///
/// Records that do not decode as a [`CartAction`] are skipped with a warning.
pub fn sales_by_state(batch: &Batch) -> BTreeMap<String, Delta> {
    let mut by_state: BTreeMap<String, Delta> = BTreeMap::new();
    for record in &batch.records {
        let action = match CartAction::from_bytes(&record.payload) {
            Ok(action) => action,
            Err(e) => {
                warn!(
                    partition_id = %record.partition_id,
                    token = %record.token,
                    error = %e,
                    "Skipping undecodable cart action"
                );
                continue;
            }
        };
        let delta = action.sales_delta();
        if !delta.is_empty() {
            *by_state.entry(action.buyer_state).or_default() += delta;
        }
    }
    by_state
}

/// Maintains purchase count and total sales per buyer state
///
/// States are written concurrently and independently. Transient store errors
/// are absorbed by the [`Materializer`], but if one state's write still fails
/// the batch is retried as a whole and the states already written are counted
/// again, on top of the replay doubling of at-least-once delivery.
pub struct StateSalesHandler {
    materializer: Arc<Materializer>,
}

impl StateSalesHandler {
    pub fn new(materializer: Arc<Materializer>) -> Self {
        Self { materializer }
    }
}

#[async_trait]
impl BatchHandler for StateSalesHandler {
    fn name(&self) -> &str {
        "state-sales"
    }

    async fn handle(&self, batch: &Batch) -> Result<()> {
        let deltas = sales_by_state(batch);
        if deltas.is_empty() {
            return Ok(());
        }
        let updated = self.materializer.apply_batch(deltas).await?;
        debug!(
            partition_id = %batch.partition_id,
            states = updated.len(),
            "Updated state sales"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use tideway_core::types::{ChangeRecord, ResumeToken};

    fn record(token: u64, payload: Vec<u8>) -> ChangeRecord {
        ChangeRecord::new("p0", ResumeToken::new(token), payload)
    }

    fn purchase(state: &str, price: f64) -> Vec<u8> {
        CartAction::new(1234, ActionType::Purchased, "Unisex Socks", price, state)
            .to_bytes()
            .unwrap()
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let action = CartAction::new(42, ActionType::Added, "Men's Jeans", 85.0, "WA");
        let json: serde_json::Value = serde_json::from_slice(&action.to_bytes().unwrap()).unwrap();
        assert_eq!(json["cartId"], 42);
        assert_eq!(json["buyerState"], "WA");
        assert_eq!(json["action"], "Added");
        assert_eq!(CartAction::from_bytes(&action.to_bytes().unwrap()).unwrap(), action);
    }

    #[test]
    fn test_only_purchases_count() {
        let viewed = CartAction::new(1, ActionType::Viewed, "Unisex Scarf", 29.99, "CA")
            .to_bytes()
            .unwrap();
        let batch = Batch::new(
            "p0",
            vec![
                record(1, viewed),
                record(2, purchase("CA", 10.0)),
                record(3, b"not json".to_vec()),
                record(4, purchase("CA", 5.5)),
                record(5, purchase("NY", 3.75)),
            ],
        );

        let by_state = sales_by_state(&batch);
        assert_eq!(by_state.len(), 2);
        assert_eq!(by_state["CA"], Delta::new(2, 15.5));
        assert_eq!(by_state["NY"], Delta::new(1, 3.75));
    }

    #[tokio::test]
    async fn test_handler_updates_views() {
        let materializer = Arc::new(Materializer::new(Arc::new(InMemoryStore::new())));
        let handler = StateSalesHandler::new(materializer.clone());

        let batch = Batch::new("p0", vec![record(1, purchase("TX", 20.0))]);
        handler.handle(&batch).await.unwrap();
        handler.handle(&batch).await.unwrap();

        let view = materializer.read("TX").await.unwrap().unwrap();
        assert_eq!(view.count, 2);
        assert_eq!(view.total, 40.0);
    }

    #[tokio::test]
    async fn test_transient_view_error_does_not_double_count() {
        use crate::dispatch::{DispatchOutcome, DispatchPool};
        use tideway_core::config::DispatchConfig;

        let store = Arc::new(InMemoryStore::new());
        let materializer = Arc::new(Materializer::new(store.clone()));
        let pool = DispatchPool::start(
            &DispatchConfig::new().with_worker_count(1).with_backoff_ms(1, 5),
            Arc::new(StateSalesHandler::new(materializer.clone())),
            store.clone(),
        )
        .unwrap();

        store.fail_next_view_writes(1);
        let batch = Batch::new(
            "p0",
            vec![record(1, purchase("CA", 10.0)), record(2, purchase("NY", 1.0))],
        );
        let outcome = pool.submit(batch).await.unwrap().await.unwrap();
        pool.shutdown().await;

        assert_eq!(outcome, DispatchOutcome::Applied { attempts: 1 });
        assert_eq!(materializer.read("CA").await.unwrap().unwrap().count, 1);
        assert_eq!(materializer.read("NY").await.unwrap().unwrap().count, 1);
    }
}
