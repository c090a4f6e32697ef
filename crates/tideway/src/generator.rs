//! Random cart traffic for demos and load tests

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tideway_core::{error::Result, traits::Appender, types::ResumeToken};
use tracing::info;

use crate::cart::{ActionType, CartAction};

const ITEMS: &[(&str, f64)] = &[
    ("Unisex Socks", 3.75),
    ("Women's Earring", 8.00),
    ("Women's Necklace", 12.00),
    ("Unisex Beanie", 10.00),
    ("Men's Baseball Hat", 17.00),
    ("Unisex Gloves", 20.00),
    ("Women's Flip Flop Shoes", 14.00),
    ("Women's Silver Necklace", 15.50),
    ("Men's Black Tee", 9.00),
    ("Men's Black Hoodie", 25.00),
    ("Women's Blue Sweater", 27.00),
    ("Women's Sweatpants", 21.00),
    ("Men's Athletic Shorts", 22.50),
    ("Women's Athletic Shorts", 22.50),
    ("Women's White Sweater", 32.00),
    ("Women's Green Sweater", 30.00),
    ("Men's Windbreaker Jacket", 49.99),
    ("Women's Sandal", 35.50),
    ("Women's Rainjacket", 55.00),
    ("Women's Denim Shorts", 50.00),
    ("Men's Fleece Jacket", 65.00),
    ("Women's Denim Jacket", 31.99),
    ("Men's Walking Shoes", 79.99),
    ("Women's Crewneck Sweater", 22.00),
    ("Men's Button-Up Shirt", 19.99),
    ("Women's Flannel Shirt", 19.99),
    ("Women's Light Jeans", 80.00),
    ("Men's Jeans", 85.00),
    ("Women's Dark Jeans", 90.00),
    ("Women's Red Top", 33.00),
    ("Men's White Shirt", 25.20),
    ("Women's Pant", 40.00),
    ("Women's Blazer Jacket", 87.50),
    ("Men's Puffy Jacket", 99.99),
    ("Women's Puffy Jacket", 95.99),
    ("Women's Athletic Shoes", 75.00),
    ("Men's Athletic Shoes", 70.00),
    ("Women's Black Dress", 65.00),
    ("Men's Suit Jacket", 92.00),
    ("Men's Suit Pant", 95.00),
    ("Women's High Heel Shoe", 72.00),
    ("Women's Cardigan Sweater", 25.00),
    ("Men's Dress Shoes", 120.00),
    ("Unisex Puffy Jacket", 105.00),
    ("Women's Red Dress", 130.00),
    ("Unisex Scarf", 29.99),
    ("Women's White Dress", 84.99),
    ("Unisex Sandals", 12.00),
    ("Women's Bag", 37.50),
];

const STATES: &[&str] = &[
    "AL", "AK", "AS", "AZ", "AR", "CA", "CO", "CT", "DE", "DC", "FM", "FL", "GA", "GU", "HI", "ID",
    "IL", "IN", "IA", "KS", "KY", "LA", "ME", "MH", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE",
    "NV", "NH", "NJ", "NM", "NY", "NC", "ND", "MP", "OH", "OK", "OR", "PW", "PA", "PR", "RI", "SC",
    "SD", "TN", "TX", "UT", "VT", "VI", "VA", "WA", "WV", "WI", "WY",
];

/// Partition a cart's actions land in; all actions of one cart share it
pub fn partition_for_cart(cart_id: u32, partitions: usize) -> String {
    let mut hasher = DefaultHasher::new();
    cart_id.hash(&mut hasher);
    format!("p{}", hasher.finish() % partitions.max(1) as u64)
}

/// Produces causally ordered cart actions
///
/// Each generated scenario picks one final action for a random cart. A
/// purchase is preceded by a view and an add of the same item; an add is
/// preceded by a view.
pub struct DataGenerator {
    rng: StdRng,
    partitions: usize,
}

impl DataGenerator {
    pub fn new(partitions: usize) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            partitions: partitions.max(1),
        }
    }

    /// Deterministic generator for tests
    pub fn seeded(partitions: usize, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// One scenario: the final action plus the actions leading up to it
    pub fn next_actions(&mut self) -> Vec<CartAction> {
        let (item, price) = ITEMS[self.rng.gen_range(0..ITEMS.len())];
        let state = STATES[self.rng.gen_range(0..STATES.len())];
        let cart_id = self.rng.gen_range(1000..99999);
        let last = match self.rng.gen_range(0..3) {
            0 => ActionType::Viewed,
            1 => ActionType::Added,
            _ => ActionType::Purchased,
        };

        let chain: &[ActionType] = match last {
            ActionType::Viewed => &[ActionType::Viewed],
            ActionType::Added => &[ActionType::Viewed, ActionType::Added],
            ActionType::Purchased => &[
                ActionType::Viewed,
                ActionType::Added,
                ActionType::Purchased,
            ],
        };

        chain
            .iter()
            .map(|action| CartAction::new(cart_id, *action, item, price, state))
            .collect()
    }

    /// Append `scenarios` scenarios to `feed`; returns the number of records
    pub async fn generate(&mut self, feed: &dyn Appender, scenarios: usize) -> Result<usize> {
        let mut written = 0;
        let mut last: Option<ResumeToken> = None;
        for _ in 0..scenarios {
            for action in self.next_actions() {
                let partition = partition_for_cart(action.cart_id, self.partitions);
                last = Some(feed.append(&partition, &action.to_bytes()?).await?);
                written += 1;
            }
        }
        info!(scenarios, records = written, last_token = ?last, "Generated cart actions");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use tideway_core::traits::ChangeFeed;

    #[test]
    fn test_actions_are_causally_ordered() {
        let mut generator = DataGenerator::seeded(3, 7);
        for _ in 0..200 {
            let actions = generator.next_actions();
            let kinds: Vec<ActionType> = actions.iter().map(|a| a.action).collect();
            match kinds.last().copied() {
                Some(ActionType::Viewed) => assert_eq!(kinds, vec![ActionType::Viewed]),
                Some(ActionType::Added) => {
                    assert_eq!(kinds, vec![ActionType::Viewed, ActionType::Added])
                }
                Some(ActionType::Purchased) => assert_eq!(
                    kinds,
                    vec![ActionType::Viewed, ActionType::Added, ActionType::Purchased]
                ),
                None => panic!("empty scenario"),
            }
            assert!(actions.iter().all(|a| a.cart_id == actions[0].cart_id));
            assert!(actions.iter().all(|a| a.item == actions[0].item));
            assert!((1000..99999).contains(&actions[0].cart_id));
        }
    }

    #[test]
    fn test_partition_for_cart_is_stable() {
        assert_eq!(partition_for_cart(4242, 3), partition_for_cart(4242, 3));
        assert_eq!(partition_for_cart(4242, 1), "p0");
        for cart in 1000..1100 {
            let p = partition_for_cart(cart, 3);
            assert!(["p0", "p1", "p2"].contains(&p.as_str()));
        }
    }

    #[tokio::test]
    async fn test_generate_keeps_cart_in_one_partition() {
        let store = InMemoryStore::new();
        let mut generator = DataGenerator::seeded(3, 11);
        let written = generator.generate(&store, 50).await.unwrap();

        let mut total = 0;
        let mut carts: std::collections::HashMap<u32, String> = Default::default();
        for partition in store.list_partitions().await.unwrap() {
            let page = store.fetch_changes(&partition, None, 1000).await.unwrap();
            total += page.batch.len();
            for record in page.batch.records {
                let action = CartAction::from_bytes(&record.payload).unwrap();
                let owner = carts.entry(action.cart_id).or_insert_with(|| partition.clone());
                assert_eq!(*owner, partition);
            }
        }
        assert_eq!(total, written);
        assert!(written >= 50);
    }
}
