//! Account balance store.
//!
//! The venue always sends complete balance snapshots, so the whole map is
//! replaced atomically on every update. No incremental merge.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::models::AssetBalance;

#[derive(Default)]
pub struct AccountStore {
    inner: RwLock<HashMap<String, AssetBalance>>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire balance set with a fresh snapshot.
    pub fn replace(&self, balances: Vec<AssetBalance>) {
        let map = balances
            .into_iter()
            .map(|b| (b.asset.clone(), b))
            .collect();
        *self.inner.write() = map;
    }

    pub fn get(&self, asset: &str) -> Option<AssetBalance> {
        self.inner.read().get(asset).cloned()
    }

    pub fn snapshot(&self) -> Vec<AssetBalance> {
        let mut balances: Vec<AssetBalance> = self.inner.read().values().cloned().collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        balances
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance(asset: &str, free: f64, locked: f64) -> AssetBalance {
        AssetBalance {
            asset: asset.to_string(),
            free,
            locked,
        }
    }

    #[test]
    fn replace_is_wholesale() {
        let store = AccountStore::new();
        store.replace(vec![balance("BTC", 1.0, 0.0), balance("USDT", 500.0, 20.0)]);
        assert_eq!(store.get("BTC").unwrap().free, 1.0);

        // A later snapshot without BTC drops it entirely.
        store.replace(vec![balance("USDT", 480.0, 0.0)]);
        assert!(store.get("BTC").is_none());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].free, 480.0);
    }
}
