use std::{collections::HashMap, hash::Hash};

use tokio::sync::RwLock;

/// In-memory, process-local cache. Never the source of truth: cilo's
/// authority is always the on-disk state store, this exists only for
/// ephemeral bookkeeping that does not need to survive a restart
/// (active websocket/tunnel connections, auth nonces and tokens,
/// in-flight lifecycle transition markers).
#[derive(Debug)]
pub struct CloneCache<K: PartialEq + Eq + Hash, T: Clone>(
  RwLock<HashMap<K, T>>,
);

impl<K: PartialEq + Eq + Hash, T: Clone> Default
  for CloneCache<K, T>
{
  fn default() -> Self {
    Self(RwLock::new(HashMap::new()))
  }
}

impl<K: PartialEq + Eq + Hash + Clone, T: Clone> CloneCache<K, T> {
  pub async fn get(&self, key: &K) -> Option<T> {
    self.0.read().await.get(key).cloned()
  }

  pub async fn get_entries(&self) -> Vec<(K, T)> {
    let cache = self.0.read().await;
    cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
  }

  pub async fn insert(&self, key: K, val: T) -> Option<T> {
    self.0.write().await.insert(key, val)
  }

  pub async fn remove(&self, key: &K) -> Option<T> {
    self.0.write().await.remove(key)
  }

  pub async fn len(&self) -> usize {
    self.0.read().await.len()
  }

  /// Remove every entry for which `keep` returns false.
  pub async fn retain(&self, mut keep: impl FnMut(&K, &T) -> bool) {
    self.0.write().await.retain(|k, v| keep(k, v));
  }
}

impl<K: PartialEq + Eq + Hash + Clone, T: Clone + Default>
  CloneCache<K, T>
{
  pub async fn get_or_insert_default(&self, key: &K) -> T {
    let mut lock = self.0.write().await;
    match lock.get(key).cloned() {
      Some(item) => item,
      None => {
        let item: T = Default::default();
        lock.insert(key.clone(), item.clone());
        item
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[tokio::test]
  async fn insert_and_get() {
    let cache = CloneCache::<String, u32>::default();
    cache.insert("a".into(), 1).await;
    assert_eq!(cache.get(&"a".to_string()).await, Some(1));
    assert_eq!(cache.get(&"b".to_string()).await, None);
  }

  #[tokio::test]
  async fn retain_drops_matching() {
    let cache = CloneCache::<String, u32>::default();
    cache.insert("a".into(), 1).await;
    cache.insert("b".into(), 2).await;
    cache.retain(|_, v| *v != 1).await;
    assert_eq!(cache.len().await, 1);
    assert_eq!(cache.get(&"b".to_string()).await, Some(2));
  }
}
