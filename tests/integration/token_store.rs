//! Message token storage: at-most-once consumption

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use turium::relay::token::{
    open_token_store, MemoryTokenStore, SledTokenStore, StorageConfig, TokenStore,
};

/// Races `consumers` threads on one token and returns how many won.
fn race(store: Arc<dyn TokenStore>, id: &str, consumers: usize) -> usize {
    store.put(id).unwrap();
    let handles: Vec<_> = (0..consumers)
        .map(|_| {
            let store = store.clone();
            let id = id.to_string();
            std::thread::spawn(move || store.consume(&id).unwrap().is_some())
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_memory_token_consumed_once(consumers in 2usize..12, suffix in "[a-z0-9]{1,12}") {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
        let id = format!("message:{}", suffix);
        prop_assert_eq!(race(store.clone(), &id, consumers), 1);
        prop_assert!(!store.contains(&id).unwrap());
    }

    #[test]
    fn prop_sled_token_consumed_once(consumers in 2usize..8, suffix in "[a-z0-9]{1,12}") {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn TokenStore> = Arc::new(SledTokenStore::open(temp.path().join("tokens")).unwrap());
        let id = format!("message:{}", suffix);
        prop_assert_eq!(race(store.clone(), &id, consumers), 1);
        prop_assert_eq!(store.len().unwrap(), 0);
    }
}

#[test]
fn test_purge_drops_only_old_tokens() {
    let temp = TempDir::new().unwrap();
    let store = open_token_store(&StorageConfig {
        token_store_path: Some(temp.path().join("nested").join("tokens")),
    })
    .unwrap();
    store.put("message:old").unwrap();
    std::thread::sleep(Duration::from_millis(30));
    store.put("message:new").unwrap();

    assert_eq!(store.purge_older_than(Duration::from_millis(20)).unwrap(), 1);
    assert!(!store.contains("message:old").unwrap());
    assert!(store.contains("message:new").unwrap());
    assert_eq!(store.purge_older_than(Duration::from_secs(3600)).unwrap(), 0);
}

#[test]
fn test_memory_store_selected_by_path() {
    let store = open_token_store(&StorageConfig {
        token_store_path: Some("memory".into()),
    })
    .unwrap();
    store.put("message:m").unwrap();
    assert_eq!(store.len().unwrap(), 1);
}
