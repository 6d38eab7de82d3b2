//! End-to-end scenarios against in-memory domains and the real clock

use ephemvault::prelude::*;
use ephemvault::types::FragmentKey;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PAYLOAD: &[u8] = b"launch codes: 0000";

fn store_with(domains: u16) -> (FragmentStore, Vec<Arc<MemoryDomain>>) {
    let mut config = Config::default();
    config.placement.hop_interval_ms = 0;
    config.canary.rotation_interval_ms = 0;

    let memory = MemoryDomain::pool(domains);
    let refs: Vec<DomainRef> = memory.iter().map(|d| d.clone() as DomainRef).collect();
    let store = FragmentStore::builder(config).domains(refs).build().unwrap();
    (store, memory)
}

#[tokio::test]
async fn test_happy_path_within_twenty_ms() {
    let (store, _) = store_with(7);
    let set_id = store
        .create_fragment_set(PAYLOAD, 7, 4, Duration::from_millis(100))
        .await
        .unwrap();

    let recovered = store
        .reconstruct(set_id, Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(recovered, PAYLOAD);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expiry_enforced_at_150ms() {
    let (store, memory) = store_with(7);
    let created = Instant::now();
    let set_id = store
        .create_fragment_set(PAYLOAD, 7, 4, Duration::from_millis(100))
        .await
        .unwrap();

    let wait = Duration::from_millis(150).saturating_sub(created.elapsed());
    tokio::time::sleep(wait).await;

    let result = store.reconstruct(set_id, Duration::from_millis(20)).await;
    assert!(matches!(result, Err(Error::SetExpired(id)) if id == set_id));

    let status = store.status(set_id).unwrap();
    assert!(status.expired);
    assert_eq!(status.fragments_live, 0);

    // Every fragment and bound canary blob is gone from every domain
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store.placement().set_ids().is_empty());
    assert_eq!(memory.iter().map(|d| d.blob_count()).sum::<usize>(), 0);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_partial_loss_of_three_domains() {
    let (store, memory) = store_with(7);
    let set_id = store
        .create_fragment_set(PAYLOAD, 7, 4, Duration::from_millis(100))
        .await
        .unwrap();

    for domain in &memory[..3] {
        domain.set_available(false);
    }

    let recovered = store
        .reconstruct(set_id, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(recovered, PAYLOAD);
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_canary_scan_escalates_and_tightens() {
    let (store, memory) = store_with(7);
    let set_id = store
        .create_fragment_set(PAYLOAD, 7, 4, Duration::from_secs(2))
        .await
        .unwrap();

    let keys: Vec<FragmentKey> = (0..7).map(|i| FragmentKey::new(set_id, i)).collect();
    let before: Vec<_> = keys
        .iter()
        .map(|k| store.expiration().valid_until(*k).unwrap())
        .collect();
    let record_before = store.metadata().get_set(set_id).unwrap().unwrap();

    let mut alerts = store.subscribe();
    memory[0].scan("bulk-scan").await.unwrap();
    memory[1].scan("bulk-scan").await.unwrap();

    let alert = tokio::time::timeout(Duration::from_secs(1), alerts.recv())
        .await
        .expect("no alert raised")
        .unwrap();
    assert_eq!(alert.state, EscalationState::Escalated);
    assert_eq!(alert.domains, vec![DomainId(0), DomainId(1)]);
    assert!(alert.sets.contains(&set_id));
    assert_eq!(store.escalation_state(), EscalationState::Escalated);

    for (key, old) in keys.iter().zip(before) {
        let new = store.expiration().valid_until(*key).unwrap();
        assert!(new < old, "{} not tightened", key);
    }

    // Nothing of the set is left on the scanned domains
    let occupancy = store.placement().occupancy(set_id);
    assert_eq!(occupancy.get(&DomainId(0)).copied().unwrap_or(0), 0);
    assert_eq!(occupancy.get(&DomainId(1)).copied().unwrap_or(0), 0);

    // The tightened deadline is what gets persisted
    tokio::time::sleep(Duration::from_millis(10)).await;
    let record_after = store.metadata().get_set(set_id).unwrap().unwrap();
    assert!(record_after.deadline < record_before.deadline);

    // Still reconstructible, just for less time
    assert_eq!(
        store.reconstruct(set_id, Duration::from_millis(50)).await.unwrap(),
        PAYLOAD
    );
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_single_domain_scan_only_suspects() {
    let (store, memory) = store_with(7);
    let set_id = store
        .create_fragment_set(PAYLOAD, 7, 4, Duration::from_secs(2))
        .await
        .unwrap();
    let key = FragmentKey::new(set_id, 0);
    let before = store.expiration().valid_until(key).unwrap();

    memory[2].scan("bulk-scan").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(store.escalation_state(), EscalationState::Suspected);
    assert_eq!(store.expiration().valid_until(key).unwrap(), before);
    store.shutdown().await.unwrap();
}
