//! Property tests for the codec, expiration and placement invariants

use ephemvault::clock::{Clock, ManualClock, MonoTime};
use ephemvault::codec::{shamir, Share, ShareCodec};
use ephemvault::config::{ExpirationConfig, PlacementConfig};
use ephemvault::domain::{DomainRef, HealthTracker, MemoryDomain, StorageDomain};
use ephemvault::expiration::ExpirationManager;
use ephemvault::placement::PlacementManager;
use ephemvault::types::{DomainId, FragmentKey, SetId};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn memory_placement(domains: u16) -> (Vec<Arc<MemoryDomain>>, Arc<PlacementManager>) {
    let memory = MemoryDomain::pool(domains);
    let ids: Vec<DomainId> = memory.iter().map(|d| d.id()).collect();
    let refs: Vec<DomainRef> = memory.iter().map(|d| d.clone() as DomainRef).collect();
    let placement = Arc::new(
        PlacementManager::new(refs, Arc::new(HealthTracker::new(&ids)), PlacementConfig::default())
            .unwrap(),
    );
    (memory, placement)
}

fn placement(domains: u16) -> Arc<PlacementManager> {
    memory_placement(domains).1
}

/// `(n, k)` with `2 <= k <= n <= 10`
fn sharing_params() -> impl Strategy<Value = (usize, usize)> {
    (2usize..=10).prop_flat_map(|n| (Just(n), 2usize..=n))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any K shares reconstruct the payload
    #[test]
    fn any_k_shares_reconstruct(
        payload in prop::collection::vec(any::<u8>(), 0..128),
        (n, k) in sharing_params(),
        seed in any::<u64>(),
    ) {
        let codec = ShareCodec::new(k, n).unwrap();
        let encoded = codec.encode(&payload).unwrap();

        // Pick K distinct shares by rotating from a random start
        let start = (seed % n as u64) as usize;
        let subset: Vec<Share> = (0..k)
            .map(|i| encoded.shares[(start + i) % n].clone())
            .collect();

        let decoded = codec.decode(&subset, &encoded.fingerprint).unwrap();
        prop_assert_eq!(decoded, payload);
    }

    /// K-1 shares are consistent with every possible payload: for any other
    /// payload there is a K-th share that completes them to it.
    #[test]
    fn fewer_than_k_shares_fit_any_payload(
        payload in prop::collection::vec(any::<u8>(), 1..64),
        alternative_seed in any::<u8>(),
        (n, k) in sharing_params(),
    ) {
        let codec = ShareCodec::new(k, n).unwrap();
        let encoded = codec.encode(&payload).unwrap();
        let alternative: Vec<u8> = payload.iter().map(|b| b.wrapping_add(alternative_seed)).collect();

        let partial = &encoded.shares[..k - 1];
        prop_assert!(codec.decode(partial, &encoded.fingerprint).is_err());

        let mut points: Vec<(u8, &[u8])> = partial
            .iter()
            .map(|s| (shamir::x_coordinate(s.index), s.data.as_slice()))
            .collect();
        points.push((0, alternative.as_slice()));
        let forged_index = (k - 1) as u8;
        let forged = shamir::interpolate_at(&points, shamir::x_coordinate(forged_index));

        let mut completed: Vec<(u8, &[u8])> = partial
            .iter()
            .map(|s| (shamir::x_coordinate(s.index), s.data.as_slice()))
            .collect();
        completed.push((shamir::x_coordinate(forged_index), forged.as_slice()));
        prop_assert_eq!(shamir::combine(&completed), alternative);
    }

    /// No fragment is live at or after its deadline, whatever the clock does
    #[test]
    fn expiration_hard_bound(
        lifetime_us in 1u64..1_000_000,
        instants in prop::collection::vec(0u64..2_000_000, 1..32),
        tightened_us in prop::option::of(0u64..1_000_000),
    ) {
        let clock = Arc::new(ManualClock::new());
        let expiration = ExpirationManager::new(
            clock.clone(),
            placement(3),
            ExpirationConfig::default(),
        );
        let set_id = SetId::new();
        let deadline = MonoTime(lifetime_us);
        expiration.register_set(set_id, 3, deadline);

        let key = FragmentKey::new(set_id, 1);
        if let Some(t) = tightened_us {
            expiration.tighten(key, MonoTime(t));
        }
        let bound = expiration.valid_until(key).unwrap();
        prop_assert!(bound <= deadline);

        for instant in instants {
            clock.set(MonoTime(instant));
            let live = expiration.is_live(key, clock.now());
            prop_assert_eq!(live, MonoTime(instant) < bound);
        }
    }

    /// Tightening a set never lengthens any fragment's deadline
    #[test]
    fn escalation_never_lengthens(
        lifetime_ms in 1u64..10_000,
        elapsed_ms in 0u64..10_000,
        factor in 0.01f64..0.99,
        rounds in 1usize..4,
    ) {
        let clock = Arc::new(ManualClock::new());
        let expiration = ExpirationManager::new(
            clock.clone(),
            placement(3),
            ExpirationConfig::default(),
        );
        let set_id = SetId::new();
        expiration.register_set(set_id, 3, MonoTime::from_millis(lifetime_ms));
        clock.advance(Duration::from_millis(elapsed_ms));

        let mut previous = expiration.fragment_deadlines(set_id);
        for _ in 0..rounds {
            expiration.tighten_set(set_id, clock.now(), factor);
            let current = expiration.fragment_deadlines(set_id);
            for ((i, before), (j, after)) in previous.iter().zip(current.iter()) {
                prop_assert_eq!(i, j);
                prop_assert!(after <= before);
                if clock.now() < *before {
                    prop_assert!(after < before);
                }
            }
            previous = current;
        }
    }

    /// No domain ever holds K or more fragments of a set, including after
    /// sequential and concurrent hops
    #[test]
    fn placement_never_concentrates(
        domains in 2u16..9,
        (n, k) in sharing_params(),
        hops in 0usize..12,
        rounds in 1usize..4,
    ) {
        prop_assume!((domains as usize) * (k - 1) >= n);
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (memory, placement) = memory_placement(domains);
            let codec = ShareCodec::new(k, n).unwrap();
            let encoded = codec.encode(b"placement invariant").unwrap();
            let set_id = SetId::new();
            placement.place(set_id, k, &encoded.shares).await.unwrap();

            let max = |p: &PlacementManager| p.occupancy(set_id).values().copied().max().unwrap_or(0);
            prop_assert!(max(&placement) < k);

            for hop in 0..hops {
                let key = FragmentKey::new(set_id, (hop % n) as u8);
                let _ = placement.rehome(key, &[]).await;
                prop_assert!(max(&placement) < k);
            }

            // Every fragment hops at once; the domains only hold this set
            for _ in 0..rounds {
                let moves: Vec<_> = (0..n)
                    .map(|i| {
                        let placement = placement.clone();
                        tokio::spawn(async move {
                            placement.rehome(FragmentKey::new(set_id, i as u8), &[]).await
                        })
                    })
                    .collect();
                for handle in futures::future::join_all(moves).await {
                    let _ = handle.unwrap();
                }

                prop_assert!(max(&placement) < k);
                let located = placement.locate(set_id).await.unwrap();
                prop_assert_eq!(located.len(), n);
                for domain in &memory {
                    prop_assert!(domain.blob_count() < k);
                    let held = located.iter().filter(|r| domain.holds(r.blob)).count();
                    prop_assert_eq!(held, domain.blob_count());
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
