// Registry replication end to end: concurrent writers, anti-entropy,
// permission enforcement, convergence no matter the arrival order.

use std::sync::Arc;
use zonemesh_core::{
    KeyPair, ManualClock, MemoryStorage, Registry, RegistryConfig, RegistryPredicate,
};

type ByteRegistry = Registry<Vec<u8>>;

fn make_replica(name: &str) -> ByteRegistry {
    Registry::new(
        name,
        RegistryPredicate::CreatorOwnsKey,
        Arc::new(MemoryStorage::new()),
        ManualClock::new(),
        RegistryConfig::default(),
    )
}

/// Shuttle datagrams between two replicas until the air is quiet,
/// starting from `initiator`'s forced head announcement.
fn converge(a: &mut ByteRegistry, b: &mut ByteRegistry) {
    // (bound for the second replica, datagram)
    let mut queue: Vec<(bool, Vec<u8>)> = a
        .sync(true)
        .into_iter()
        .map(|(_, datagram)| (true, datagram))
        .collect();

    let mut rounds = 0;
    while let Some((to_b, datagram)) = queue.pop() {
        rounds += 1;
        assert!(rounds < 200, "reconciliation failed to settle");

        let outputs = if to_b {
            b.on_data(&datagram)
        } else {
            a.on_data(&datagram)
        };
        for (_, datagram) in outputs {
            queue.push((!to_b, datagram));
        }
    }
}

#[test]
fn concurrent_writers_converge_with_the_loser_retained() {
    let mut r1 = make_replica("shared");
    let mut r2 = make_replica("shared");
    let k1 = KeyPair::generate();
    let k2 = KeyPair::generate();

    r1.set("x", vec![1], &k1).unwrap();
    // The second writer owns "x" on its own replica until the logs meet
    r2.set("x", vec![2], &k2).unwrap();

    converge(&mut r1, &mut r2);

    assert_eq!(r1.head_hash(), r2.head_hash());
    assert_eq!(r1.get("x"), r2.get("x"));
    // Both concurrent entries survive in both logs
    assert_eq!(r1.len(), 2);
    assert_eq!(r2.len(), 2);
}

#[test]
fn fresh_replica_catches_up_from_scratch() {
    let mut seasoned = make_replica("config");
    let mut fresh = make_replica("config");
    let keys = KeyPair::generate();

    seasoned.set("a", vec![1], &keys).unwrap();
    seasoned.set("b", vec![2], &keys).unwrap();
    seasoned.set("a", vec![3], &keys).unwrap();
    seasoned.del("b", &keys).unwrap();

    converge(&mut seasoned, &mut fresh);

    assert_eq!(fresh.head_hash(), seasoned.head_hash());
    assert_eq!(fresh.len(), 4);
    assert_eq!(fresh.get("a"), Some(&vec![3]));
    assert!(!fresh.has("b"));
}

#[test]
fn convergence_is_symmetric_in_who_announces() {
    let mut r1 = make_replica("shared");
    let mut r2 = make_replica("shared");
    let k1 = KeyPair::generate();
    let k2 = KeyPair::generate();

    r1.set("x", vec![1], &k1).unwrap();
    r2.set("y", vec![2], &k2).unwrap();

    // The announcement travels the other way this time
    converge(&mut r2, &mut r1);

    assert_eq!(r1.head_hash(), r2.head_hash());
    assert_eq!(r1.get("x"), Some(&vec![1]));
    assert_eq!(r1.get("y"), Some(&vec![2]));
    assert_eq!(r2.get("x"), Some(&vec![1]));
}

#[test]
fn long_shared_prefix_reconciles_only_the_tail() {
    let mut r1 = make_replica("shared");
    let mut r2 = make_replica("shared");
    let keys = KeyPair::generate();

    for i in 0..8u8 {
        r1.set(&format!("k{i}"), vec![i], &keys).unwrap();
    }
    converge(&mut r1, &mut r2);
    assert_eq!(r1.head_hash(), r2.head_hash());

    // Diverge at the tip only
    r1.set("k7", vec![100], &keys).unwrap();
    converge(&mut r1, &mut r2);

    assert_eq!(r1.head_hash(), r2.head_hash());
    assert_eq!(r2.get("k7"), Some(&vec![100]));
    assert_eq!(r2.len(), 9);
}

#[test]
fn three_replicas_converge_pairwise() {
    let mut r1 = make_replica("shared");
    let mut r2 = make_replica("shared");
    let mut r3 = make_replica("shared");
    let k1 = KeyPair::generate();
    let k2 = KeyPair::generate();
    let k3 = KeyPair::generate();

    r1.set("a", vec![1], &k1).unwrap();
    r2.set("b", vec![2], &k2).unwrap();
    r3.set("c", vec![3], &k3).unwrap();

    converge(&mut r1, &mut r2);
    converge(&mut r2, &mut r3);
    converge(&mut r3, &mut r1);

    assert_eq!(r1.head_hash(), r2.head_hash());
    assert_eq!(r2.head_hash(), r3.head_hash());
    for replica in [&r1, &r2, &r3] {
        assert_eq!(replica.get("a"), Some(&vec![1]));
        assert_eq!(replica.get("b"), Some(&vec![2]));
        assert_eq!(replica.get("c"), Some(&vec![3]));
        assert_eq!(replica.len(), 3);
    }
}

#[test]
fn foreign_writer_is_retained_but_masked_everywhere() {
    let mut r1 = make_replica("shared");
    let mut r2 = make_replica("shared");
    let owner = KeyPair::generate();
    let intruder = KeyPair::generate();

    r1.set("k", vec![1], &owner).unwrap();
    converge(&mut r1, &mut r2);

    // The intruder writes on the other replica, where it is not yet
    // masked by the owner's entry... until the logs meet.
    let head_before = r2.head_hash();
    let _ = r2.set("k", vec![9], &intruder);
    assert_ne!(r2.head_hash(), head_before);

    converge(&mut r2, &mut r1);

    assert_eq!(r1.head_hash(), r2.head_hash());
    assert_eq!(r1.get("k"), Some(&vec![1]));
    assert_eq!(r2.get("k"), Some(&vec![1]));
    // The rejected entry still counts toward the log
    assert_eq!(r1.len(), 2);
}

#[test]
fn entries_survive_arbitrary_arrival_orders() {
    let keys = KeyPair::generate();

    // Build a history with branching parents on one replica
    let mut builder = make_replica("shared");
    builder.set("a", vec![1], &keys).unwrap();
    builder.set("a", vec![2], &keys).unwrap();
    builder.set("b", vec![3], &keys).unwrap();
    builder.set("a", vec![4], &keys).unwrap();
    builder.del("b", &keys).unwrap();

    let entries: Vec<_> = builder.entries().to_vec();
    let reference_hash = builder.head_hash();

    // Feed the same entries in several shuffled orders
    let permutations: Vec<Vec<usize>> = vec![
        vec![4, 3, 2, 1, 0],
        vec![2, 0, 4, 1, 3],
        vec![1, 3, 0, 4, 2],
    ];
    for order in permutations {
        let mut replica = make_replica("shared");
        let batch: Vec<_> = order.iter().map(|&i| entries[i].clone()).collect();
        replica.add_entries(batch);

        assert_eq!(replica.head_hash(), reference_hash);
        assert_eq!(replica.get("a"), Some(&vec![4]));
        assert!(!replica.has("b"));
    }
}

#[test]
fn sync_session_times_out_back_to_idle() {
    let clock = ManualClock::new();
    let mut r1 = Registry::<Vec<u8>>::new(
        "shared",
        RegistryPredicate::CreatorOwnsKey,
        Arc::new(MemoryStorage::new()),
        clock.clone(),
        RegistryConfig::default(),
    );
    let mut r2 = make_replica("shared");
    let keys = KeyPair::generate();

    r1.set("x", vec![1], &keys).unwrap();
    r2.set("y", vec![2], &keys).unwrap();

    // r1 hears the differing head and sends a probe into the void
    let announcement = r2.sync(true).remove(0).1;
    let probe = r1.on_data(&announcement);
    assert_eq!(probe.len(), 1);

    // No reply ever comes; the session resets and a later exchange works
    clock.advance(10_000);
    r1.tick();
    converge(&mut r1, &mut r2);
    assert_eq!(r1.head_hash(), r2.head_hash());
}
