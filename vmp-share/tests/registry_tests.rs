use std::sync::Arc;
use std::thread;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;

use vmp_bytecode::{ByteStr, OwnerTag, Ownership, Proto};
use vmp_share::{CodeCompare, ProtoKey, ProtoRegistry, RegistryConfig, code_hash};

fn make_proto(source: &str, code: Vec<u32>) -> Proto {
    Proto {
        source: Some(ByteStr::from(source)),
        linedefined: 3,
        lastlinedefined: 9,
        numparams: 1,
        maxstacksize: 4,
        code,
        ..Proto::default()
    }
}

/// Two different two-word streams with the same FNV hash
fn colliding_code() -> (Vec<u32>, Vec<u32>) {
    const OFFSET: u32 = 2166136261;
    const PRIME: u32 = 16777619;
    let (a0, a1) = (0x0000_0051u32, 0x0100_0046u32);
    let b0 = a0 ^ 1;
    let ha = (OFFSET ^ a0).wrapping_mul(PRIME);
    let hb = (OFFSET ^ b0).wrapping_mul(PRIME);
    let b1 = ha ^ a1 ^ hb;
    (vec![a0, a1], vec![b0, b1])
}

#[test]
fn test_identical_protos_share_one_entry() {
    let mut reg = ProtoRegistry::new();
    // compiled separately, so the source strings are distinct allocations
    let mut first = make_proto("@shared.lua", vec![0x51, 0x8b, 0x46]);
    let mut second = make_proto("@shared.lua", vec![0x51, 0x8b, 0x46]);

    let a = reg.get(&mut first, OwnerTag(1));
    let b = reg.get(&mut second, OwnerTag(2));

    assert!(!a.hit);
    assert!(b.hit);
    assert_eq!(a.handle, b.handle);
    assert!(Arc::ptr_eq(&a.proto, &b.proto));
    assert_eq!(reg.refcount(a.handle), Some(2));
    assert_eq!(reg.len(), 1);
    assert_eq!(
        second.ownership,
        Ownership::Shared {
            count: 2,
            owner: OwnerTag(2)
        }
    );
    // the entry keeps the first registrant as owner
    assert_eq!(reg.owner(a.handle), Some(OwnerTag(1)));

    assert_eq!(reg.release(&mut second), Some(1));
    assert_eq!(reg.refcount(a.handle), Some(1));
    assert!(reg.resolve(a.handle).is_some());

    assert_eq!(reg.release(&mut first), Some(0));
    assert_eq!(first.ownership, Ownership::Exclusive);
    assert_eq!(reg.refcount(a.handle), None);
    assert!(reg.is_empty());
}

#[test]
fn test_canonical_copy_carries_no_count() {
    let mut reg = ProtoRegistry::new();
    let mut first = make_proto("@canon.lua", vec![7, 8]);
    let mut second = make_proto("@canon.lua", vec![7, 8]);
    let a = reg.get(&mut first, OwnerTag(1));
    reg.get(&mut second, OwnerTag(2));

    assert_eq!(a.proto.ownership, Ownership::Exclusive);
    let canonical = reg.resolve(a.handle).unwrap();
    assert_eq!(canonical.ownership, Ownership::Exclusive);
    assert_eq!(reg.refcount(a.handle), Some(2));
    assert_eq!(
        first.ownership,
        Ownership::Shared {
            count: 1,
            owner: OwnerTag(1)
        }
    );
}

#[rstest]
#[case::source(make_proto("@other.lua", vec![1, 2, 3]))]
#[case::code(make_proto("@a.lua", vec![1, 2, 4]))]
#[case::length(make_proto("@a.lua", vec![1, 2, 3, 0]))]
#[case::params(Proto { numparams: 2, ..make_proto("@a.lua", vec![1, 2, 3]) })]
#[case::lines(Proto { lastlinedefined: 10, ..make_proto("@a.lua", vec![1, 2, 3]) })]
fn test_structural_differences_not_shared(#[case] mut other: Proto) {
    let mut reg = ProtoRegistry::new();
    let mut base = make_proto("@a.lua", vec![1, 2, 3]);

    let a = reg.get(&mut base, OwnerTag(1));
    let b = reg.get(&mut other, OwnerTag(1));
    assert_ne!(a.handle, b.handle);
    assert_eq!(reg.len(), 2);
}

#[test]
fn test_hash_collision_treated_as_equal() {
    let (code_a, code_b) = colliding_code();
    assert_ne!(code_a, code_b);
    assert_eq!(code_hash(&code_a), code_hash(&code_b));

    let mut a = make_proto("@c.lua", code_a);
    let mut b = make_proto("@c.lua", code_b);
    assert_eq!(ProtoKey::of(&a), ProtoKey::of(&b));

    // Default comparison trusts length + hash and merges the two
    let mut reg = ProtoRegistry::new();
    let first = reg.get(&mut a, OwnerTag(1));
    let second = reg.get(&mut b, OwnerTag(2));
    assert!(second.hit);
    assert!(Arc::ptr_eq(&first.proto, &second.proto));
    assert_eq!(second.proto.code, a.code);
}

#[test]
fn test_byte_comparison_separates_collisions() {
    let (code_a, code_b) = colliding_code();
    let mut a = make_proto("@c.lua", code_a);
    let mut b = make_proto("@c.lua", code_b);

    let mut reg = ProtoRegistry::with_config(RegistryConfig {
        code_compare: CodeCompare::Bytes,
    });
    let first = reg.get(&mut a, OwnerTag(1));
    let second = reg.get(&mut b, OwnerTag(1));
    assert!(!second.hit);
    assert_ne!(first.handle, second.handle);
    assert_eq!(reg.stats().longest_chain, 2);

    // release finds the right entry in the shared chain
    assert_eq!(reg.release(&mut b), Some(0));
    assert_eq!(reg.refcount(first.handle), Some(1));
    assert_eq!(reg.refcount(second.handle), None);
}

#[test]
fn test_shared_registry_across_threads() {
    let shared = ProtoRegistry::shared(RegistryConfig::default());

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut proto = make_proto("@worker.lua", vec![9, 9, 9]);
                let handle = shared.lock().get(&mut proto, OwnerTag(i)).handle;
                (handle, proto)
            })
        })
        .collect();
    let mut results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let handle = results[0].0;
    assert!(results.iter().all(|(h, _)| *h == handle));
    assert_eq!(shared.lock().refcount(handle), Some(4));

    for (_, proto) in &mut results {
        shared.lock().release(proto);
    }
    assert!(shared.lock().is_empty());
}

proptest! {
    #[test]
    fn prop_refcount_tracks_registrations(n in 1usize..24) {
        let mut reg = ProtoRegistry::new();
        let mut protos: Vec<Proto> = (0..n).map(|_| make_proto("@p.lua", vec![4, 5, 6])).collect();

        let handles: Vec<_> = protos
            .iter_mut()
            .enumerate()
            .map(|(i, p)| reg.get(p, OwnerTag(i as u64)).handle)
            .collect();
        let handle = handles[0];
        prop_assert!(handles.iter().all(|h| *h == handle));
        prop_assert_eq!(reg.refcount(handle), Some(n as u32));

        for (released, p) in protos.iter_mut().enumerate() {
            prop_assert_eq!(reg.release(p), Some((n - released - 1) as u32));
        }
        prop_assert!(reg.is_empty());
    }
}
