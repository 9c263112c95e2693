//! Black-box tests for the identifier indices.
//!
//! Exercises `NameRegistrar` and `TruncIndex` through the public API,
//! including the concurrent-reservation behavior the lifecycle engine
//! relies on when two requests race for the same name.

use podbay::index::{NameRegistrar, TruncIndex};
use podbay::Error;
use std::sync::Arc;

/// Builds a valid 64-hex id from a short prefix.
fn hex_id(prefix: &str) -> String {
    assert!(prefix.chars().all(|c| c.is_ascii_hexdigit()));
    format!("{prefix:0<64}")
}

#[test]
fn test_reservation_cycle_frees_names() {
    let reg = NameRegistrar::new();
    let id_a = hex_id("aa");
    let id_b = hex_id("bb");

    reg.reserve("k8s_pod-a_default_uid_0", &id_a).unwrap();
    assert_eq!(reg.get("k8s_pod-a_default_uid_0"), Some(id_a.clone()));

    // Held names refuse other ids until released.
    assert!(matches!(
        reg.reserve("k8s_pod-a_default_uid_0", &id_b),
        Err(Error::AlreadyReserved { .. })
    ));
    reg.release("k8s_pod-a_default_uid_0");
    reg.reserve("k8s_pod-a_default_uid_0", &id_b).unwrap();
}

#[test]
fn test_concurrent_reservations_have_one_winner() {
    let reg = Arc::new(NameRegistrar::new());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let reg = reg.clone();
            std::thread::spawn(move || reg.reserve("k8s_web_default_uid_0", &hex_id(&format!("{i}"))))
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|r| r.is_ok())
        .count();
    assert_eq!(successes, 1);
}

#[test]
fn test_names_for_id_lists_all_reservations() {
    let reg = NameRegistrar::new();
    let id = hex_id("cc");
    reg.reserve("k8s_pod-a_default_uid_0", &id).unwrap();
    reg.reserve("k8s_POD_pod-a_default_uid_0", &id).unwrap();

    let mut names = reg.names_for_id(&id);
    names.sort();
    assert_eq!(
        names,
        vec![
            "k8s_POD_pod-a_default_uid_0".to_string(),
            "k8s_pod-a_default_uid_0".to_string(),
        ]
    );
    assert!(reg.names_for_id(&hex_id("dd")).is_empty());
}

#[test]
fn test_prefix_resolution_across_many_ids() {
    let index = TruncIndex::new(12);
    let ids = ["1a", "1b", "2a", "3f"].map(hex_id);
    for id in &ids {
        index.add(id).unwrap();
    }

    // Unique two-character prefixes resolve.
    assert_eq!(index.get("1a").unwrap(), ids[0]);
    assert_eq!(index.get("3f").unwrap(), ids[3]);
    // A one-character prefix shared by two ids is ambiguous.
    assert!(matches!(index.get("1"), Err(Error::AmbiguousPrefix(_))));
    // Deleting one of the pair disambiguates the shared prefix.
    index.delete(&ids[1]);
    assert_eq!(index.get("1").unwrap(), ids[0]);
    assert!(matches!(index.get("9"), Err(Error::NotFound { .. })));
}

#[test]
fn test_full_id_lookup_still_works() {
    let index = TruncIndex::new(12);
    let id = hex_id("deadbeef");
    index.add(&id).unwrap();
    assert_eq!(index.get(&id).unwrap(), id);
}

#[test]
fn test_min_prefix_collision_guard() {
    let index = TruncIndex::new(8);
    index.add(&hex_id("abcdef01")).unwrap();
    // Shares the full 8-character minimum prefix: refused, so future
    // 8-character lookups stay unambiguous.
    assert!(matches!(
        index.add(&format!("abcdef01{}", "9".repeat(56))),
        Err(Error::IdCollision(_))
    ));
    // Diverges within the minimum prefix: accepted.
    index.add(&hex_id("abcdee02")).unwrap();
}

#[test]
fn test_rejects_malformed_ids_and_prefixes() {
    let index = TruncIndex::new(12);
    assert!(index.add("not-hex").is_err());
    assert!(matches!(index.get(""), Err(Error::InvalidArgument(_))));
    // Non-hex prefixes can never match a stored id.
    index.add(&hex_id("11")).unwrap();
    assert!(matches!(index.get("zz"), Err(Error::NotFound { .. })));
}
