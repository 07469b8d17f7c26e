//! Tests for identifier arithmetic and the hash factory.

use super::factory::{IdFactory, Sha1Factory};
use super::types::Id;
use std::cmp::Ordering;

fn id(bytes: &[u8]) -> Id {
    Id::from_bytes(bytes)
}

// ============ Modular arithmetic ============

#[test]
fn add_then_sub_is_identity() {
    let cases: Vec<(Vec<u8>, Vec<u8>)> = vec![
        (vec![0x00], vec![0x00]),
        (vec![0x10], vec![0x50]),
        (vec![0xFF], vec![0x01]),
        (vec![0xFF, 0xFF], vec![0x00, 0x01]),
        (vec![0x12, 0x34, 0x56], vec![0xFE, 0xDC, 0xBA]),
    ];
    for (a, b) in cases {
        let a = id(&a);
        let b = id(&b);
        assert_eq!(a.add(&b).sub(&b), a, "(a+b)-b != a for a={a:?} b={b:?}");
    }
}

#[test]
fn add_wraps_at_modulus() {
    // 0xFF + 0x02 = 0x01 on an 8-bit ring.
    assert_eq!(id(&[0xFF]).add(&id(&[0x02])), id(&[0x01]));
    // Carry propagates across bytes.
    assert_eq!(id(&[0x00, 0xFF]).add(&id(&[0x00, 0x01])), id(&[0x01, 0x00]));
    // Overflow past the most significant byte is discarded.
    assert_eq!(id(&[0xFF, 0xFF]).add(&id(&[0x00, 0x01])), id(&[0x00, 0x00]));
}

#[test]
fn sub_borrows_and_wraps() {
    assert_eq!(id(&[0x10]).sub(&id(&[0x50])), id(&[0xC0]));
    assert_eq!(id(&[0x01, 0x00]).sub(&id(&[0x00, 0x01])), id(&[0x00, 0xFF]));
    assert_eq!(id(&[0x00]).sub(&id(&[0x01])), id(&[0xFF]));
}

#[test]
fn compare_pads_shorter_operand() {
    assert_eq!(id(&[0x01]).compare(&id(&[0x00, 0x01])), Ordering::Equal);
    assert_eq!(id(&[0x01]).compare(&id(&[0x00, 0x02])), Ordering::Less);
    assert_eq!(id(&[0x01, 0x00]).compare(&id(&[0x02])), Ordering::Greater);
}

// ============ Circular intervals ============

#[test]
fn between_is_half_open() {
    let a = id(&[0x10]);
    let b = id(&[0x50]);
    let x = id(&[0x30]);
    assert!(x.between(&a, &b));
    assert!(a.between(&a, &b), "from endpoint is included");
    assert!(!b.between(&a, &b), "to endpoint is excluded");
}

#[test]
fn between_self_interval_is_empty() {
    let a = id(&[0x10]);
    let x = id(&[0x30]);
    assert!(!x.between(&a, &a));
    assert!(!a.between(&a, &a));
}

#[test]
fn between_wraps_around_zero() {
    let from = id(&[0xF0]);
    let to = id(&[0x10]);
    assert!(id(&[0xFF]).between(&from, &to));
    assert!(id(&[0x00]).between(&from, &to));
    assert!(id(&[0x05]).between(&from, &to));
    assert!(!id(&[0x10]).between(&from, &to));
    assert!(!id(&[0x80]).between(&from, &to));
}

#[test]
fn between_is_cyclic_invariant() {
    // Shifting all three points by the same delta preserves the result.
    let triples = [
        (0x10u8, 0x50u8, 0x30u8),
        (0x10, 0x50, 0x60),
        (0xF0, 0x10, 0x00),
        (0x00, 0xFF, 0x80),
    ];
    let deltas = [0x00u8, 0x01, 0x7F, 0x80, 0xC3, 0xFF];
    for (from, to, x) in triples {
        let expected = id(&[x]).between(&id(&[from]), &id(&[to]));
        for d in deltas {
            let d = id(&[d]);
            let shifted = id(&[x]).add(&d).between(&id(&[from]).add(&d), &id(&[to]).add(&d));
            assert_eq!(shifted, expected, "shift broke between({from:#x},{to:#x},{x:#x})");
        }
    }
}

// ============ Hash factory ============

#[test]
fn sha1_factory_produces_fixed_width() {
    let factory = Sha1Factory;
    let id = factory.hash(b"127.0.0.1:7000");
    assert_eq!(id.len(), Sha1Factory::LEN);
    // Same input, same identifier.
    assert_eq!(id, factory.hash(b"127.0.0.1:7000"));
    // Different input, different identifier.
    assert_ne!(id, factory.hash(b"127.0.0.1:7001"));
}

#[test]
fn empty_input_hashes_to_zero() {
    let factory = Sha1Factory;
    assert!(factory.hash(b"").is_zero());
}

#[test]
fn reference_points() {
    let factory = Sha1Factory;
    // 2^(8L) >> 1 = 0x80 00 ... 00
    let half = factory.reference_point(1);
    assert_eq!(half.as_bytes()[0], 0x80);
    assert!(half.as_bytes()[1..].iter().all(|b| *b == 0));
    // 2^(8L) >> 2 = 0x40 00 ... 00
    assert_eq!(factory.reference_point(2).as_bytes()[0], 0x40);
    // Quarter plus eighth is the 3/4-of-ring threshold.
    let three_quarters = factory.reference_point(2).add(&factory.reference_point(3));
    assert_eq!(three_quarters.as_bytes()[0], 0x60);
    // Negative indices count from the small end: -1 is the unit step.
    let one = factory.reference_point(-1);
    assert_eq!(one.as_bytes()[Sha1Factory::LEN - 1], 1);
    assert!(one.as_bytes()[..Sha1Factory::LEN - 1].iter().all(|b| *b == 0));
    // n = 0 is the full diameter, which reduces to zero mod 2^(8L).
    assert!(factory.reference_point(0).is_zero());
}

#[test]
fn half_plus_half_wraps_to_zero() {
    let factory = Sha1Factory;
    let half = factory.reference_point(1);
    assert!(half.add(&half).is_zero());
}

#[test]
fn decode_round_trip_and_width_check() {
    let factory = Sha1Factory;
    let id = factory.hash(b"node-a");
    let decoded = factory.decode(&id.to_base64()).unwrap();
    assert_eq!(decoded, id);

    assert!(factory.decode("not base64 !!!").is_err());
    // Wrong width is rejected even when the encoding is valid.
    let short = Id::from_bytes(&[1, 2, 3]).to_base64();
    assert!(factory.decode(&short).is_err());
}
