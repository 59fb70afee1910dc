//! Connection pool tests under concurrent access.

use crate::generators::test_hash;
use bitnode_network::{
    ConnectionPool, Direction, InvEntry, NetworkError, PeerId, PoolLimits, MAX_INV_ENTRIES,
};
use std::net::SocketAddr;
use std::sync::Arc;

fn addr(n: u16) -> SocketAddr {
    SocketAddr::from(([10, 1, (n >> 8) as u8, n as u8], 8333))
}

#[test]
fn test_concurrent_duplicate_registration() {
    let pool = Arc::new(ConnectionPool::default());
    let target = addr(1);
    let id = PeerId::from_addr(&target);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let pool = pool.clone();
            let direction = if i % 2 == 0 {
                Direction::Inbound
            } else {
                Direction::Outbound
            };
            std::thread::spawn(move || pool.try_register(id, target, direction).is_ok())
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(winners, 1);
    assert_eq!(pool.count(), 1);
}

#[test]
fn test_concurrent_registration_respects_ceiling() {
    let pool = Arc::new(ConnectionPool::new(PoolLimits {
        max_inbound: 8,
        max_outbound: 3,
    }));

    let handles: Vec<_> = (0..40u16)
        .map(|n| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let a = addr(n);
                pool.try_register(PeerId::from_addr(&a), a, Direction::Inbound)
                    .is_ok()
            })
        })
        .collect();
    let accepted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(accepted, 8);
    assert_eq!(pool.count_inbound(), 8);
    assert!(!pool.has_inbound_capacity());
    assert!(pool.has_outbound_capacity());
}

#[test]
fn test_ceiling_error_and_release() {
    let pool = ConnectionPool::new(PoolLimits {
        max_inbound: 1,
        max_outbound: 1,
    });
    let first = addr(1);
    let second = addr(2);
    pool.try_register(PeerId::from_addr(&first), first, Direction::Outbound)
        .unwrap();

    let err = pool
        .try_register(PeerId::from_addr(&second), second, Direction::Outbound)
        .unwrap_err();
    assert!(matches!(err, NetworkError::TooManyConnections { count: 1, max: 1 }));

    // Duplicate is reported before the ceiling
    let err = pool
        .try_register(PeerId::from_addr(&first), first, Direction::Outbound)
        .unwrap_err();
    assert!(matches!(err, NetworkError::DuplicatePeer(_)));

    assert!(pool.remove(&PeerId::from_addr(&first)));
    assert!(pool
        .try_register(PeerId::from_addr(&second), second, Direction::Outbound)
        .is_ok());
}

#[test]
fn test_concurrent_broadcast_is_bounded() {
    let pool = Arc::new(ConnectionPool::default());
    let a = addr(1);
    let b = addr(2);
    let source = PeerId::from_addr(&a);
    let sink = PeerId::from_addr(&b);
    pool.try_register(source, a, Direction::Inbound).unwrap();
    pool.try_register(sink, b, Direction::Outbound).unwrap();

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let entry = InvEntry::block(test_hash(t * 1_000 + i));
                    pool.broadcast_inventory(entry, Some(source));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(pool.take_inventory(&source).is_empty());
    assert_eq!(pool.take_inventory(&sink).len(), MAX_INV_ENTRIES);
    assert!(pool.take_inventory(&sink).is_empty());
}

#[test]
fn test_dropped_connection_stays_listed_but_gets_no_inventory() {
    let pool = ConnectionPool::default();
    for n in 0..3 {
        let a = addr(n);
        pool.try_register(PeerId::from_addr(&a), a, Direction::Inbound)
            .unwrap();
    }
    let closed = addr(1);
    assert!(pool.drop_ip(closed.ip()));
    assert!(!pool.drop_ip("192.0.2.1".parse().unwrap()));

    // Listed until its worker removes it
    let rows = pool.snapshot();
    assert_eq!(rows.len(), 3);
    assert!(rows.windows(2).all(|w| w[0].id < w[1].id));

    assert_eq!(pool.broadcast_inventory(InvEntry::block(test_hash(1)), None), 2);
    assert!(pool.take_inventory(&PeerId::from_addr(&closed)).is_empty());
}
