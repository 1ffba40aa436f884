//! Fixed-size Chord finger table.
//!
//! The table holds [`M`](crate::identity::M) entries indexed from 1. Entry 1
//! is the immediate successor, the most consulted pointer and the only one
//! join and stabilization actively maintain. Reads take a shared lock,
//! writes an exclusive lock, so a `get` never observes a torn entry across a
//! concurrent `set`.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::identity::{Node, M};

/// Error type for finger-table access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerError {
    /// The requested index is outside `[1, M]`.
    IndexOutOfRange(usize),
}

impl std::fmt::Display for FingerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FingerError::IndexOutOfRange(i) => {
                write!(f, "finger index {i} outside [1, {M}]")
            }
        }
    }
}

impl std::error::Error for FingerError {}

/// One routing entry: its 1-based index, the half-open position interval
/// `[low, high)` it covers, and the node currently believed to succeed that
/// interval (`None` when the entry has never been filled).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finger {
    pub index: usize,
    pub interval: (u64, u64),
    pub node: Option<Node>,
}

/// The routing table. Interior locking keeps the single-entry read/write
/// contract local to this type.
pub struct FingerTable {
    entries: RwLock<Vec<Finger>>,
}

impl FingerTable {
    /// A fresh table for `own`: entry 1 points at the node itself covering
    /// the whole ring, all other entries empty. Join and stabilization
    /// overwrite entry 1 as the real successor is learned.
    pub fn new(own: &Node) -> Self {
        let mut entries: Vec<Finger> = (1..=M)
            .map(|index| Finger {
                index,
                interval: (0, 0),
                node: None,
            })
            .collect();
        entries[0] = Finger {
            index: 1,
            interval: (own.position(), own.position()),
            node: Some(own.clone()),
        };
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Read entry `i` (1-based) under the shared lock.
    pub fn get(&self, i: usize) -> Result<Finger, FingerError> {
        if i < 1 || i > M {
            return Err(FingerError::IndexOutOfRange(i));
        }
        let entries = self.entries.read().expect("finger table lock poisoned");
        Ok(entries[i - 1].clone())
    }

    /// Replace entry `i` (1-based) under the exclusive lock.
    pub fn set(&self, i: usize, interval: (u64, u64), node: Node) -> Result<(), FingerError> {
        if i < 1 || i > M {
            return Err(FingerError::IndexOutOfRange(i));
        }
        let mut entries = self.entries.write().expect("finger table lock poisoned");
        entries[i - 1] = Finger {
            index: i,
            interval,
            node: Some(node),
        };
        Ok(())
    }

    /// The immediate successor: entry 1.
    pub fn successor(&self) -> Option<Node> {
        let entries = self.entries.read().expect("finger table lock poisoned");
        entries[0].node.clone()
    }

    /// A point-in-time copy of every entry, for the GetFingerTable RPC.
    pub fn snapshot(&self) -> Vec<Finger> {
        let entries = self.entries.read().expect("finger table lock poisoned");
        entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::WirePublicKey;
    use crate::identity::Identifier;

    fn node(addr: &str) -> Node {
        Node::from_addr(addr, WirePublicKey::default())
    }

    #[test]
    fn new_table_points_entry_one_at_self() {
        let own = node("127.0.0.1:3000");
        let table = FingerTable::new(&own);
        assert_eq!(table.successor().unwrap(), own);
        assert_eq!(table.get(1).unwrap().node.unwrap(), own);
        assert!(table.get(2).unwrap().node.is_none());
        assert!(table.get(M).unwrap().node.is_none());
    }

    #[test]
    fn out_of_range_indices_fail() {
        let table = FingerTable::new(&node("127.0.0.1:3000"));
        assert_eq!(table.get(0), Err(FingerError::IndexOutOfRange(0)));
        assert_eq!(table.get(M + 1), Err(FingerError::IndexOutOfRange(M + 1)));
        assert_eq!(
            table.set(0, (0, 0), node("127.0.0.1:1")),
            Err(FingerError::IndexOutOfRange(0))
        );
        assert_eq!(
            table.set(M + 1, (0, 0), node("127.0.0.1:1")),
            Err(FingerError::IndexOutOfRange(M + 1))
        );
    }

    #[test]
    fn get_returns_last_write() {
        let table = FingerTable::new(&node("127.0.0.1:3000"));
        let succ = node("127.0.0.1:3001");
        table.set(1, (3, 57), succ.clone()).unwrap();
        let finger = table.get(1).unwrap();
        assert_eq!(finger.node.unwrap(), succ);
        assert_eq!(finger.interval, (3, 57));
        assert_eq!(table.successor().unwrap().id, Identifier::hash(b"127.0.0.1:3001"));

        let replacement = node("127.0.0.1:3002");
        table.set(1, (3, 91), replacement.clone()).unwrap();
        assert_eq!(table.get(1).unwrap().node.unwrap(), replacement);
    }

    #[test]
    fn concurrent_readers_observe_whole_entries() {
        let table = std::sync::Arc::new(FingerTable::new(&node("127.0.0.1:3000")));
        let writer = {
            let table = table.clone();
            std::thread::spawn(move || {
                for port in 0..500u16 {
                    let n = node(&format!("127.0.0.1:{}", 4000 + port));
                    let p = n.position();
                    table.set(1, (p, p), n).unwrap();
                }
            })
        };
        let reader = {
            let table = table.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let finger = table.get(1).unwrap();
                    // entry is written atomically: node and interval agree
                    let n = finger.node.expect("entry 1 is never emptied");
                    assert_eq!(finger.interval.0, finger.interval.1);
                    if finger.interval.0 != Identifier::hash(b"127.0.0.1:3000").position() {
                        assert_eq!(finger.interval.0, n.position());
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn snapshot_is_a_copy() {
        let table = FingerTable::new(&node("127.0.0.1:3000"));
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), M);
        table.set(1, (0, 1), node("127.0.0.1:3009")).unwrap();
        assert_ne!(
            snapshot[0].node.as_ref().unwrap().addr,
            table.get(1).unwrap().node.unwrap().addr
        );
    }
}
