//! Protocol trait definitions for the ring layer.
//!
//! Chord logic is written against the [`ChordPeer`] capability rather than
//! asking "is this peer local or remote?". The local node implements it by
//! short-circuiting to its own state; the remote proxy implements it by
//! issuing one encrypted round trip per call. Keeping the seam here lets the
//! stabilization and lookup code treat every peer uniformly and avoids
//! circular dependencies between the ring and transport modules.

use anyhow::Result;
use async_trait::async_trait;

use crate::finger::Finger;
use crate::identity::{Identifier, Node};

/// Operations every Chord peer answers, locally or over the wire.
#[async_trait]
pub trait ChordPeer: Send + Sync {
    /// The node responsible for `id`: the peer whose identifier is the least
    /// one at or after `id`'s ring position, wrapping around.
    async fn successor(&self, id: Identifier) -> Result<Node>;

    /// The peer's current predecessor, `None` when unknown.
    async fn get_predecessor(&self) -> Result<Option<Node>>;

    /// Propose `node` as the peer's predecessor. The peer accepts only if
    /// the proposal is strictly closer than its current predecessor.
    async fn set_predecessor(&self, node: Node) -> Result<()>;

    /// A snapshot of the peer's finger table.
    async fn get_finger_table(&self) -> Result<Vec<Finger>>;
}
