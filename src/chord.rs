//! # Local Chord Node
//!
//! The ring-maintenance heart of a peer: successor lookup through the finger
//! table, predecessor tracking, joining an existing ring, and the periodic
//! stabilization task that repairs successor/predecessor pointers after
//! membership changes.
//!
//! ## Invariants (eventual)
//!
//! - `position(self)` lies in `(position(predecessor), position(successor)]`
//!   on the ring.
//! - For every key `k`, repeatedly applying `successor(k)` converges on the
//!   unique node whose identifier is the least at or after `position(k)`,
//!   wrapping.
//!
//! No component owns "the ring": peers reference each other only as value
//! objects, and every cross-node edge is a fresh encrypted round trip. The
//! stabilize task is idempotent and recoverable: any transient RPC failure
//! is logged and retried on the next period.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rsa::RsaPrivateKey;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::crypto::WirePublicKey;
use crate::finger::{Finger, FingerTable};
use crate::identity::{between_open, between_right_closed, Identifier, Node, M};
use crate::messages::{
    self, FingerTableSnapshot, PredecessorUpdate, Request, Response, SuccessorQuery,
};
use crate::protocols::ChordPeer;
use crate::rpc::RemoteNode;
use crate::server::{Handler, HandlerContext};

/// Default period of the stabilization task.
pub const STABILIZE_INTERVAL: Duration = Duration::from_secs(10);

/// Cap on the orphan-recovery predecessor walk. Without it a stale
/// predecessor chain containing a cycle could keep a round spinning forever.
const RECOVERY_WALK_LIMIT: usize = M;

/// Error type for ring operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// A successor lookup could not be completed.
    SuccessorLookupFailed(String),
    /// A proposed predecessor is not strictly closer than the current one.
    PredecessorNotCloser,
}

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingError::SuccessorLookupFailed(cause) => {
                write!(f, "successor lookup failed: {cause}")
            }
            RingError::PredecessorNotCloser => {
                write!(f, "proposed predecessor is not closer than the current one")
            }
        }
    }
}

impl std::error::Error for RingError {}

/// This peer's view of itself on the ring.
pub struct LocalNode {
    node: Node,
    finger: FingerTable,
    predecessor: RwLock<Option<Node>>,
    self_key: Arc<RsaPrivateKey>,
}

impl LocalNode {
    /// Create the local node for a peer listening on `addr`. The finger
    /// table starts pointing at the node itself; a later [`join`] or the
    /// stabilize task fills in the real successor.
    pub fn new(addr: &str, self_key: Arc<RsaPrivateKey>) -> Self {
        let node = Node::from_addr(addr, WirePublicKey::from(&self_key.to_public_key()));
        let finger = FingerTable::new(&node);
        info!(node = %node, position = node.position(), "local node created");
        Self {
            node,
            finger,
            predecessor: RwLock::new(None),
            self_key,
        }
    }

    /// This peer as a value object.
    pub fn node(&self) -> Node {
        self.node.clone()
    }

    pub fn id(&self) -> Identifier {
        self.node.id
    }

    pub fn self_key(&self) -> Arc<RsaPrivateKey> {
        self.self_key.clone()
    }

    pub fn finger_snapshot(&self) -> Vec<Finger> {
        self.finger.snapshot()
    }

    fn remote(&self, target: Node) -> RemoteNode {
        RemoteNode::new(target, self.node.clone(), self.self_key.clone())
    }

    /// Walk the finger table from entry `M` down to 1 and return the first
    /// filled entry whose position lies strictly between ours and the key's.
    /// Falls back to the node itself when no finger qualifies.
    pub fn closest_preceding_node(&self, id: Identifier) -> Node {
        let self_pos = self.node.position();
        let key_pos = id.position();
        for i in (1..=M).rev() {
            let finger = self
                .finger
                .get(i)
                .expect("index within [1, M] by construction");
            let Some(candidate) = finger.node else {
                continue;
            };
            if candidate == self.node {
                continue;
            }
            if between_open(candidate.position(), self_pos, key_pos) {
                return candidate;
            }
        }
        self.node.clone()
    }

    /// Resolve the node responsible for `id`: the node whose position is the
    /// least at or after `id`'s, wrapping.
    ///
    /// When the key falls inside `(self, successor]` the immediate successor
    /// is the answer; otherwise the lookup is delegated to the closest
    /// preceding finger. A lookup that cannot advance past ourselves resolves
    /// to ourselves.
    pub async fn find_successor(&self, id: Identifier) -> Result<Node, RingError> {
        let successor = self.successor_hint();
        if between_right_closed(id.position(), self.node.position(), successor.position()) {
            return Ok(successor);
        }
        let n_prime = self.closest_preceding_node(id);
        if n_prime == self.node {
            return Ok(self.node.clone());
        }
        self.remote(n_prime)
            .successor(id)
            .await
            .map_err(|e| RingError::SuccessorLookupFailed(e.to_string()))
    }

    /// Record `node` as the immediate successor (finger entry 1).
    pub fn set_successor(&self, node: Node) {
        debug!(successor = %node, "successor updated");
        self.finger
            .set(1, (self.node.position(), node.position()), node)
            .expect("entry 1 is always in range");
    }

    /// The current immediate successor.
    pub fn successor_hint(&self) -> Node {
        self.finger
            .successor()
            .unwrap_or_else(|| self.node.clone())
    }

    /// The current predecessor, `None` while unknown.
    pub fn predecessor(&self) -> Option<Node> {
        self.predecessor
            .read()
            .expect("predecessor lock poisoned")
            .clone()
    }

    /// Accept `node` as predecessor iff it is strictly closer than the
    /// current one. An unknown predecessor accepts any proposal. State is
    /// untouched on rejection.
    pub fn accept_predecessor(&self, node: Node) -> Result<(), RingError> {
        let mut slot = self
            .predecessor
            .write()
            .expect("predecessor lock poisoned");
        let closer = match slot.as_ref() {
            None => true,
            Some(current) => {
                between_open(node.position(), current.position(), self.node.position())
            }
        };
        if closer {
            debug!(predecessor = %node, "predecessor updated");
            *slot = Some(node);
            Ok(())
        } else {
            Err(RingError::PredecessorNotCloser)
        }
    }

    /// Join the ring known to `peer`: adopt `peer.successor(self.id)` as our
    /// successor and announce ourselves as its predecessor.
    pub async fn join(&self, peer: &Node) -> Result<()> {
        info!(peer = %peer, "joining ring");
        let successor = self.remote(peer.clone()).successor(self.node.id).await?;
        info!(successor = %successor, "join resolved successor");
        self.set_successor(successor.clone());
        if successor != self.node {
            self.remote(successor)
                .set_predecessor(self.node.clone())
                .await?;
        }
        Ok(())
    }

    /// One stabilization round.
    ///
    /// When the successor pointer still names ourselves the ring is broken
    /// around us (freshly started or orphaned) and we re-close it by walking
    /// the predecessor chain. Otherwise we reconcile with the successor's
    /// predecessor pointer: adopt it when it sits between us and the
    /// successor, or correct the successor when it does not know about us.
    pub async fn stabilize_once(&self) -> Result<()> {
        let successor = self.successor_hint();

        if successor == self.node {
            return self.recover_from_orphan().await;
        }

        let pred = self.remote(successor.clone()).get_predecessor().await?;
        match pred {
            Some(p) if p == self.node => {
                // still the predecessor, nothing to repair
                Ok(())
            }
            Some(p)
                if between_open(
                    p.position(),
                    self.node.position(),
                    successor.position(),
                ) =>
            {
                debug!(new_successor = %p, "adopting successor's predecessor");
                self.set_successor(p.clone());
                self.remote(p).set_predecessor(self.node.clone()).await?;
                Ok(())
            }
            _ => {
                self.remote(successor)
                    .set_predecessor(self.node.clone())
                    .await?;
                Ok(())
            }
        }
    }

    /// Orphan recovery: our successor pointer leads back to ourselves, so
    /// walk predecessors until one with no predecessor of its own is found
    /// and adopt it as our successor, marking ourselves as its predecessor.
    /// The walk is capped to avoid livelock on a cyclic stale chain.
    async fn recover_from_orphan(&self) -> Result<()> {
        let Some(mut cursor) = self.predecessor() else {
            // alone on the ring; nothing to re-close
            return Ok(());
        };
        for _ in 0..RECOVERY_WALK_LIMIT {
            if cursor == self.node {
                return Ok(());
            }
            let next = self.remote(cursor.clone()).get_predecessor().await?;
            match next {
                None => {
                    info!(successor = %cursor, "re-closing ring at chain end");
                    self.set_successor(cursor.clone());
                    self.remote(cursor)
                        .set_predecessor(self.node.clone())
                        .await?;
                    return Ok(());
                }
                Some(next) if next == self.node => {
                    info!(successor = %cursor, "re-closing ring at cycle back to self");
                    self.set_successor(cursor.clone());
                    self.remote(cursor)
                        .set_predecessor(self.node.clone())
                        .await?;
                    return Ok(());
                }
                Some(next) => cursor = next,
            }
        }
        warn!("orphan recovery abandoned after {RECOVERY_WALK_LIMIT} hops");
        Ok(())
    }

    /// Run stabilization every `interval` until the quit signal fires.
    /// Failures are logged and the next round retries.
    pub fn spawn_stabilize(
        self: &Arc<Self>,
        interval: Duration,
        mut quit: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let local = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = quit.recv() => {
                        debug!("stabilize task stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = local.stabilize_once().await {
                            warn!(error = %e, "stabilize round failed");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ChordPeer for LocalNode {
    async fn successor(&self, id: Identifier) -> Result<Node> {
        self.find_successor(id).await.map_err(anyhow::Error::from)
    }

    async fn get_predecessor(&self) -> Result<Option<Node>> {
        Ok(self.predecessor())
    }

    async fn set_predecessor(&self, node: Node) -> Result<()> {
        self.accept_predecessor(node).map_err(anyhow::Error::from)
    }

    async fn get_finger_table(&self) -> Result<Vec<Finger>> {
        Ok(self.finger_snapshot())
    }
}

// ============================================================================
// Request handlers
// ============================================================================

/// Handles GetSuccessor.
pub struct SuccessorHandler;

#[async_trait]
impl Handler for SuccessorHandler {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response {
        let query: SuccessorQuery = match messages::decode(&request.data) {
            Ok(query) => query,
            Err(e) => {
                warn!(error = %e, "malformed successor query");
                return Response::error();
            }
        };
        match ctx.local.find_successor(query.id).await {
            Ok(node) => match messages::encode(&node) {
                Ok(body) => Response::success(body),
                Err(e) => {
                    warn!(error = %e, "failed to encode successor");
                    Response::error()
                }
            },
            Err(e) => {
                warn!(error = %e, key = %query.id.short(), "successor lookup failed");
                Response::error()
            }
        }
    }
}

/// Handles GetPredecessor.
pub struct GetPredecessorHandler;

#[async_trait]
impl Handler for GetPredecessorHandler {
    async fn handle(&self, ctx: &HandlerContext, _request: &Request) -> Response {
        let update = PredecessorUpdate {
            node: ctx.local.predecessor(),
        };
        match messages::encode(&update) {
            Ok(body) => Response::success(body),
            Err(e) => {
                warn!(error = %e, "failed to encode predecessor");
                Response::error()
            }
        }
    }
}

/// Handles SetPredecessor.
pub struct SetPredecessorHandler;

#[async_trait]
impl Handler for SetPredecessorHandler {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response {
        let update: PredecessorUpdate = match messages::decode(&request.data) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "malformed predecessor update");
                return Response::error();
            }
        };
        let Some(node) = update.node else {
            return Response::error();
        };
        match ctx.local.accept_predecessor(node) {
            Ok(()) => Response::success(Vec::new()),
            Err(RingError::PredecessorNotCloser) => Response::error(),
            Err(e) => {
                warn!(error = %e, "predecessor update failed");
                Response::error()
            }
        }
    }
}

/// Handles GetFingerTable.
pub struct FingerTableHandler;

#[async_trait]
impl Handler for FingerTableHandler {
    async fn handle(&self, ctx: &HandlerContext, _request: &Request) -> Response {
        let snapshot = FingerTableSnapshot {
            fingers: ctx.local.finger_snapshot(),
        };
        match messages::encode(&snapshot) {
            Ok(body) => Response::success(body),
            Err(e) => {
                warn!(error = %e, "failed to encode finger table");
                Response::error()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn key() -> Arc<RsaPrivateKey> {
        Arc::new(RsaPrivateKey::new(&mut OsRng, 2048).unwrap())
    }

    fn local(addr: &str) -> LocalNode {
        LocalNode::new(addr, key())
    }

    fn peer(addr: &str) -> Node {
        Node::from_addr(addr, WirePublicKey::default())
    }

    #[test]
    fn fresh_node_is_its_own_successor() {
        let node = local("127.0.0.1:3000");
        assert_eq!(node.successor_hint(), node.node());
        assert!(node.predecessor().is_none());
    }

    #[test]
    fn closest_preceding_skips_self_entry() {
        let node = local("127.0.0.1:3000");
        // only entry 1 = self, so any lookup falls back to self
        let target = Identifier::hash(b"some key");
        assert_eq!(node.closest_preceding_node(target), node.node());
    }

    #[test]
    fn closest_preceding_prefers_between_finger() {
        let node = local("127.0.0.1:3000");
        let self_pos = node.node().position();
        // find a peer strictly between self and the target key
        let target = Identifier::hash(b"lookup target");
        let target_pos = target.position();
        let mut candidate = None;
        for port in 4000..6000u16 {
            let p = peer(&format!("127.0.0.1:{port}"));
            if between_open(p.position(), self_pos, target_pos) {
                candidate = Some(p);
                break;
            }
        }
        let candidate = candidate.expect("some port hashes between self and target");
        node.set_successor(candidate.clone());
        assert_eq!(node.closest_preceding_node(target), candidate);
    }

    #[test]
    fn predecessor_accepts_only_closer_proposals() {
        let node = local("127.0.0.1:3000");
        let self_pos = node.node().position();

        // first proposal is always accepted
        let first = peer("127.0.0.1:4001");
        node.accept_predecessor(first.clone()).unwrap();
        assert_eq!(node.predecessor().unwrap(), first);

        // search for one closer and one not-closer candidate
        let mut closer = None;
        let mut not_closer = None;
        for port in 5000..9000u16 {
            let p = peer(&format!("127.0.0.1:{port}"));
            if p == first || p.position() == self_pos {
                continue;
            }
            if between_open(p.position(), first.position(), self_pos) {
                closer.get_or_insert(p);
            } else {
                not_closer.get_or_insert(p);
            }
            if closer.is_some() && not_closer.is_some() {
                break;
            }
        }

        let not_closer = not_closer.expect("found a non-closer candidate");
        assert_eq!(
            node.accept_predecessor(not_closer),
            Err(RingError::PredecessorNotCloser)
        );
        assert_eq!(node.predecessor().unwrap(), first, "state must not change");

        let closer = closer.expect("found a closer candidate");
        node.accept_predecessor(closer.clone()).unwrap();
        assert_eq!(node.predecessor().unwrap(), closer);
    }

    #[tokio::test]
    async fn lone_node_resolves_itself() {
        let node = local("127.0.0.1:3000");
        let found = node.find_successor(Identifier::hash(b"anything")).await.unwrap();
        assert_eq!(found, node.node());
    }

    #[tokio::test]
    async fn lone_node_stabilize_is_a_noop() {
        let node = local("127.0.0.1:3000");
        node.stabilize_once().await.unwrap();
        assert_eq!(node.successor_hint(), node.node());
        assert!(node.predecessor().is_none());
    }
}
