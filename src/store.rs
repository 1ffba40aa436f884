//! # Blob Store and File Handlers
//!
//! On-disk blobs are keyed by hex-encoded identifier and prefixed with the
//! 20-byte identifier of their owner. Get and Delete refuse to touch a blob
//! whose owner differs from the requester; Post overwrites by removing the
//! existing file before re-creating it. All three are serialized under one
//! coarse mutex, trading throughput for simplicity; a striped lock keyed by
//! the identifier's first byte would be a drop-in upgrade with no externally
//! observable change.
//!
//! User public keys live in the same store under the user's identifier, but
//! through their own method pair: PostPublicKey records the *subject* as
//! owner and GetPublicKey skips the ownership check, since the key material
//! is public and must be fetchable by any node performing user
//! authentication.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::chord::LocalNode;
use crate::identity::{Identifier, Node};
use crate::messages::{CallerType, Header, Method, Request, Response};
use crate::server::{Handler, HandlerContext};
use crate::transport::Transport;
use crate::txlog::{self, Operation};

/// Error type for blob operations.
#[derive(Debug)]
pub enum StoreError {
    /// The blob exists but belongs to someone else.
    OwnerMismatch,
    /// No blob under that key.
    NotFound(Identifier),
    /// The blob is shorter than its owner prefix.
    Corrupt(Identifier),
    /// The owning peer answered with an error status. The wire carries no
    /// detail, so a missing blob on a remote peer surfaces as this.
    Refused(Identifier),
    /// Underlying filesystem failure.
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::OwnerMismatch => write!(f, "requester does not own this blob"),
            StoreError::NotFound(id) => write!(f, "no blob stored under {}", id.short()),
            StoreError::Corrupt(id) => write!(f, "blob {} is missing its owner header", id.short()),
            StoreError::Refused(id) => {
                write!(f, "owning peer refused the operation on {}", id.short())
            }
            StoreError::Io(e) => write!(f, "blob io failed: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Prefix `payload` with its owner identifier, forming the on-disk layout.
pub fn with_owner(owner: Identifier, payload: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(20 + payload.len());
    blob.extend_from_slice(owner.as_bytes());
    blob.extend_from_slice(payload);
    blob
}

/// Split a stored blob into its owner identifier and payload.
pub fn split_owner(blob: &[u8]) -> Option<(Identifier, &[u8])> {
    if blob.len() < 20 {
        return None;
    }
    let mut owner = [0u8; 20];
    owner.copy_from_slice(&blob[..20]);
    Some((Identifier::from_bytes(owner), &blob[20..]))
}

/// The guarded on-disk store. One file per blob, named `hex(id)`.
pub struct BlobStore {
    root: PathBuf,
    guard: Mutex<()>,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: Identifier) -> PathBuf {
        self.root.join(key.to_hex())
    }

    /// Read a whole blob, owner prefix included.
    pub async fn get(&self, key: Identifier) -> Result<Vec<u8>, StoreError> {
        let _held = self.guard.lock().await;
        match tokio::fs::read(self.blob_path(key)).await {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(key)),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Overwrite a blob. The existing file is removed first.
    pub async fn put(&self, key: Identifier, blob: Vec<u8>) -> Result<(), StoreError> {
        let _held = self.guard.lock().await;
        let path = self.blob_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
        tokio::fs::write(&path, blob).await.map_err(StoreError::Io)
    }

    /// Remove a blob.
    pub async fn delete(&self, key: Identifier) -> Result<(), StoreError> {
        let _held = self.guard.lock().await;
        match tokio::fs::remove_file(self.blob_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(key)),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

// ============================================================================
// Ring-routed blob access (local short-circuit or remote round trip)
// ============================================================================

async fn route_to_owner(local: &Arc<LocalNode>, key: Identifier) -> Result<Node> {
    local
        .find_successor(key)
        .await
        .map_err(|e| anyhow::anyhow!("owner lookup for {} failed: {e}", key.short()))
}

fn node_request(local: &LocalNode, method: Method, key: Identifier, from: Identifier) -> Request {
    Request {
        header: Header {
            key,
            from,
            from_addr: local.node().addr,
            caller: CallerType::Node,
            public_key: local.node().public_key,
            clock: crate::clock::get(),
            ..Header::default()
        },
        method,
        data: Vec::new(),
    }
}

async fn node_round_trip(local: &Arc<LocalNode>, owner: &Node, request: &Request) -> Result<Response> {
    let peer_key = owner
        .public_key
        .to_rsa()
        .context("owning peer has an unusable public key")?;
    let transport = Transport::dial(
        &owner.addr,
        CallerType::Node,
        local.id(),
        local.node().addr,
        peer_key,
        local.self_key(),
    )
    .await?;
    transport.round_trip(request).await
}

/// Read the blob for `key` on whichever peer owns it, enforcing that
/// `from` is the blob's recorded owner. Returns the payload without its
/// owner prefix.
pub async fn ring_get(
    local: &Arc<LocalNode>,
    store: &BlobStore,
    key: Identifier,
    from: Identifier,
) -> Result<Vec<u8>> {
    let owner = route_to_owner(local, key).await?;
    if owner == local.node() {
        let blob = store.get(key).await?;
        let (recorded, payload) =
            split_owner(&blob).ok_or(StoreError::Corrupt(key))?;
        if recorded != from {
            bail!(StoreError::OwnerMismatch);
        }
        return Ok(payload.to_vec());
    }
    let request = node_request(local, Method::GetFile, key, from);
    let response = node_round_trip(local, &owner, &request).await?;
    if !response.is_success() {
        bail!(StoreError::Refused(key));
    }
    Ok(response.data)
}

/// Write `payload` for `key` on whichever peer owns it, recording `from` as
/// the blob owner.
pub async fn ring_post(
    local: &Arc<LocalNode>,
    store: &BlobStore,
    key: Identifier,
    from: Identifier,
    payload: Vec<u8>,
) -> Result<()> {
    let owner = route_to_owner(local, key).await?;
    if owner == local.node() {
        store.put(key, with_owner(from, &payload)).await?;
        return Ok(());
    }
    let mut request = node_request(local, Method::PostFile, key, from);
    request.header.data_length = payload.len() as u64;
    request.data = payload;
    let response = node_round_trip(local, &owner, &request).await?;
    if !response.is_success() {
        bail!("peer {} rejected post for {}", owner, key.short());
    }
    Ok(())
}

/// Store a user's PEM public key on the peer owning `user_id`. The subject
/// user is recorded as the blob owner.
pub async fn publish_public_key(
    ctx: &HandlerContext,
    user_id: Identifier,
    pem: Vec<u8>,
) -> Result<()> {
    let owner = route_to_owner(&ctx.local, user_id).await?;
    if owner == ctx.local.node() {
        ctx.store.put(user_id, with_owner(user_id, &pem)).await?;
        return Ok(());
    }
    let mut request = node_request(&ctx.local, Method::PostPublicKey, user_id, ctx.local.id());
    request.header.data_length = pem.len() as u64;
    request.data = pem;
    let response = node_round_trip(&ctx.local, &owner, &request).await?;
    if !response.is_success() {
        bail!("peer {} rejected public key for {}", owner, user_id.short());
    }
    Ok(())
}

/// Fetch a user's PEM public key from the peer owning `user_id`.
pub async fn fetch_public_key(
    local: &Arc<LocalNode>,
    store: &BlobStore,
    user_id: Identifier,
) -> Result<Vec<u8>> {
    let owner = route_to_owner(local, user_id).await?;
    if owner == local.node() {
        let blob = store.get(user_id).await?;
        let (_, payload) = split_owner(&blob).ok_or(StoreError::Corrupt(user_id))?;
        return Ok(payload.to_vec());
    }
    let request = node_request(local, Method::GetPublicKey, user_id, local.id());
    let response = node_round_trip(local, &owner, &request).await?;
    if !response.is_success() {
        bail!("peer {} has no key for user {}", owner, user_id.short());
    }
    Ok(response.data)
}

// ============================================================================
// Handlers
// ============================================================================

/// Handles GetFile: ownership-checked read.
pub struct GetFileHandler;

#[async_trait]
impl Handler for GetFileHandler {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response {
        let blob = match ctx.store.get(request.header.key).await {
            Ok(blob) => blob,
            Err(e) => {
                debug!(key = request.header.key.short(), error = %e, "get failed");
                return Response::error();
            }
        };
        let Some((owner, payload)) = split_owner(&blob) else {
            warn!(key = request.header.key.short(), "stored blob is corrupt");
            return Response::error();
        };
        if owner != request.header.from {
            warn!(
                key = request.header.key.short(),
                from = request.header.from.short(),
                "ownership check failed on get"
            );
            return Response::error();
        }
        Response::success(payload.to_vec())
    }
}

/// Handles PostFile: overwrite, then append to the caller's transaction log
/// when the request carries the log flag.
pub struct PostFileHandler;

#[async_trait]
impl Handler for PostFileHandler {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response {
        let blob = with_owner(request.header.from, &request.data);
        if let Err(e) = ctx.store.put(request.header.key, blob).await {
            warn!(key = request.header.key.short(), error = %e, "post failed");
            return Response::error();
        }

        if request.header.log {
            if let Err(e) = append_log_entry(ctx, request, Operation::Update).await {
                warn!(
                    key = request.header.key.short(),
                    error = %e,
                    "transaction log append failed"
                );
                return Response::error();
            }
        }
        Response::success(Vec::new())
    }
}

/// Handles DeleteFile: ownership-checked removal plus log append.
pub struct DeleteFileHandler;

#[async_trait]
impl Handler for DeleteFileHandler {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response {
        let blob = match ctx.store.get(request.header.key).await {
            Ok(blob) => blob,
            Err(e) => {
                debug!(key = request.header.key.short(), error = %e, "delete lookup failed");
                return Response::error();
            }
        };
        let Some((owner, _)) = split_owner(&blob) else {
            warn!(key = request.header.key.short(), "stored blob is corrupt");
            return Response::error();
        };
        if owner != request.header.from {
            warn!(
                key = request.header.key.short(),
                from = request.header.from.short(),
                "ownership check failed on delete"
            );
            return Response::error();
        }
        if let Err(e) = ctx.store.delete(request.header.key).await {
            warn!(key = request.header.key.short(), error = %e, "delete failed");
            return Response::error();
        }

        if request.header.log {
            if let Err(e) = append_log_entry(ctx, request, Operation::Delete).await {
                warn!(
                    key = request.header.key.short(),
                    error = %e,
                    "transaction log append failed"
                );
                return Response::error();
            }
        }
        Response::success(Vec::new())
    }
}

/// Read-modify-write of the caller's transaction log. A missing log is an
/// empty log; every other log failure is fatal for the request.
async fn append_log_entry(
    ctx: &HandlerContext,
    request: &Request,
    operation: Operation,
) -> Result<()> {
    let Some(user_key) = ctx.user_key.as_ref() else {
        bail!("log flag set but no authenticated user key");
    };
    let mut log = match txlog::fetch_log(&ctx.local, &ctx.store, user_key).await {
        Ok(log) => log,
        Err(e) if txlog::is_not_found(&e) => Default::default(),
        Err(e) => return Err(e),
    };
    txlog::append(
        &mut log,
        &ctx.resource_name,
        request.header.key,
        operation,
        request.header.from,
        ctx.timestamp,
    );
    txlog::publish_log(&ctx.local, &ctx.store, user_key, &log).await
}

/// Handles GetPublicKey: read without ownership check; key material is
/// public.
pub struct GetPublicKeyHandler;

#[async_trait]
impl Handler for GetPublicKeyHandler {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response {
        let blob = match ctx.store.get(request.header.key).await {
            Ok(blob) => blob,
            Err(e) => {
                debug!(key = request.header.key.short(), error = %e, "public key get failed");
                return Response::error();
            }
        };
        let Some((_, payload)) = split_owner(&blob) else {
            return Response::error();
        };
        Response::success(payload.to_vec())
    }
}

/// Handles PostPublicKey: stores key material with the subject user as
/// owner.
pub struct PostPublicKeyHandler;

#[async_trait]
impl Handler for PostPublicKeyHandler {
    async fn handle(&self, ctx: &HandlerContext, request: &Request) -> Response {
        let blob = with_owner(request.header.key, &request.data);
        match ctx.store.put(request.header.key, blob).await {
            Ok(()) => Response::success(Vec::new()),
            Err(e) => {
                warn!(key = request.header.key.short(), error = %e, "public key post failed");
                Response::error()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_of(name: &str) -> Identifier {
        Identifier::hash(name.as_bytes())
    }

    #[tokio::test]
    async fn put_get_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let key = key_of("/x");
        let owner = key_of("owner");

        store.put(key, with_owner(owner, b"hello")).await.unwrap();
        let blob = store.get(key).await.unwrap();
        let (read_owner, payload) = split_owner(&blob).unwrap();
        assert_eq!(read_owner, owner);
        assert_eq!(payload, b"hello");

        store.delete(key).await.unwrap();
        assert!(matches!(
            store.get(key).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(key).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn put_overwrites_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let key = key_of("/x");
        let owner = key_of("owner");

        store.put(key, with_owner(owner, b"first")).await.unwrap();
        store.put(key, with_owner(owner, b"second")).await.unwrap();
        let blob = store.get(key).await.unwrap();
        assert_eq!(split_owner(&blob).unwrap().1, b"second");
    }

    #[test]
    fn owner_prefix_round_trip() {
        let owner = key_of("me");
        let blob = with_owner(owner, b"payload");
        assert_eq!(blob.len(), 27);
        let (read, payload) = split_owner(&blob).unwrap();
        assert_eq!(read, owner);
        assert_eq!(payload, b"payload");

        assert!(split_owner(&[0u8; 19]).is_none());
        let (empty_owner, empty_payload) = split_owner(&[0u8; 20]).unwrap();
        assert!(empty_owner.is_zero());
        assert!(empty_payload.is_empty());
    }

    #[tokio::test]
    async fn blobs_are_hex_named() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let key = key_of("/named");
        store.put(key, with_owner(key, b"x")).await.unwrap();
        assert!(dir.path().join(key.to_hex()).exists());
    }
}
