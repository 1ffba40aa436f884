//! # Per-User Transaction Log
//!
//! Every user has one append-only log of Update/Delete events, stored in the
//! ring like any other blob under the key
//! `SHA1(canonical_encoding(public_key) || "-transaction-log")`. Peers
//! read-modify-write it when handling logged file operations; clients fetch
//! it to reconcile a local directory.
//!
//! ## Current-Entry Rule
//!
//! The entry that decides a resource's fate is the one with the maximum
//! Lamport timestamp; ties go to the later append. The pure merge planner
//! ([`plan`]) compares the current entries of a previously seen log and a
//! freshly fetched one and names the action that reconciles them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chord::LocalNode;
use crate::crypto::WirePublicKey;
use crate::identity::Identifier;
use crate::messages;
use crate::store::{self, BlobStore, StoreError};

/// Suffix appended to the canonical key encoding to derive the log key.
const LOG_KEY_SUFFIX: &[u8] = b"-transaction-log";

/// Error type for log serialization problems.
#[derive(Debug)]
pub enum LogError {
    /// The stored log bytes could not be decoded.
    Serialization(String),
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Serialization(e) => write!(f, "transaction log is unreadable: {e}"),
        }
    }
}

impl std::error::Error for LogError {}

/// What happened to a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Update,
    Delete,
}

/// One logged event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub operation: Operation,
    pub client_id: Identifier,
    pub timestamp: u64,
}

/// The full history of one resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEntity {
    pub resource_name: String,
    pub resource_id: Identifier,
    pub entries: Vec<TransactionEntry>,
}

impl TransactionEntity {
    /// The deciding entry: maximum timestamp, later append wins ties.
    pub fn current(&self) -> Option<&TransactionEntry> {
        let mut best: Option<&TransactionEntry> = None;
        for entry in &self.entries {
            match best {
                None => best = Some(entry),
                Some(current) if entry.timestamp >= current.timestamp => best = Some(entry),
                Some(_) => {}
            }
        }
        best
    }
}

/// Resource name → history.
pub type TransactionLog = HashMap<String, TransactionEntity>;

/// The ring key a user's log lives under.
pub fn log_key(user_key: &WirePublicKey) -> Identifier {
    let mut material = user_key.canonical_bytes();
    material.extend_from_slice(LOG_KEY_SUFFIX);
    Identifier::hash(&material)
}

/// Append an event to `log`, creating the resource history on first sight.
pub fn append(
    log: &mut TransactionLog,
    resource_name: &str,
    resource_id: Identifier,
    operation: Operation,
    client_id: Identifier,
    timestamp: u64,
) {
    let entry = TransactionEntry {
        operation,
        client_id,
        timestamp,
    };
    log.entry(resource_name.to_string())
        .or_insert_with(|| TransactionEntity {
            resource_name: resource_name.to_string(),
            resource_id,
            entries: Vec::new(),
        })
        .entries
        .push(entry);
}

/// Decode a log fetched from the ring.
pub fn decode_log(bytes: &[u8]) -> Result<TransactionLog, LogError> {
    if bytes.is_empty() {
        return Ok(TransactionLog::default());
    }
    messages::decode(bytes).map_err(|e| LogError::Serialization(e.to_string()))
}

/// Encode a log for storage in the ring.
pub fn encode_log(log: &TransactionLog) -> Result<Vec<u8>, LogError> {
    messages::encode(log).map_err(|e| LogError::Serialization(e.to_string()))
}

/// Whether an error chain bottoms out in "the log simply is not there yet":
/// a local miss, or a refusal from the owning peer (the wire carries no
/// structured detail, so a remote miss looks like a refusal).
pub fn is_not_found(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(
            cause.downcast_ref(),
            Some(StoreError::NotFound(_)) | Some(StoreError::Refused(_))
        )
    })
}

/// Fetch the user's log from whichever peer owns it. The blob is owned by
/// the user's identifier, so the read is performed on the user's behalf.
pub async fn fetch_log(
    local: &Arc<LocalNode>,
    store: &BlobStore,
    user_key: &WirePublicKey,
) -> Result<TransactionLog> {
    let key = log_key(user_key);
    let user_id = user_key.identifier();
    let bytes = store::ring_get(local, store, key, user_id).await?;
    debug!(user = user_id.short(), entries = bytes.len(), "fetched transaction log");
    Ok(decode_log(&bytes)?)
}

/// Write the user's log back to its owning peer. Log writes never set the
/// log flag themselves; appending to the log must not recurse into it.
pub async fn publish_log(
    local: &Arc<LocalNode>,
    store: &BlobStore,
    user_key: &WirePublicKey,
    log: &TransactionLog,
) -> Result<()> {
    let key = log_key(user_key);
    let user_id = user_key.identifier();
    let bytes = encode_log(log)?;
    store::ring_post(local, store, key, user_id, bytes).await
}

// ============================================================================
// Merge planning
// ============================================================================

/// The reconciling action for one resource, comparing the history we acted
/// on last time against the freshly fetched one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeAction {
    /// Remote history is new to us or strictly newer with an Update: fetch
    /// the resource.
    FetchRemote,
    /// Remote history is strictly newer with a Delete: remove the local
    /// file.
    DeleteLocal,
    /// Our last-seen history is strictly newer with an Update: push the
    /// local file.
    PushLocal,
    /// Our last-seen history is strictly newer with a Delete: delete the
    /// resource remotely.
    DeleteRemote,
    /// Histories agree.
    Noop,
}

/// Decide how to reconcile one resource. `last_seen` is the entity from the
/// log snapshot taken at the previous synchronization pass, `fetched` the
/// entity in the log just pulled from the ring.
pub fn plan(last_seen: Option<&TransactionEntity>, fetched: &TransactionEntity) -> MergeAction {
    let Some(remote_current) = fetched.current() else {
        return MergeAction::Noop;
    };
    let Some(local_entity) = last_seen else {
        // never seen before: a live resource is fetched, a deleted one has
        // nothing to materialize
        return match remote_current.operation {
            Operation::Update => MergeAction::FetchRemote,
            Operation::Delete => MergeAction::Noop,
        };
    };
    let Some(local_current) = local_entity.current() else {
        return match remote_current.operation {
            Operation::Update => MergeAction::FetchRemote,
            Operation::Delete => MergeAction::Noop,
        };
    };

    if local_current.timestamp < remote_current.timestamp {
        match remote_current.operation {
            Operation::Delete => MergeAction::DeleteLocal,
            Operation::Update => MergeAction::FetchRemote,
        }
    } else if local_current.timestamp == remote_current.timestamp {
        MergeAction::Noop
    } else {
        match local_current.operation {
            Operation::Delete => MergeAction::DeleteRemote,
            Operation::Update => MergeAction::PushLocal,
        }
    }
}
