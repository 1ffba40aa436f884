//! # Wire Protocol Messages
//!
//! This module defines every structure that crosses the wire and the codec
//! they share. Structures are serialized with bincode under fixed-width
//! integer encoding and a hard size limit, so the encoding is canonical and
//! identical on sender and receiver.
//!
//! ## Message Layers
//!
//! | Layer | Type | Carried as |
//! |-------|------|-----------|
//! | Frame | `u32` BE length + bytes | one [`Envelope`] per frame |
//! | Envelope | [`Envelope`] | hybrid-encrypted, signed container |
//! | Request | [`Request`] | plaintext inside the envelope |
//! | Response | [`Response`] | plaintext inside the envelope |
//!
//! A single [`Header`] struct serves envelopes, requests, and responses;
//! each layer populates the fields it needs and leaves the rest at their
//! defaults.
//!
//! ## Security Limits
//!
//! All decoding is bounded by [`MAX_DECODE_SIZE`] and frames are rejected
//! above [`MAX_FRAME_SIZE`] before any allocation, so a malicious peer
//! cannot force an oversized buffer into memory.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::crypto::WirePublicKey;
use crate::finger::Finger;
use crate::identity::{Identifier, Node};

/// Largest payload a blob operation may carry (16 MiB).
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

/// Largest frame accepted off a connection: a value plus envelope overhead.
pub const MAX_FRAME_SIZE: usize = MAX_VALUE_SIZE + 64 * 1024;

/// Decode limit handed to bincode.
pub const MAX_DECODE_SIZE: u64 = MAX_FRAME_SIZE as u64;

/// Error type for codec and framing failures.
#[derive(Debug)]
pub enum WireError {
    EncodeFailed(bincode::Error),
    DecodeFailed(bincode::Error),
    FrameTooLarge(usize),
    Io(std::io::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::EncodeFailed(e) => write!(f, "encode failed: {e}"),
            WireError::DecodeFailed(e) => write!(f, "decode failed: {e}"),
            WireError::FrameTooLarge(n) => write!(f, "frame of {n} bytes exceeds limit"),
            WireError::Io(e) => write!(f, "frame io failed: {e}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e)
    }
}

/// Bincode options shared by every encode and decode in the crate.
/// Fixed-width integers keep the encoding canonical; the limit bounds
/// allocations on decode.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DECODE_SIZE)
        .with_fixint_encoding()
}

/// Encode a wire structure canonically.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    bincode_options().serialize(value).map_err(WireError::EncodeFailed)
}

/// Decode a wire structure with size bounds enforced.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    bincode_options().deserialize(bytes).map_err(WireError::DecodeFailed)
}

/// Write one length-delimited frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), WireError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-delimited frame, rejecting oversized lengths before
/// allocating.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

// ============================================================================
// Enumerations
// ============================================================================

/// Who is making the call. Any other byte on the wire is rejected at decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallerType {
    User,
    Node,
}

impl CallerType {
    pub const fn code(self) -> u8 {
        match self {
            CallerType::User => 0,
            CallerType::Node => 1,
        }
    }
}

impl Serialize for CallerType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for CallerType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(CallerType::User),
            1 => Ok(CallerType::Node),
            other => Err(serde::de::Error::custom(format!(
                "unknown caller type {other}"
            ))),
        }
    }
}

/// Request methods. Codes are bit-distinct non-zero values and appear on the
/// wire verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    GetFile,
    PostFile,
    DeleteFile,
    GetSuccessor,
    SetPredecessor,
    GetPredecessor,
    GetFingerTable,
    UserRegistration,
    NodeRegistration,
    NodeTrust,
    GetPublicKey,
    PostPublicKey,
}

impl Method {
    pub const fn code(self) -> u64 {
        match self {
            Method::GetFile => 1,
            Method::PostFile => 1 << 1,
            Method::DeleteFile => 1 << 2,
            Method::GetSuccessor => 1 << 3,
            Method::SetPredecessor => 1 << 4,
            Method::GetPredecessor => 1 << 5,
            Method::GetFingerTable => 1 << 6,
            Method::UserRegistration => 1 << 7,
            Method::NodeRegistration => 1 << 8,
            Method::NodeTrust => 1 << 9,
            Method::GetPublicKey => 1 << 10,
            Method::PostPublicKey => 1 << 11,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => Method::GetFile,
            2 => Method::PostFile,
            4 => Method::DeleteFile,
            8 => Method::GetSuccessor,
            16 => Method::SetPredecessor,
            32 => Method::GetPredecessor,
            64 => Method::GetFingerTable,
            128 => Method::UserRegistration,
            256 => Method::NodeRegistration,
            512 => Method::NodeTrust,
            1024 => Method::GetPublicKey,
            2048 => Method::PostPublicKey,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::GetFile => "GetFile",
            Method::PostFile => "PostFile",
            Method::DeleteFile => "DeleteFile",
            Method::GetSuccessor => "GetSuccessor",
            Method::SetPredecessor => "SetPredecessor",
            Method::GetPredecessor => "GetPredecessor",
            Method::GetFingerTable => "GetFingerTable",
            Method::UserRegistration => "UserRegistration",
            Method::NodeRegistration => "NodeRegistration",
            Method::NodeTrust => "NodeTrust",
            Method::GetPublicKey => "GetPublicKey",
            Method::PostPublicKey => "PostPublicKey",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Method {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.code())
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u64::deserialize(deserializer)?;
        Method::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown method code {code}")))
    }
}

/// Response status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
}

impl Serialize for Status {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            Status::Success => 1,
            Status::Error => 2,
        })
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(Status::Success),
            2 => Ok(Status::Error),
            other => Err(serde::de::Error::custom(format!("unknown status {other}"))),
        }
    }
}

// ============================================================================
// Headers and message bodies
// ============================================================================

/// A `(recipient, wrapped key)` pair for blobs shared with multiple readers.
/// Carried on the wire; the single-owner blob layout does not consume it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharePair {
    pub id: Identifier,
    pub secret: [u8; 32],
}

/// The header used by envelopes, requests, and responses. Fields left at
/// their defaults are simply unused by that layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Header {
    /// Key of the resource being operated on.
    pub key: Identifier,
    /// Identifier of the caller.
    pub from: Identifier,
    /// Dialable address of the caller, for node callers.
    pub from_addr: String,
    /// Whether the caller is a user or a peer node.
    pub caller: CallerType,
    /// The caller's public key as carried on the wire. Never used for
    /// authentication directly; receivers verify against trusted copies.
    pub public_key: WirePublicKey,
    /// For trust introductions: who signed `public_key`.
    pub signed_by: Identifier,
    /// Envelope layer: signature over the plaintext payload. Trust
    /// introductions: signature over the introduced key's canonical bytes.
    pub signature: Vec<u8>,
    /// Length of the plaintext payload.
    pub data_length: u64,
    /// Human-readable resource name, used for transaction-log entries.
    pub resource_name: String,
    /// Lamport clock of the sender.
    pub clock: u64,
    /// Whether the operation should be appended to the caller's
    /// transaction log.
    pub log: bool,
    /// Additional readers of a shared blob.
    pub shared_with: Vec<SharePair>,
}

impl Default for CallerType {
    fn default() -> Self {
        CallerType::User
    }
}

/// A method invocation, serialized as the plaintext of an envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub header: Header,
    pub method: Method,
    pub data: Vec<u8>,
}

/// The reply to a request, likewise sealed into an envelope for the return
/// path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub header: Header,
    pub status: Status,
    pub data: Vec<u8>,
}

impl Response {
    /// An error reply. No structured detail crosses the wire.
    pub fn error() -> Self {
        Self {
            header: Header::default(),
            status: Status::Error,
            data: Vec::new(),
        }
    }

    pub fn success(data: Vec<u8>) -> Self {
        Self {
            header: Header::default(),
            status: Status::Success,
            data,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// The hybrid-encrypted container: RSA-wrapped session key, AES-CBC
/// ciphertext, and a header whose signature covers the plaintext.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub session_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

// ============================================================================
// RPC payload bodies
// ============================================================================

/// Body of a GetSuccessor request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuccessorQuery {
    pub id: Identifier,
}

/// Body of a SetPredecessor request and of a GetPredecessor response.
/// `None` means the predecessor is unknown.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PredecessorUpdate {
    pub node: Option<Node>,
}

/// Body of a GetFingerTable response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FingerTableSnapshot {
    pub fingers: Vec<Finger>,
}

/// Body of a NodeRegistration / NodeTrust response: the registrar's
/// signature over the caller's key, who signed it, and a snapshot of the
/// peers the registrar trusts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationGrant {
    pub signature: Vec<u8>,
    pub signed_by: Identifier,
    pub nodes: Vec<Node>,
}
