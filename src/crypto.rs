//! # Cryptographic Infrastructure
//!
//! This module provides the cryptographic primitives the secure envelope is
//! built from:
//!
//! - **Asymmetric**: RSA-2048, PKCS#1 v1.5 signing over SHA-256 digests and
//!   PKCS#1 v1.5 encryption for wrapping session keys
//! - **Symmetric**: AES-256 in CBC mode with explicit PKCS#7 padding and a
//!   fresh random 16-byte IV per message
//! - **Session keys**: 32 random bytes, RSA-wrapped to the recipient
//! - **Key files**: PEM-encoded RSA keypairs persisted in the peer's data
//!   directory
//!
//! ## Identity Model
//!
//! A peer's identity is derived from its listen address; a user's identity is
//! the SHA-1 of the canonical encoding of their RSA public key. Possession of
//! the matching private key proves either identity: every envelope carries a
//! signature over the plaintext payload, and receivers verify it against a
//! key they already trust (the trust registry for peers, the DHT-stored key
//! for users), never against the key the envelope itself carries.

use std::path::Path;

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::identity::Identifier;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// RSA modulus size for generated keypairs.
pub const RSA_KEY_BITS: usize = 2048;

/// AES block size; also the IV length.
pub const BLOCK_SIZE: usize = 16;

/// Session keys are 256-bit AES keys.
pub const SESSION_KEY_SIZE: usize = 32;

/// File names for the persisted keypair inside a peer's data directory.
pub const PRIVATE_KEY_FILE: &str = "privatekey.pem";
pub const PUBLIC_KEY_FILE: &str = "publickey.pem";

/// Error type for the primitive operations. The envelope layer maps these
/// onto wire-visible failure kinds, so variants stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// A session key could not be unwrapped or has the wrong length.
    SessionKeyInvalid,
    /// Ciphertext is empty, not block-aligned, or failed block decryption.
    CiphertextInvalid,
    /// PKCS#7 padding was malformed after decryption.
    PaddingInvalid,
    /// Signature verification failed.
    SignatureInvalid,
    /// A public key could not be reconstructed from its wire form.
    KeyRejected,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::SessionKeyInvalid => write!(f, "invalid session key"),
            CryptoError::CiphertextInvalid => write!(f, "invalid ciphertext"),
            CryptoError::PaddingInvalid => write!(f, "invalid pkcs7 padding"),
            CryptoError::SignatureInvalid => write!(f, "signature verification failed"),
            CryptoError::KeyRejected => write!(f, "public key rejected"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Wire representation of RSA public keys
// ============================================================================

/// Serializable form of an RSA public key: big-endian modulus and exponent
/// bytes. Its canonical encoding (see [`WirePublicKey::canonical_bytes`]) is
/// what user identifiers and key signatures are computed over, so the byte
/// layout must be identical on every peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePublicKey {
    pub n: Vec<u8>,
    pub e: Vec<u8>,
}

impl WirePublicKey {
    pub fn is_empty(&self) -> bool {
        self.n.is_empty()
    }

    /// Rebuild the usable RSA key. Fails with [`CryptoError::KeyRejected`]
    /// when the components do not form a valid key.
    pub fn to_rsa(&self) -> Result<RsaPublicKey, CryptoError> {
        if self.is_empty() {
            return Err(CryptoError::KeyRejected);
        }
        RsaPublicKey::new(
            BigUint::from_bytes_be(&self.n),
            BigUint::from_bytes_be(&self.e),
        )
        .map_err(|_| CryptoError::KeyRejected)
    }

    /// Canonical byte encoding used for identity derivation and key
    /// signatures.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        crate::messages::encode(self).expect("public key encoding is infallible")
    }

    /// The identifier a user with this key is addressed by on the ring.
    pub fn identifier(&self) -> Identifier {
        Identifier::hash(&self.canonical_bytes())
    }
}

impl From<&RsaPublicKey> for WirePublicKey {
    fn from(key: &RsaPublicKey) -> Self {
        Self {
            n: key.n().to_bytes_be(),
            e: key.e().to_bytes_be(),
        }
    }
}

// ============================================================================
// Keypair generation and PEM persistence
// ============================================================================

/// Generate a fresh RSA keypair.
pub fn generate_keypair() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).context("failed to generate RSA keypair")
}

/// Load the keypair from `dir`, generating and persisting a new one when the
/// private-key file does not exist yet. Both PEM files are written on
/// generation so other peers can be pointed at the public half.
pub async fn load_or_generate_keypair(dir: &Path) -> Result<RsaPrivateKey> {
    let private_path = dir.join(PRIVATE_KEY_FILE);
    if tokio::fs::try_exists(&private_path).await.unwrap_or(false) {
        let pem = tokio::fs::read_to_string(&private_path)
            .await
            .with_context(|| format!("failed to read {}", private_path.display()))?;
        return RsaPrivateKey::from_pkcs1_pem(&pem).context("failed to parse private key PEM");
    }

    let key = generate_keypair()?;
    let private_pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .context("failed to encode private key PEM")?;
    let public_pem = key
        .to_public_key()
        .to_pkcs1_pem(LineEnding::LF)
        .context("failed to encode public key PEM")?;
    tokio::fs::write(&private_path, private_pem.as_bytes())
        .await
        .with_context(|| format!("failed to write {}", private_path.display()))?;
    tokio::fs::write(dir.join(PUBLIC_KEY_FILE), public_pem.as_bytes())
        .await
        .context("failed to write public key PEM")?;
    Ok(key)
}

/// Read a peer's public key from a PEM file.
pub async fn read_public_key_pem(path: &Path) -> Result<RsaPublicKey> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    RsaPublicKey::from_pkcs1_pem(&pem).context("failed to parse public key PEM")
}

/// PEM-encode a public key; this is the payload stored in the DHT by user
/// registration.
pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String> {
    key.to_pkcs1_pem(LineEnding::LF)
        .context("failed to encode public key PEM")
}

/// Parse a PEM public key fetched from the DHT.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_pkcs1_pem(pem).map_err(|_| CryptoError::KeyRejected)
}

// ============================================================================
// Signatures
// ============================================================================

/// Sign `message` with PKCS#1 v1.5 over its SHA-256 digest. The message is
/// always the exact plaintext bytes that cross the wire.
pub fn sign(key: &RsaPrivateKey, message: &[u8]) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    signing_key.sign(message).to_vec()
}

/// Verify a PKCS#1 v1.5 signature over `message`.
pub fn verify(key: &RsaPublicKey, signature: &[u8], message: &[u8]) -> Result<(), CryptoError> {
    if signature.is_empty() {
        return Err(CryptoError::SignatureInvalid);
    }
    let verifying_key = VerifyingKey::<Sha256>::new(key.clone());
    let signature =
        Signature::try_from(signature).map_err(|_| CryptoError::SignatureInvalid)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

// ============================================================================
// Session keys
// ============================================================================

/// Generate a random session key and wrap it with the peer's public key.
/// Returns `(plaintext_key, wrapped_key)`.
pub fn generate_session_key(peer: &RsaPublicKey) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let mut key = vec![0u8; SESSION_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    let wrapped = encrypt_rsa(peer, &key)?;
    Ok((key, wrapped))
}

/// RSA-encrypt with PKCS#1 v1.5.
pub fn encrypt_rsa(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
        .map_err(|_| CryptoError::SessionKeyInvalid)
}

/// RSA-decrypt with PKCS#1 v1.5.
pub fn decrypt_rsa(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    key.decrypt(Pkcs1v15Encrypt, ciphertext)
        .map_err(|_| CryptoError::SessionKeyInvalid)
}

// ============================================================================
// AES-256-CBC with PKCS#7
// ============================================================================

fn pad_pkcs7(mut input: Vec<u8>) -> Vec<u8> {
    let padding = BLOCK_SIZE - (input.len() % BLOCK_SIZE);
    input.extend(std::iter::repeat(padding as u8).take(padding));
    input
}

fn unpad_pkcs7(input: &[u8]) -> Result<&[u8], CryptoError> {
    if input.is_empty() {
        return Err(CryptoError::PaddingInvalid);
    }
    let padding = input[input.len() - 1] as usize;
    if padding == 0 || padding > BLOCK_SIZE || padding > input.len() {
        return Err(CryptoError::PaddingInvalid);
    }
    let (body, pad) = input.split_at(input.len() - padding);
    if pad.iter().any(|&b| b as usize != padding) {
        return Err(CryptoError::PaddingInvalid);
    }
    Ok(body)
}

/// Encrypt with AES-256-CBC, returning `(ciphertext, iv)`. The IV is fresh
/// random bytes per call; the plaintext is PKCS#7-padded first.
pub fn encrypt_aes(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let mut iv = vec![0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut iv);
    let padded = pad_pkcs7(plaintext.to_vec());
    let cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|_| CryptoError::SessionKeyInvalid)?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&padded);
    Ok((ciphertext, iv))
}

/// Decrypt AES-256-CBC ciphertext and strip PKCS#7 padding.
pub fn decrypt_aes(key: &[u8], ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::CiphertextInvalid);
    }
    if iv.len() != BLOCK_SIZE {
        return Err(CryptoError::CiphertextInvalid);
    }
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| CryptoError::SessionKeyInvalid)?;
    let padded = cipher
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| CryptoError::CiphertextInvalid)?;
    unpad_pkcs7(&padded).map(|body| body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut OsRng, 2048).expect("keygen must succeed")
    }

    #[test]
    fn aes_round_trip() {
        let key = [7u8; SESSION_KEY_SIZE];
        for len in [0usize, 1, 15, 16, 17, 255, 4096] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let (ciphertext, iv) = encrypt_aes(&key, &plaintext).unwrap();
            assert_eq!(ciphertext.len() % BLOCK_SIZE, 0);
            assert_eq!(iv.len(), BLOCK_SIZE);
            let decrypted = decrypt_aes(&key, &ciphertext, &iv).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn unpad_rejects_malformed_padding() {
        // empty input
        assert_eq!(unpad_pkcs7(&[]), Err(CryptoError::PaddingInvalid));
        // pad length zero
        assert_eq!(unpad_pkcs7(&[1, 2, 0]), Err(CryptoError::PaddingInvalid));
        // pad length above block size
        assert_eq!(unpad_pkcs7(&[17u8; 32]), Err(CryptoError::PaddingInvalid));
        // pad length above input length
        assert_eq!(unpad_pkcs7(&[5, 5]), Err(CryptoError::PaddingInvalid));
        // non-uniform pad bytes
        assert_eq!(unpad_pkcs7(&[1, 2, 3, 4]), Err(CryptoError::PaddingInvalid));
        // well-formed
        assert_eq!(unpad_pkcs7(&[9, 9, 2, 2]).unwrap(), &[9, 9]);
    }

    #[test]
    fn decrypt_rejects_unaligned_ciphertext() {
        let key = [1u8; SESSION_KEY_SIZE];
        let iv = [0u8; BLOCK_SIZE];
        assert_eq!(
            decrypt_aes(&key, &[0u8; 15], &iv),
            Err(CryptoError::CiphertextInvalid)
        );
        assert_eq!(decrypt_aes(&key, &[], &iv), Err(CryptoError::CiphertextInvalid));
        assert_eq!(
            decrypt_aes(&key, &[0u8; 16], &iv[..8]),
            Err(CryptoError::CiphertextInvalid)
        );
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = test_key();
        let public = key.to_public_key();
        let message = b"the exact bytes on the wire";

        let signature = sign(&key, message);
        assert!(verify(&public, &signature, message).is_ok());
        assert_eq!(
            verify(&public, &signature, b"different bytes"),
            Err(CryptoError::SignatureInvalid)
        );

        let mut tampered = signature.clone();
        tampered[0] ^= 0x01;
        assert_eq!(
            verify(&public, &tampered, message),
            Err(CryptoError::SignatureInvalid)
        );
        assert_eq!(
            verify(&public, &[], message),
            Err(CryptoError::SignatureInvalid)
        );
    }

    #[test]
    fn session_key_wrap_unwrap() {
        let key = test_key();
        let public = key.to_public_key();

        let (plain, wrapped) = generate_session_key(&public).unwrap();
        assert_eq!(plain.len(), SESSION_KEY_SIZE);
        assert_ne!(plain, wrapped);
        assert_eq!(decrypt_rsa(&key, &wrapped).unwrap(), plain);

        let mut tampered = wrapped.clone();
        tampered[10] ^= 0xFF;
        assert_eq!(
            decrypt_rsa(&key, &tampered),
            Err(CryptoError::SessionKeyInvalid)
        );
    }

    #[test]
    fn wire_public_key_round_trip() {
        let key = test_key();
        let public = key.to_public_key();
        let wire = WirePublicKey::from(&public);
        assert_eq!(wire.to_rsa().unwrap(), public);

        let rejected = WirePublicKey::default();
        assert_eq!(rejected.to_rsa(), Err(CryptoError::KeyRejected));
    }

    #[test]
    fn user_identifier_is_stable() {
        let key = test_key();
        let wire = WirePublicKey::from(&key.to_public_key());
        assert_eq!(wire.identifier(), wire.identifier());
        let other = WirePublicKey::from(&test_key().to_public_key());
        assert_ne!(wire.identifier(), other.identifier());
    }
}
