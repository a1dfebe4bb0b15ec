//! Nostr events as they travel through the pool.
//!
//! This module covers the parts of NIP-01 the pool depends on:
//! - The signed event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Structural validation and Schnorr signature verification
//! - Signing event templates
//! - Kind classification (which kinds keep only the newest event per author)

use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Profile metadata
pub const KIND_METADATA: u16 = 0;
/// Contact (follow) list
pub const KIND_CONTACTS: u16 = 3;
/// Write relays of the pubkey named in the `p` tag, content is a JSON array of URLs
pub const KIND_WRITE_RELAYS: u16 = 10003;

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Values of every tag named `name`, taking the element after the name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }
}

/// Event contents before the pubkey, id and signature are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Whether only the newest event per author is meaningful for `kind`.
pub fn is_replaceable_kind(kind: u16) -> bool {
    kind == KIND_METADATA || kind == KIND_CONTACTS || (10000..20000).contains(&kind)
}

/// Whether only the newest event per author and `d` tag is meaningful for `kind`.
pub fn is_parameterized_replaceable_kind(kind: u16) -> bool {
    (30000..40000).contains(&kind)
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Check the shape of a signed event without touching cryptography.
pub fn validate_event(event: &Event) -> bool {
    if !is_hex(&event.id, 64) {
        return false;
    }

    if !is_hex(&event.pubkey, 64) || event.pubkey != event.pubkey.to_lowercase() {
        return false;
    }

    if !is_hex(&event.sig, 128) {
        return false;
    }

    event.tags.iter().all(|tag| !tag.is_empty())
}

/// Compute the NIP-01 event id: sha256 of `[0, pubkey, created_at, kind, tags, content]`.
pub fn get_event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String> {
    let serialized = serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.to_byte_array()))
}

/// Structural validation, id recomputation and signature check.
pub fn verify_event(event: &Event) -> bool {
    if !validate_event(event) {
        return false;
    }

    match get_event_hash(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ) {
        Ok(id) if id == event.id => {}
        _ => return false,
    }

    let Some(message) = decode_array::<32>(&event.id).map(Message::from_digest) else {
        return false;
    };
    let Some(sig) = hex::decode(&event.sig)
        .ok()
        .and_then(|bytes| schnorr::Signature::from_slice(&bytes).ok())
    else {
        return false;
    };
    let Some(pubkey) = hex::decode(&event.pubkey)
        .ok()
        .and_then(|bytes| XOnlyPublicKey::from_slice(&bytes).ok())
    else {
        return false;
    };

    Secp256k1::verification_only()
        .verify_schnorr(&sig, &message, &pubkey)
        .is_ok()
}

fn decode_array<const N: usize>(value: &str) -> Option<[u8; N]> {
    hex::decode(value).ok()?.try_into().ok()
}

/// Derive the hex x-only public key for a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| ClientError::InvalidEvent(format!("invalid secret key: {}", e)))?;
    let (xonly_pk, _parity) = sk.x_only_public_key(&secp);
    Ok(hex::encode(xonly_pk.serialize()))
}

/// Sign an event template with a secret key, producing a complete signed event.
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| ClientError::InvalidEvent(format!("invalid secret key: {}", e)))?;
    let (xonly_pk, _parity) = sk.x_only_public_key(&secp);
    let pubkey = hex::encode(xonly_pk.serialize());

    let id = get_event_hash(
        &pubkey,
        template.created_at,
        template.kind,
        &template.tags,
        &template.content,
    )?;
    let digest = decode_array::<32>(&id)
        .ok_or_else(|| ClientError::InvalidEvent(format!("invalid id hex: {}", id)))?;

    let keypair = Keypair::from_secret_key(&secp, &sk);
    let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);

    Ok(Event {
        id,
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig: hex::encode(sig.serialize()),
    })
}
