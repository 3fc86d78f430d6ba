// Memo codec for filter pointers anchored through the SPL memo program.
//
// A pointer transaction carries two memo instructions:
//
//   Payload:url:'<url>'; hash:'<sha256 hex>'; blockSlot:'<slot>'
//   Signature:<base58 ed25519 signature of the text after "Payload:">
//
// `getSignaturesForAddress` reports all memos of a transaction in a single
// string of the form `[<len>] <memo>; [<len>] <memo>`.

use std::fmt;

use thiserror::Error;

use crate::keys::{verify_detached, Keypair, Pubkey};

pub const PAYLOAD_PREFIX: &str = "Payload:";
pub const SIGNATURE_PREFIX: &str = "Signature:";

#[derive(Debug, Error, PartialEq)]
pub enum MemoError {
    #[error("memo field has {0} entries, expected exactly 2")]
    WrongMemoCount(usize),

    #[error("first memo is not a `Payload:` entry")]
    MissingPayload,

    #[error("second memo is not a `Signature:` entry")]
    MissingSignature,

    #[error("payload does not match url/hash/blockSlot layout")]
    MalformedPayload,

    #[error("blockSlot `{0}` is not a slot number")]
    BadBlockSlot(String),
}

// ---------------------------------------------------------------------------
// Memo field splitting
// ---------------------------------------------------------------------------

/// Split an RPC memo field into its individual memos. Lengths are byte
/// counts; scanning stops at the first malformed entry.
pub fn split_memo_field(field: &str) -> Vec<&str> {
    let mut memos = Vec::new();
    let mut pos = 0;

    while pos < field.len() {
        let Some(rest) = field.get(pos..) else {
            break;
        };
        if !rest.starts_with('[') {
            break;
        }
        let Some(close) = rest.find(']').map(|i| pos + i) else {
            break;
        };
        let Ok(len) = field[pos + 1..close].trim().parse::<usize>() else {
            break;
        };
        let start = close + 2;
        let end = start + len;
        let Some(text) = field.get(start..end) else {
            break;
        };
        memos.push(text);
        pos = end + 2;
    }

    memos
}

// ---------------------------------------------------------------------------
// PointerPayload
// ---------------------------------------------------------------------------

/// The signed part of a memo pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerPayload {
    pub url: String,
    pub hash: String,
    pub block_slot: u64,
}

impl PointerPayload {
    pub fn new(url: impl Into<String>, hash: impl Into<String>, block_slot: u64) -> Self {
        PointerPayload {
            url: url.into(),
            hash: hash.into(),
            block_slot,
        }
    }

    /// Canonical text form; this is the exact message that gets signed.
    pub fn render(&self) -> String {
        format!(
            "url:'{}'; hash:'{}'; blockSlot:'{}'",
            self.url, self.hash, self.block_slot
        )
    }

    /// Parse the text form. Each field ends at the first `'` that starts the
    /// next field's delimiter, so urls may not contain `'; hash:'`.
    pub fn parse(text: &str) -> Result<Self, MemoError> {
        let (_, rest) = text.split_once("url:'").ok_or(MemoError::MalformedPayload)?;
        let (url, rest) = rest.split_once("'; hash:'").ok_or(MemoError::MalformedPayload)?;
        let (hash, rest) = rest
            .split_once("'; blockSlot:'")
            .ok_or(MemoError::MalformedPayload)?;
        let (slot, _) = rest.split_once('\'').ok_or(MemoError::MalformedPayload)?;

        if url.is_empty() || hash.is_empty() || slot.is_empty() {
            return Err(MemoError::MalformedPayload);
        }
        let block_slot = slot
            .parse::<u64>()
            .map_err(|_| MemoError::BadBlockSlot(slot.to_string()))?;

        Ok(PointerPayload {
            url: url.to_string(),
            hash: hash.to_string(),
            block_slot,
        })
    }
}

impl fmt::Display for PointerPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

// ---------------------------------------------------------------------------
// SignedPayload
// ---------------------------------------------------------------------------

/// A payload plus the owner's detached signature, as carried by the two
/// memos of a pointer transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    /// Signed text, exactly as it appeared after `Payload:`.
    pub text: String,
    pub signature: String,
    pub payload: PointerPayload,
}

impl SignedPayload {
    pub fn sign(payload: PointerPayload, keypair: &Keypair) -> Self {
        let text = payload.render();
        let signature = keypair.sign_b58(text.as_bytes());
        SignedPayload {
            text,
            signature,
            payload,
        }
    }

    /// Extract from an RPC memo field, which must hold exactly the payload
    /// memo followed by the signature memo.
    pub fn from_memo_field(field: &str) -> Result<Self, MemoError> {
        let memos = split_memo_field(field);
        if memos.len() != 2 {
            return Err(MemoError::WrongMemoCount(memos.len()));
        }
        let text = memos[0]
            .strip_prefix(PAYLOAD_PREFIX)
            .filter(|t| !t.is_empty())
            .ok_or(MemoError::MissingPayload)?;
        let signature = memos[1]
            .strip_prefix(SIGNATURE_PREFIX)
            .filter(|s| !s.is_empty())
            .ok_or(MemoError::MissingSignature)?;
        let payload = PointerPayload::parse(text)?;

        Ok(SignedPayload {
            text: text.to_string(),
            signature: signature.to_string(),
            payload,
        })
    }

    /// Whether `signer` produced the signature over the payload text.
    pub fn verify(&self, signer: &Pubkey) -> bool {
        verify_detached(signer, self.text.as_bytes(), &self.signature)
    }

    /// The two memo instruction texts, in transaction order.
    pub fn memos(&self) -> [String; 2] {
        [
            format!("{PAYLOAD_PREFIX}{}", self.text),
            format!("{SIGNATURE_PREFIX}{}", self.signature),
        ]
    }
}

/// Render memos the way RPC nodes report them in signature info.
pub fn join_memo_field(memos: &[String]) -> String {
    memos
        .iter()
        .map(|m| format!("[{}] {}", m.len(), m))
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
