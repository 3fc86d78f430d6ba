// Filter document: the JSON file that sorts a wallet's NFTs into stage,
// backstage, and (implicitly) junkbox.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::hash::sha256_hex;

/// Tag prefix for address entries. Other tags pass through untouched.
pub const ADDRESS_TAG: &str = "a,";

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// The three display buckets an NFT can be sorted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Stage,
    Backstage,
    Junkbox,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Stage, Bucket::Backstage, Bucket::Junkbox];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Stage => "stage",
            Bucket::Backstage => "backstage",
            Bucket::Junkbox => "junkbox",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown bucket `{0}` (expected stage, backstage or junkbox)")]
pub struct UnknownBucket(pub String);

impl FromStr for Bucket {
    type Err = UnknownBucket;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stage" => Ok(Bucket::Stage),
            "backstage" => Ok(Bucket::Backstage),
            "junkbox" => Ok(Bucket::Junkbox),
            _ => Err(UnknownBucket(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// FilterDocument
// ---------------------------------------------------------------------------

/// The off-chain filter document. Field order matters: the serialized bytes
/// are what gets hashed and anchored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDocument {
    #[serde(default)]
    pub stage: Vec<String>,
    #[serde(default)]
    pub backstage: Vec<String>,
    #[serde(default, rename = "loadFilters")]
    pub load_filters: Vec<String>,
}

/// Build the tagged entry for an NFT address.
pub fn address_key(address: &str) -> String {
    format!("{ADDRESS_TAG}{address}")
}

/// Addresses of the `a,` entries in `entries`, in order.
fn tagged_addresses(entries: &[String]) -> impl Iterator<Item = &str> {
    entries
        .iter()
        .filter_map(|e| e.strip_prefix(ADDRESS_TAG))
        .map(|rest| rest.split(',').next().unwrap_or(rest))
}

impl FilterDocument {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Compact JSON, the exact bytes that are uploaded and hashed.
    pub fn to_json(&self) -> String {
        // Vec<String> fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// SHA-256 hex of `to_json()`.
    pub fn content_hash(&self) -> String {
        sha256_hex(self.to_json().as_bytes())
    }

    pub fn stage_addresses(&self) -> impl Iterator<Item = &str> {
        tagged_addresses(&self.stage)
    }

    pub fn backstage_addresses(&self) -> impl Iterator<Item = &str> {
        tagged_addresses(&self.backstage)
    }

    pub fn stage_set(&self) -> HashSet<&str> {
        self.stage_addresses().collect()
    }

    pub fn backstage_set(&self) -> HashSet<&str> {
        self.backstage_addresses().collect()
    }

    /// Which bucket `address` currently belongs to. Stage wins if a
    /// malformed document lists it in both.
    pub fn bucket_of(&self, address: &str) -> Bucket {
        if self.stage_addresses().any(|a| a == address) {
            Bucket::Stage
        } else if self.backstage_addresses().any(|a| a == address) {
            Bucket::Backstage
        } else {
            Bucket::Junkbox
        }
    }

    fn list_mut(&mut self, bucket: Bucket) -> Option<&mut Vec<String>> {
        match bucket {
            Bucket::Stage => Some(&mut self.stage),
            Bucket::Backstage => Some(&mut self.backstage),
            Bucket::Junkbox => None,
        }
    }
}

fn remove_key(list: &mut Vec<String>, key: &str) {
    list.retain(|e| e != key);
}

/// Produce a new document with `address` moved from `from` to `to`.
///
/// The target list gains the key at the end if absent; the key is removed
/// from the other list regardless of `from`, so an address never ends up in
/// both stage and backstage. Unknown entries are left alone.
pub fn move_item(doc: &FilterDocument, address: &str, from: Bucket, to: Bucket) -> FilterDocument {
    let mut draft = doc.clone();
    if from == to {
        debug!(%address, bucket = %to, "move to same bucket, nothing to do");
        return draft;
    }

    let current = doc.bucket_of(address);
    if current != from {
        warn!(%address, %from, %current, "move source does not match document, continuing");
    }

    let key = address_key(address);
    match to {
        Bucket::Junkbox => {
            remove_key(&mut draft.stage, &key);
            remove_key(&mut draft.backstage, &key);
        }
        Bucket::Stage | Bucket::Backstage => {
            let other = if to == Bucket::Stage {
                Bucket::Backstage
            } else {
                Bucket::Stage
            };
            if let Some(list) = draft.list_mut(other) {
                remove_key(list, &key);
            }
            if let Some(list) = draft.list_mut(to) {
                if !list.contains(&key) {
                    list.push(key);
                }
            }
        }
    }
    draft
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
