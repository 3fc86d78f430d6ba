// Anchor account layout and instruction data for the filter program.
//
// FilterSource account:
//   [0..8)    account discriminator
//   [8..40)   sha256 of the filter document
//   [40..44)  url length, u32 little-endian
//   [44..)    url bytes (UTF-8)

use thiserror::Error;

use crate::hash::sha256;

const DISCRIMINATOR_LEN: usize = 8;
const HASH_LEN: usize = 32;
const HEADER_LEN: usize = DISCRIMINATOR_LEN + HASH_LEN + 4;

#[derive(Debug, Error, PartialEq)]
pub enum AccountError {
    #[error("account data is {0} bytes, shorter than the 44-byte header")]
    TooShort(usize),

    #[error("account discriminator does not match FilterSource")]
    WrongDiscriminator,

    #[error("url length {len} runs past the end of {available} bytes")]
    UrlOverrun { len: usize, available: usize },

    #[error("url is not valid UTF-8")]
    UrlNotUtf8,
}

/// Anchor's 8-byte discriminator: the first bytes of sha256("<namespace>:<name>").
pub fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let digest = sha256(format!("{namespace}:{name}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

pub fn filter_source_discriminator() -> [u8; 8] {
    discriminator("account", "FilterSource")
}

/// The decoded contents of a FilterSource account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSourceAccount {
    pub hash: [u8; 32],
    pub url: String,
}

impl FilterSourceAccount {
    /// Decode raw account data. When `check_discriminator` is false the
    /// first 8 bytes are skipped without inspection.
    pub fn decode(data: &[u8], check_discriminator: bool) -> Result<Self, AccountError> {
        if data.len() < HEADER_LEN {
            return Err(AccountError::TooShort(data.len()));
        }
        if check_discriminator && data[..DISCRIMINATOR_LEN] != filter_source_discriminator() {
            return Err(AccountError::WrongDiscriminator);
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&data[DISCRIMINATOR_LEN..DISCRIMINATOR_LEN + HASH_LEN]);

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[DISCRIMINATOR_LEN + HASH_LEN..HEADER_LEN]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        let url_bytes = data
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or(AccountError::UrlOverrun {
                len,
                available: data.len() - HEADER_LEN,
            })?;
        let url = std::str::from_utf8(url_bytes)
            .map_err(|_| AccountError::UrlNotUtf8)?
            .to_string();

        Ok(FilterSourceAccount { hash, url })
    }

    /// A freshly initialized account carries a zero hash and empty url.
    pub fn is_unset(&self) -> bool {
        self.url.is_empty() || self.hash == [0u8; 32]
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Serialize in account layout. Used to build fixtures.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.url.len());
        out.extend_from_slice(&filter_source_discriminator());
        out.extend_from_slice(&self.hash);
        out.extend_from_slice(&(self.url.len() as u32).to_le_bytes());
        out.extend_from_slice(self.url.as_bytes());
        out
    }
}

/// Instruction data for `initialize()`.
pub fn encode_initialize() -> Vec<u8> {
    discriminator("global", "initialize").to_vec()
}

/// Instruction data for `set_filter(hash: [u8; 32], url: String)`.
pub fn encode_set_filter(hash: &[u8; 32], url: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 32 + 4 + url.len());
    out.extend_from_slice(&discriminator("global", "set_filter"));
    out.extend_from_slice(hash);
    out.extend_from_slice(&(url.len() as u32).to_le_bytes());
    out.extend_from_slice(url.as_bytes());
    out
}
