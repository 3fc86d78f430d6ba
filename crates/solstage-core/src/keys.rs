// Solana public keys, ed25519 signing/verification, and program-derived
// address (PDA) derivation.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::hash::sha256;

// ---------------------------------------------------------------------------
// Well-known program ids
// ---------------------------------------------------------------------------

pub const MEMO_PROGRAM_ID: &str = "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr";
pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";
pub const FILTER_PROGRAM_ID: &str = "STAGYb3HZJW8CV1QEbhyc8WkLuJt44RtWHDpRgHe2pX";
pub const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
pub const TOKEN_2022_PROGRAM_ID: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";
pub const ASSOCIATED_TOKEN_PROGRAM_ID: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";
pub const METADATA_PROGRAM_ID: &str = "metaqbxxUerdq28cj1RbAWkYQm3ybzjb6a8bt518x1s";
pub const RENT_SYSVAR_ID: &str = "SysvarRent111111111111111111111111111111111";
pub const SHADOW_DRIVE_PROGRAM_ID: &str = "2e1wdyNhUvE76y6yUCvah2KaviavMJYKoRun8acMRBZZ";
pub const SHADOW_DRIVE_UPLOADER: &str = "972oJTFyjmVNsWM4GHEGPWUomAiJf2qrVotLtwnKmWem";
pub const SHDW_MINT: &str = "SHDWyBxihqiCj6YekG2GUr7wqKLeLAMK1gHZck9pL6y";

const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";
const MAX_SEED_LEN: usize = 32;
const MAX_SEEDS: usize = 16;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid base58 public key `{0}`")]
    InvalidPubkey(String),

    #[error("seed of {0} bytes exceeds the 32-byte limit")]
    SeedTooLong(usize),

    #[error("too many seeds ({0}), at most 16 allowed")]
    TooManySeeds(usize),

    #[error("no viable bump seed found")]
    NoViableBump,

    #[error("failed to read keypair file {path}: {source}")]
    KeypairIo {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed keypair file {path}: {message}")]
    KeypairFormat { path: String, message: String },
}

// ---------------------------------------------------------------------------
// Pubkey
// ---------------------------------------------------------------------------

/// A 32-byte Solana address, displayed and serialized as base58.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pubkey(pub [u8; 32]);

impl Pubkey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Pubkey(bytes)
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether the key is a valid compressed Edwards point. PDAs must not be.
    pub fn is_on_curve(&self) -> bool {
        CompressedEdwardsY(self.0).decompress().is_some()
    }

    pub fn memo_program() -> Self {
        MEMO_PROGRAM_ID.parse().expect("static memo program id")
    }

    pub fn system_program() -> Self {
        Pubkey([0u8; 32])
    }

    pub fn filter_program() -> Self {
        FILTER_PROGRAM_ID.parse().expect("static filter program id")
    }

    pub fn token_program() -> Self {
        TOKEN_PROGRAM_ID.parse().expect("static token program id")
    }

    pub fn token_2022_program() -> Self {
        TOKEN_2022_PROGRAM_ID.parse().expect("static token-2022 program id")
    }

    pub fn associated_token_program() -> Self {
        ASSOCIATED_TOKEN_PROGRAM_ID
            .parse()
            .expect("static associated token program id")
    }

    pub fn metadata_program() -> Self {
        METADATA_PROGRAM_ID.parse().expect("static metadata program id")
    }

    pub fn rent_sysvar() -> Self {
        RENT_SYSVAR_ID.parse().expect("static rent sysvar id")
    }

    pub fn shdw_mint() -> Self {
        SHDW_MINT.parse().expect("static SHDW mint")
    }
}

impl FromStr for Pubkey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|_| KeyError::InvalidPubkey(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidPubkey(s.to_string()))?;
        Ok(Pubkey(arr))
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({self})")
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// An ed25519 signing key plus its public address.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Keypair {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Load a Solana CLI keypair file: a JSON array of 64 bytes (secret
    /// followed by public key).
    pub fn read_json_file(path: &Path) -> Result<Self, KeyError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| KeyError::KeypairIo {
            path: display.clone(),
            source,
        })?;
        Self::from_json(&text).map_err(|message| KeyError::KeypairFormat {
            path: display,
            message,
        })
    }

    fn from_json(text: &str) -> Result<Self, String> {
        let bytes: Vec<u8> = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("expected 64 bytes, got {}", v.len()))?;
        let signing = SigningKey::from_keypair_bytes(&arr).map_err(|e| e.to_string())?;
        Ok(Keypair { signing })
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Detached signature over `message`, base58 encoded the way wallet
    /// adapters return `signMessage` output.
    pub fn sign_b58(&self, message: &[u8]) -> String {
        bs58::encode(self.sign(message)).into_string()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.pubkey())
    }
}

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

/// Check a base58 detached ed25519 signature of `message` by `signer`.
/// Any decoding failure counts as an invalid signature.
pub fn verify_detached(signer: &Pubkey, message: &[u8], signature_b58: &str) -> bool {
    let Ok(raw) = bs58::decode(signature_b58).into_vec() else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(raw.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&signer.0) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
}

// ---------------------------------------------------------------------------
// Program-derived addresses
// ---------------------------------------------------------------------------

/// Hash seeds into a candidate program address. Fails only on seed limits;
/// callers must check the result is off-curve.
fn hash_program_address(seeds: &[&[u8]], program_id: &Pubkey) -> Result<Pubkey, KeyError> {
    if seeds.len() > MAX_SEEDS {
        return Err(KeyError::TooManySeeds(seeds.len()));
    }
    let mut buf = Vec::with_capacity(seeds.iter().map(|s| s.len()).sum::<usize>() + 64);
    for seed in seeds {
        if seed.len() > MAX_SEED_LEN {
            return Err(KeyError::SeedTooLong(seed.len()));
        }
        buf.extend_from_slice(seed);
    }
    buf.extend_from_slice(program_id.as_bytes());
    buf.extend_from_slice(PDA_MARKER);
    Ok(Pubkey(sha256(&buf)))
}

/// Create a program address from seeds that already include the bump.
/// Returns `None` when the hash lands on the curve.
pub fn create_program_address(
    seeds: &[&[u8]],
    program_id: &Pubkey,
) -> Result<Option<Pubkey>, KeyError> {
    let key = hash_program_address(seeds, program_id)?;
    Ok((!key.is_on_curve()).then_some(key))
}

/// Find the canonical PDA for `seeds`, searching bumps from 255 down.
pub fn find_program_address(
    seeds: &[&[u8]],
    program_id: &Pubkey,
) -> Result<(Pubkey, u8), KeyError> {
    for bump in (0..=u8::MAX).rev() {
        let bump_seed = [bump];
        let mut with_bump: Vec<&[u8]> = seeds.to_vec();
        with_bump.push(&bump_seed);
        if let Some(key) = create_program_address(&with_bump, program_id)? {
            return Ok((key, bump));
        }
    }
    Err(KeyError::NoViableBump)
}

/// PDA of the owner's default filter-source account.
pub fn filter_source_pda(owner: &Pubkey, program_id: &Pubkey) -> Result<(Pubkey, u8), KeyError> {
    find_program_address(
        &[b"filterSource:".as_slice(), owner.as_bytes().as_slice(), b":default".as_slice()],
        program_id,
    )
}

/// Associated token account holding `mint` for `owner`.
pub fn associated_token_address(
    owner: &Pubkey,
    mint: &Pubkey,
    token_program: &Pubkey,
) -> Result<Pubkey, KeyError> {
    find_program_address(
        &[owner.as_bytes().as_slice(), token_program.as_bytes().as_slice(), mint.as_bytes().as_slice()],
        &Pubkey::associated_token_program(),
    )
    .map(|(key, _)| key)
}

/// Metaplex token-metadata account for `mint`.
pub fn metadata_address(mint: &Pubkey) -> Result<Pubkey, KeyError> {
    let program = Pubkey::metadata_program();
    find_program_address(
        &[b"metadata".as_slice(), program.as_bytes().as_slice(), mint.as_bytes().as_slice()],
        &program,
    )
    .map(|(key, _)| key)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
