// Transaction compilation and signing.
//
// Builds legacy (non-versioned) messages for the few instructions we send,
// and re-signs prebuilt transactions (legacy or v0) returned by Jupiter.

use base64::Engine;
use solstage_core::account::{encode_initialize, encode_set_filter};
use solstage_core::keys::{Keypair, Pubkey};
use thiserror::Error;

const SIGNATURE_LEN: usize = 64;
const VERSION_PREFIX: u8 = 0x80;
/// System program instruction index for Transfer.
const SYSTEM_TRANSFER: u32 = 2;

#[derive(Debug, Error, PartialEq)]
pub enum TxError {
    #[error("invalid recent blockhash `{0}`")]
    BadBlockhash(String),

    #[error("transaction references {0} accounts, at most 256 fit")]
    TooManyAccounts(usize),

    #[error("{0} is not a required signer of this message")]
    NotASigner(Pubkey),

    #[error("transaction is not fully signed")]
    Unsigned,

    #[error("malformed transaction: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountMeta {
    pub pubkey: Pubkey,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl AccountMeta {
    pub fn writable(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: true,
        }
    }

    pub fn readonly(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub program_id: Pubkey,
    pub accounts: Vec<AccountMeta>,
    pub data: Vec<u8>,
}

/// An SPL memo signed by `signer`.
pub fn memo_instruction(signer: &Pubkey, text: &str) -> Instruction {
    Instruction {
        program_id: Pubkey::memo_program(),
        accounts: vec![AccountMeta::readonly(*signer, true)],
        data: text.as_bytes().to_vec(),
    }
}

/// Create the owner's FilterSource account.
pub fn initialize_instruction(owner: &Pubkey, filter_source: &Pubkey, program_id: &Pubkey) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::writable(*owner, true),
            AccountMeta::writable(*filter_source, false),
            AccountMeta::readonly(Pubkey::system_program(), false),
        ],
        data: encode_initialize(),
    }
}

/// Point the owner's FilterSource account at `(url, hash)`.
pub fn set_filter_instruction(
    owner: &Pubkey,
    filter_source: &Pubkey,
    program_id: &Pubkey,
    hash: &[u8; 32],
    url: &str,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::writable(*owner, true),
            AccountMeta::writable(*filter_source, false),
        ],
        data: encode_set_filter(hash, url),
    }
}

/// Move `lamports` from `from` to `to` with the system program.
pub fn transfer_instruction(from: &Pubkey, to: &Pubkey, lamports: u64) -> Instruction {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&SYSTEM_TRANSFER.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());
    Instruction {
        program_id: Pubkey::system_program(),
        accounts: vec![
            AccountMeta::writable(*from, true),
            AccountMeta::writable(*to, false),
        ],
        data,
    }
}

// ---------------------------------------------------------------------------
// compact-u16
// ---------------------------------------------------------------------------

pub fn encode_compact_u16(mut value: u16, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        byte |= 0x80;
        out.push(byte);
    }
}

/// Returns the value and the number of bytes consumed.
pub fn decode_compact_u16(bytes: &[u8]) -> Option<(u16, usize)> {
    let mut value: u32 = 0;
    for (i, byte) in bytes.iter().take(3).enumerate() {
        value |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return u16::try_from(value).ok().map(|v| (v, i + 1));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub num_required_signatures: u8,
    pub num_readonly_signed: u8,
    pub num_readonly_unsigned: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledInstruction {
    pub program_id_index: u8,
    pub accounts: Vec<u8>,
    pub data: Vec<u8>,
}

/// A legacy transaction message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub account_keys: Vec<Pubkey>,
    pub recent_blockhash: [u8; 32],
    pub instructions: Vec<CompiledInstruction>,
}

impl Message {
    /// Order accounts as writable signers, readonly signers, writable
    /// non-signers, readonly non-signers, with the payer first.
    pub fn compile(payer: &Pubkey, instructions: &[Instruction], blockhash: &str) -> Result<Self, TxError> {
        let recent_blockhash: [u8; 32] = bs58::decode(blockhash)
            .into_vec()
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| TxError::BadBlockhash(blockhash.to_string()))?;

        // First-seen order with merged flags.
        let mut metas: Vec<AccountMeta> = vec![AccountMeta::writable(*payer, true)];
        let mut note = |meta: AccountMeta| {
            if let Some(existing) = metas.iter_mut().find(|m| m.pubkey == meta.pubkey) {
                existing.is_signer |= meta.is_signer;
                existing.is_writable |= meta.is_writable;
            } else {
                metas.push(meta);
            }
        };
        for ix in instructions {
            for meta in &ix.accounts {
                note(meta.clone());
            }
            note(AccountMeta::readonly(ix.program_id, false));
        }

        // Stable sort keeps the payer at the front of its group.
        metas.sort_by_key(|m| match (m.is_signer, m.is_writable) {
            (true, true) => 0,
            (true, false) => 1,
            (false, true) => 2,
            (false, false) => 3,
        });

        if metas.len() > 256 {
            return Err(TxError::TooManyAccounts(metas.len()));
        }

        let header = MessageHeader {
            num_required_signatures: metas.iter().filter(|m| m.is_signer).count() as u8,
            num_readonly_signed: metas.iter().filter(|m| m.is_signer && !m.is_writable).count() as u8,
            num_readonly_unsigned: metas.iter().filter(|m| !m.is_signer && !m.is_writable).count() as u8,
        };
        let account_keys: Vec<Pubkey> = metas.iter().map(|m| m.pubkey).collect();
        let index_of = |key: &Pubkey| -> u8 {
            // Every key was inserted above and there are at most 256.
            account_keys.iter().position(|k| k == key).unwrap_or_default() as u8
        };

        let compiled = instructions
            .iter()
            .map(|ix| CompiledInstruction {
                program_id_index: index_of(&ix.program_id),
                accounts: ix.accounts.iter().map(|m| index_of(&m.pubkey)).collect(),
                data: ix.data.clone(),
            })
            .collect();

        Ok(Message {
            header,
            account_keys,
            recent_blockhash,
            instructions: compiled,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![
            self.header.num_required_signatures,
            self.header.num_readonly_signed,
            self.header.num_readonly_unsigned,
        ];
        encode_compact_u16(self.account_keys.len() as u16, &mut out);
        for key in &self.account_keys {
            out.extend_from_slice(key.as_bytes());
        }
        out.extend_from_slice(&self.recent_blockhash);
        encode_compact_u16(self.instructions.len() as u16, &mut out);
        for ix in &self.instructions {
            out.push(ix.program_id_index);
            encode_compact_u16(ix.accounts.len() as u16, &mut out);
            out.extend_from_slice(&ix.accounts);
            encode_compact_u16(ix.data.len() as u16, &mut out);
            out.extend_from_slice(&ix.data);
        }
        out
    }

    fn signer_index(&self, key: &Pubkey) -> Option<usize> {
        self.account_keys
            .iter()
            .take(self.header.num_required_signatures as usize)
            .position(|k| k == key)
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub signatures: Vec<[u8; SIGNATURE_LEN]>,
    pub message: Message,
}

impl Transaction {
    pub fn new(message: Message) -> Self {
        let signatures = vec![[0u8; SIGNATURE_LEN]; message.header.num_required_signatures as usize];
        Self { signatures, message }
    }

    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), TxError> {
        let pubkey = keypair.pubkey();
        let index = self
            .message
            .signer_index(&pubkey)
            .ok_or(TxError::NotASigner(pubkey))?;
        self.signatures[index] = keypair.sign(&self.message.serialize());
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        self.signatures.iter().all(|s| s != &[0u8; SIGNATURE_LEN])
    }

    /// The fee payer's signature, base58; this is the transaction id.
    pub fn signature(&self) -> Option<String> {
        self.signatures.first().map(|s| bs58::encode(s).into_string())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_compact_u16(self.signatures.len() as u16, &mut out);
        for sig in &self.signatures {
            out.extend_from_slice(sig);
        }
        out.extend_from_slice(&self.message.serialize());
        out
    }

    pub fn to_base64(&self) -> Result<String, TxError> {
        if !self.is_signed() {
            return Err(TxError::Unsigned);
        }
        Ok(self.to_base64_partial())
    }

    /// Encode with unfilled signature slots left zeroed, for handing to a
    /// co-signer.
    pub fn to_base64_partial(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.serialize())
    }
}

/// Compile a legacy transaction paid for and signed by `keypair`.
pub fn build_signed(keypair: &Keypair, instructions: &[Instruction], blockhash: &str) -> Result<Transaction, TxError> {
    let message = Message::compile(&keypair.pubkey(), instructions, blockhash)?;
    let mut tx = Transaction::new(message);
    tx.sign(keypair)?;
    Ok(tx)
}

/// Fill in `keypair`'s signature slot of a prebuilt base64 transaction.
/// Both legacy and versioned messages are accepted.
pub fn sign_serialized(tx_base64: &str, keypair: &Keypair) -> Result<String, TxError> {
    let engine = base64::engine::general_purpose::STANDARD;
    let mut bytes = engine
        .decode(tx_base64)
        .map_err(|e| TxError::Malformed(format!("base64: {e}")))?;

    let (num_sigs, prefix) =
        decode_compact_u16(&bytes).ok_or_else(|| TxError::Malformed("signature count".into()))?;
    let message_start = prefix + num_sigs as usize * SIGNATURE_LEN;
    let message = bytes
        .get(message_start..)
        .ok_or_else(|| TxError::Malformed("truncated signatures".into()))?
        .to_vec();

    let header_at = match message.first() {
        Some(b) if b & VERSION_PREFIX != 0 => 1,
        Some(_) => 0,
        None => return Err(TxError::Malformed("empty message".into())),
    };
    let num_required = *message
        .get(header_at)
        .ok_or_else(|| TxError::Malformed("missing header".into()))? as usize;
    let keys_at = header_at + 3;
    let (num_keys, keys_prefix) = message
        .get(keys_at..)
        .and_then(decode_compact_u16)
        .ok_or_else(|| TxError::Malformed("account key count".into()))?;
    let keys_start = keys_at + keys_prefix;

    let pubkey = keypair.pubkey();
    let index = (0..(num_keys as usize).min(num_required))
        .find(|i| {
            let at = keys_start + i * 32;
            message.get(at..at + 32) == Some(pubkey.as_bytes().as_slice())
        })
        .ok_or(TxError::NotASigner(pubkey))?;
    if index >= num_sigs as usize {
        return Err(TxError::Malformed("fewer signature slots than signers".into()));
    }

    let signature = keypair.sign(&message);
    let at = prefix + index * SIGNATURE_LEN;
    bytes[at..at + SIGNATURE_LEN].copy_from_slice(&signature);
    Ok(engine.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use solstage_core::keys::verify_detached;

    const BLOCKHASH: &str = "11111111111111111111111111111111";

    fn payer() -> Keypair {
        Keypair::from_secret([1u8; 32])
    }

    #[test]
    fn compact_u16_boundaries() {
        for (value, expected) in [
            (0u16, vec![0x00]),
            (0x7f, vec![0x7f]),
            (0x80, vec![0x80, 0x01]),
            (0x3fff, vec![0xff, 0x7f]),
            (0x4000, vec![0x80, 0x80, 0x01]),
            (0xffff, vec![0xff, 0xff, 0x03]),
        ] {
            let mut out = Vec::new();
            encode_compact_u16(value, &mut out);
            assert_eq!(out, expected, "encoding {value:#x}");
            assert_eq!(decode_compact_u16(&out), Some((value, expected.len())));
        }
        assert_eq!(decode_compact_u16(&[0x80]), None);
    }

    #[test]
    fn memo_transaction_layout() {
        let kp = payer();
        let owner = kp.pubkey();
        let ixs = [memo_instruction(&owner, "a"), memo_instruction(&owner, "b")];
        let msg = Message::compile(&owner, &ixs, BLOCKHASH).unwrap();

        assert_eq!(msg.account_keys, vec![owner, Pubkey::memo_program()]);
        assert_eq!(
            msg.header,
            MessageHeader {
                num_required_signatures: 1,
                num_readonly_signed: 0,
                num_readonly_unsigned: 1,
            }
        );
        assert_eq!(msg.instructions[0].program_id_index, 1);
        assert_eq!(msg.instructions[0].accounts, vec![0]);
        assert_eq!(msg.instructions[1].data, b"b");
    }

    #[test]
    fn set_filter_accounts_are_ordered() {
        let owner = payer().pubkey();
        let pda = Pubkey::new([9u8; 32]);
        let program = Pubkey::filter_program();
        let ixs = [
            initialize_instruction(&owner, &pda, &program),
            set_filter_instruction(&owner, &pda, &program, &[0u8; 32], "u"),
        ];
        let msg = Message::compile(&owner, &ixs, BLOCKHASH).unwrap();

        assert_eq!(msg.account_keys[0], owner);
        assert_eq!(msg.account_keys[1], pda);
        // readonly non-signers, in first-seen order
        assert_eq!(&msg.account_keys[2..], &[Pubkey::system_program(), program]);
        assert_eq!(msg.header.num_readonly_unsigned, 2);
        assert_eq!(msg.instructions[0].accounts, vec![0, 1, 2]);
        assert_eq!(msg.instructions[1].program_id_index, 3);
    }

    #[test]
    fn transfer_encodes_index_and_lamports() {
        let from = payer().pubkey();
        let to = Pubkey::new([8u8; 32]);
        let ix = transfer_instruction(&from, &to, 1_500_000_000);
        assert_eq!(ix.program_id, Pubkey::system_program());
        assert_eq!(&ix.data[..4], &[2, 0, 0, 0]);
        assert_eq!(&ix.data[4..], &1_500_000_000u64.to_le_bytes());

        let msg = Message::compile(&from, &[ix], BLOCKHASH).unwrap();
        assert_eq!(msg.account_keys, vec![from, to, Pubkey::system_program()]);
        assert_eq!(
            msg.header,
            MessageHeader {
                num_required_signatures: 1,
                num_readonly_signed: 0,
                num_readonly_unsigned: 1,
            }
        );
        assert_eq!(msg.instructions[0].accounts, vec![0, 1]);
    }

    #[test]
    fn partial_encoding_leaves_cosigner_slot_empty() {
        let kp = payer();
        let cosigner = Pubkey::new([6u8; 32]);
        let ix = Instruction {
            program_id: Pubkey::memo_program(),
            accounts: vec![
                AccountMeta::readonly(kp.pubkey(), true),
                AccountMeta::readonly(cosigner, true),
            ],
            data: b"both".to_vec(),
        };
        let msg = Message::compile(&kp.pubkey(), &[ix], BLOCKHASH).unwrap();
        let mut tx = Transaction::new(msg);
        tx.sign(&kp).unwrap();
        assert!(!tx.is_signed());
        assert_eq!(tx.to_base64(), Err(TxError::Unsigned));

        let raw = base64::engine::general_purpose::STANDARD
            .decode(tx.to_base64_partial())
            .unwrap();
        assert_eq!(raw[0], 2);
        assert_eq!(&raw[1..65], &tx.signatures[0]);
        assert_eq!(&raw[65..129], &[0u8; 64]);
    }

    #[test]
    fn bad_blockhash_is_rejected() {
        let owner = payer().pubkey();
        assert!(matches!(
            Message::compile(&owner, &[], "not-base58-0OIl"),
            Err(TxError::BadBlockhash(_))
        ));
    }

    #[test]
    fn signed_transaction_verifies() {
        let kp = payer();
        let tx = build_signed(&kp, &[memo_instruction(&kp.pubkey(), "gm")], BLOCKHASH).unwrap();
        assert!(tx.is_signed());

        let sig = tx.signature().unwrap();
        assert!(verify_detached(&kp.pubkey(), &tx.message.serialize(), &sig));

        let bytes = tx.serialize();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..65], &tx.signatures[0]);
    }

    #[test]
    fn unsigned_transaction_cannot_be_encoded() {
        let kp = payer();
        let msg = Message::compile(&kp.pubkey(), &[memo_instruction(&kp.pubkey(), "x")], BLOCKHASH).unwrap();
        assert_eq!(Transaction::new(msg).to_base64(), Err(TxError::Unsigned));
    }

    #[test]
    fn foreign_keypair_cannot_sign() {
        let kp = payer();
        let msg = Message::compile(&kp.pubkey(), &[], BLOCKHASH).unwrap();
        let other = Keypair::from_secret([2u8; 32]);
        assert_eq!(
            Transaction::new(msg).sign(&other),
            Err(TxError::NotASigner(other.pubkey()))
        );
    }

    #[test]
    fn sign_serialized_fills_legacy_slot() {
        let kp = payer();
        let msg = Message::compile(&kp.pubkey(), &[memo_instruction(&kp.pubkey(), "x")], BLOCKHASH).unwrap();
        let unsigned = Transaction::new(msg.clone());
        let encoded = base64::engine::general_purpose::STANDARD.encode(unsigned.serialize());

        let signed = sign_serialized(&encoded, &kp).unwrap();
        let mut expected = Transaction::new(msg);
        expected.sign(&kp).unwrap();
        assert_eq!(signed, expected.to_base64().unwrap());
    }

    #[test]
    fn sign_serialized_handles_versioned_message() {
        let kp = payer();
        let legacy = Message::compile(&kp.pubkey(), &[memo_instruction(&kp.pubkey(), "x")], BLOCKHASH)
            .unwrap()
            .serialize();
        // v0: version byte, legacy body, empty lookup table list.
        let mut message = vec![VERSION_PREFIX];
        message.extend_from_slice(&legacy);
        message.push(0);

        let mut raw = vec![1u8];
        raw.extend_from_slice(&[0u8; 64]);
        raw.extend_from_slice(&message);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&raw);

        let signed = base64::engine::general_purpose::STANDARD
            .decode(sign_serialized(&encoded, &kp).unwrap())
            .unwrap();
        let sig = bs58::encode(&signed[1..65]).into_string();
        assert!(verify_detached(&kp.pubkey(), &message, &sig));
        assert_eq!(&signed[65..], message.as_slice());
    }

    #[test]
    fn sign_serialized_rejects_foreign_transaction() {
        let kp = payer();
        let other = Keypair::from_secret([5u8; 32]);
        let msg = Message::compile(&other.pubkey(), &[], BLOCKHASH).unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(Transaction::new(msg).serialize());
        assert_eq!(
            sign_serialized(&encoded, &kp),
            Err(TxError::NotASigner(kp.pubkey()))
        );
    }

    #[test]
    fn sign_serialized_rejects_garbage() {
        assert!(matches!(
            sign_serialized("%%%", &payer()),
            Err(TxError::Malformed(_))
        ));
    }
}
