//! Ledger data types and the fixed-width tryte layout of a transaction.
//!
//! A transaction travels over the node API as 2673 trytes. Only the field
//! layout is handled here; hashing and nonce search are delegated to a
//! [`ProofOfWork`](crate::pow::ProofOfWork) implementation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// 81-tryte transaction or bundle hash.
pub type Hash = String;

/// A bundle in index order (`current_index` 0 first).
pub type Bundle = Vec<TransactionBody>;

pub const TRYTE_ALPHABET: &[u8; 27] = b"9ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const HASH_LEN: usize = 81;
pub const ADDRESS_WITH_CHECKSUM_LEN: usize = 90;
pub const TAG_LEN: usize = 27;
pub const TRANSACTION_LEN: usize = 2673;

/// Address the coordinator issues milestones from.
pub const MILESTONE_ADDRESS: &str =
    "KPWCHICGJZXKE9GSUDXZYUAPLHAKAHYHDXNPHENTERYMMBQOPSQIDENXKLKCEYCPVTZQLEEJVYJZV9BWU";

// Field offsets within a transaction's trytes
const SIGNATURE: (usize, usize) = (0, 2187);
const ADDRESS: (usize, usize) = (2187, 2268);
const VALUE: (usize, usize) = (2268, 2295);
const OBSOLETE_TAG: (usize, usize) = (2295, 2322);
const TIMESTAMP: (usize, usize) = (2322, 2331);
const CURRENT_INDEX: (usize, usize) = (2331, 2340);
const LAST_INDEX: (usize, usize) = (2340, 2349);
const BUNDLE: (usize, usize) = (2349, 2430);
const TRUNK: (usize, usize) = (2430, 2511);
const BRANCH: (usize, usize) = (2511, 2592);
const TAG: (usize, usize) = (2592, 2619);
const ATTACHMENT_TIMESTAMP: (usize, usize) = (2619, 2628);
const ATTACHMENT_LOWER: (usize, usize) = (2628, 2637);
const ATTACHMENT_UPPER: (usize, usize) = (2637, 2646);
const NONCE: (usize, usize) = (2646, 2673);

/// Only the low 33 trits of the value field are significant.
const VALUE_SIGNIFICANT_TRYTES: usize = 11;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrytesError {
    #[error("'{field}' contains characters outside 9A-Z")]
    InvalidCharacter { field: &'static str },

    #[error("'{field}' has {actual} trytes, expected {expected}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("'{field}' value {value} does not fit in {len} trytes")]
    Overflow {
        field: &'static str,
        value: i64,
        len: usize,
    },
}

pub fn is_trytes(s: &str) -> bool {
    s.bytes().all(|b| b == b'9' || b.is_ascii_uppercase())
}

/// Pad `tag` with `9` and cut it to exactly 27 characters.
///
/// Tags read back from the ledger are always 27 trytes, so this is the form
/// a user tag must take before comparing it with one.
pub fn pad_tag(tag: &str) -> String {
    tag.chars()
        .chain(std::iter::repeat('9'))
        .take(TAG_LEN)
        .collect()
}

fn tryte_value(c: u8) -> Option<i64> {
    match c {
        b'9' => Some(0),
        b'A'..=b'M' => Some((c - b'A') as i64 + 1),
        b'N'..=b'Z' => Some((c - b'N') as i64 - 13),
        _ => None,
    }
}

fn tryte_char(v: i64) -> char {
    let idx = if v < 0 { v + 27 } else { v };
    TRYTE_ALPHABET[idx as usize] as char
}

fn encode_int(field: &'static str, value: i64, len: usize) -> Result<String, TrytesError> {
    let mut out = String::with_capacity(len);
    let mut rest = value;
    for _ in 0..len {
        let mut digit = rest.rem_euclid(27);
        if digit > 13 {
            digit -= 27;
        }
        out.push(tryte_char(digit));
        rest = (rest - digit) / 27;
    }
    if rest != 0 {
        return Err(TrytesError::Overflow { field, value, len });
    }
    Ok(out)
}

fn decode_int(field: &'static str, trytes: &str) -> Result<i64, TrytesError> {
    trytes.bytes().rev().try_fold(0i64, |acc, c| {
        let v = tryte_value(c).ok_or(TrytesError::InvalidCharacter { field })?;
        acc.checked_mul(27)
            .and_then(|acc| acc.checked_add(v))
            .ok_or(TrytesError::Overflow {
                field,
                value: acc,
                len: trytes.len(),
            })
    })
}

fn pad_field(field: &'static str, value: &str, len: usize) -> Result<String, TrytesError> {
    if !is_trytes(value) {
        return Err(TrytesError::InvalidCharacter { field });
    }
    if value.len() > len {
        return Err(TrytesError::InvalidLength {
            field,
            expected: len,
            actual: value.len(),
        });
    }
    let mut out = String::with_capacity(len);
    out.push_str(value);
    while out.len() < len {
        out.push('9');
    }
    Ok(out)
}

/// One ledger transaction, as far as the engine reads or rewires it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionBody {
    pub hash: Hash,
    pub signature_message_fragment: String,
    pub address: String,
    pub value: i64,
    pub obsolete_tag: String,
    pub timestamp: i64,
    pub current_index: i64,
    pub last_index: i64,
    pub bundle: Hash,
    pub trunk_transaction: Hash,
    pub branch_transaction: Hash,
    pub tag: String,
    pub attachment_timestamp: i64,
    pub attachment_timestamp_lower_bound: i64,
    pub attachment_timestamp_upper_bound: i64,
    pub nonce: String,
}

impl TransactionBody {
    /// Decode the 2673-tryte wire form. The hash is not part of the
    /// encoding and is taken from the caller.
    pub fn from_trytes(hash: impl Into<Hash>, trytes: &str) -> Result<Self, TrytesError> {
        if trytes.len() != TRANSACTION_LEN {
            return Err(TrytesError::InvalidLength {
                field: "transaction",
                expected: TRANSACTION_LEN,
                actual: trytes.len(),
            });
        }
        if !is_trytes(trytes) {
            return Err(TrytesError::InvalidCharacter {
                field: "transaction",
            });
        }
        let field = |(start, end): (usize, usize)| trytes[start..end].to_string();
        let value_trytes = &trytes[VALUE.0..VALUE.1];

        Ok(Self {
            hash: hash.into(),
            signature_message_fragment: field(SIGNATURE),
            address: field(ADDRESS),
            value: decode_int("value", &value_trytes[..VALUE_SIGNIFICANT_TRYTES])?,
            obsolete_tag: field(OBSOLETE_TAG),
            timestamp: decode_int("timestamp", &trytes[TIMESTAMP.0..TIMESTAMP.1])?,
            current_index: decode_int("currentIndex", &trytes[CURRENT_INDEX.0..CURRENT_INDEX.1])?,
            last_index: decode_int("lastIndex", &trytes[LAST_INDEX.0..LAST_INDEX.1])?,
            bundle: field(BUNDLE),
            trunk_transaction: field(TRUNK),
            branch_transaction: field(BRANCH),
            tag: field(TAG),
            attachment_timestamp: decode_int(
                "attachmentTimestamp",
                &trytes[ATTACHMENT_TIMESTAMP.0..ATTACHMENT_TIMESTAMP.1],
            )?,
            attachment_timestamp_lower_bound: decode_int(
                "attachmentTimestampLowerBound",
                &trytes[ATTACHMENT_LOWER.0..ATTACHMENT_LOWER.1],
            )?,
            attachment_timestamp_upper_bound: decode_int(
                "attachmentTimestampUpperBound",
                &trytes[ATTACHMENT_UPPER.0..ATTACHMENT_UPPER.1],
            )?,
            nonce: field(NONCE),
        })
    }

    /// Encode into the 2673-tryte wire form. Short text fields are padded
    /// with `9`.
    pub fn to_trytes(&self) -> Result<String, TrytesError> {
        let len = |(start, end): (usize, usize)| end - start;
        let mut out = String::with_capacity(TRANSACTION_LEN);

        out.push_str(&pad_field(
            "signatureMessageFragment",
            &self.signature_message_fragment,
            len(SIGNATURE),
        )?);
        out.push_str(&pad_field("address", &self.address, len(ADDRESS))?);
        out.push_str(&encode_int("value", self.value, len(VALUE))?);
        out.push_str(&pad_field("obsoleteTag", &self.obsolete_tag, len(OBSOLETE_TAG))?);
        out.push_str(&encode_int("timestamp", self.timestamp, len(TIMESTAMP))?);
        out.push_str(&encode_int("currentIndex", self.current_index, len(CURRENT_INDEX))?);
        out.push_str(&encode_int("lastIndex", self.last_index, len(LAST_INDEX))?);
        out.push_str(&pad_field("bundle", &self.bundle, len(BUNDLE))?);
        out.push_str(&pad_field("trunkTransaction", &self.trunk_transaction, len(TRUNK))?);
        out.push_str(&pad_field("branchTransaction", &self.branch_transaction, len(BRANCH))?);
        out.push_str(&pad_field("tag", &self.tag, len(TAG))?);
        out.push_str(&encode_int(
            "attachmentTimestamp",
            self.attachment_timestamp,
            len(ATTACHMENT_TIMESTAMP),
        )?);
        out.push_str(&encode_int(
            "attachmentTimestampLowerBound",
            self.attachment_timestamp_lower_bound,
            len(ATTACHMENT_LOWER),
        )?);
        out.push_str(&encode_int(
            "attachmentTimestampUpperBound",
            self.attachment_timestamp_upper_bound,
            len(ATTACHMENT_UPPER),
        )?);
        out.push_str(&pad_field("nonce", &self.nonce, len(NONCE))?);

        Ok(out)
    }

    pub fn is_milestone(&self, milestone_address: &str) -> bool {
        !milestone_address.is_empty() && self.address.contains(milestone_address)
    }
}

/// A trunk/branch pair to attach to, with both bodies resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tips {
    pub trunk_hash: Hash,
    pub branch_hash: Hash,
    pub trunk: TransactionBody,
    pub branch: TransactionBody,
}

/// Unresolved result of a tip-selection call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipHashes {
    pub trunk_transaction: Hash,
    pub branch_transaction: Hash,
}

/// Work item: a prepared bundle and the pair it will reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub trunk: Hash,
    pub branch: Hash,
    pub bundle: Bundle,
}

impl Transaction {
    /// Hash shown to users: the bundle hash for multi-entry bundles,
    /// otherwise the single transaction's hash.
    pub fn display_hash(&self) -> Option<&str> {
        match self.bundle.as_slice() {
            [] => None,
            [single] => Some(single.hash.as_str()),
            [first, ..] => Some(first.bundle.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub url: String,
    /// The node accepts `attachToTangle`, so PoW can run remotely.
    pub supports_remote_attach: bool,
}

impl Node {
    pub fn new(url: impl Into<String>, supports_remote_attach: bool) -> Self {
        Self {
            url: url.into(),
            supports_remote_attach,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)?;
        if self.supports_remote_attach {
            write!(f, " (remote PoW)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub address: String,
    pub value: i64,
    pub tag: String,
    pub message: String,
}

/// Number of key fragments used for signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SecurityLevel {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
}

impl TryFrom<u8> for SecurityLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(SecurityLevel::Low),
            2 => Ok(SecurityLevel::Medium),
            3 => Ok(SecurityLevel::High),
            other => Err(format!("security level must be 1, 2 or 3, got {}", other)),
        }
    }
}

impl From<SecurityLevel> for u8 {
    fn from(level: SecurityLevel) -> Self {
        level as u8
    }
}

/// Throwaway 81-tryte seed. Wiped from memory on drop.
pub struct Seed(Zeroizing<String>);

impl Seed {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let seed: String = (0..HASH_LEN)
            .map(|_| TRYTE_ALPHABET[rng.gen_range(0..TRYTE_ALPHABET.len())] as char)
            .collect();
        Self(Zeroizing::new(seed))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(<redacted>)")
    }
}

/// Validate a destination address and strip its checksum, if present.
pub fn normalize_address(address: &str) -> Result<String, TrytesError> {
    if !is_trytes(address) {
        return Err(TrytesError::InvalidCharacter { field: "address" });
    }
    match address.len() {
        HASH_LEN => Ok(address.to_string()),
        ADDRESS_WITH_CHECKSUM_LEN => Ok(address[..HASH_LEN].to_string()),
        actual => Err(TrytesError::InvalidLength {
            field: "address",
            expected: HASH_LEN,
            actual,
        }),
    }
}
