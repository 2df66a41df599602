//! Read-key distribution inside a group map.
//!
//! A group stores its keys under map entries:
//!
//! - `readKey` → id of the current read key
//! - `<keyID>_for_<member>` → the key sealed to the member's sealer
//!   (`<keyID>_for_everyone` holds the key in the clear)
//! - `<oldKeyID>_for_<newKeyID>` → the old key encrypted under the new one
//!
//! The last kind forms the key-chain: whoever holds the newest key can walk
//! back to every older one.

use std::fmt;

use coweave_core::{CoID, CryptoProvider, KeyID, KeySecret, ReadKey, SealerID, SealerSecret};

use crate::error::{PermsError, Result};
use crate::role::MemberID;

pub const READ_KEY: &str = "readKey";
const FOR: &str = "_for_";

/// A parsed group map key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKey {
    Member(MemberID),
    ReadKey,
    Reveal { key: KeyID, to: MemberID },
    KeyChain { old: KeyID, new: KeyID },
    Other(String),
}

impl GroupKey {
    pub fn parse(s: &str) -> Self {
        if s == READ_KEY {
            return GroupKey::ReadKey;
        }
        if let Some((left, right)) = s.split_once(FOR) {
            if let Ok(key) = left.parse::<KeyID>() {
                if let Ok(new) = right.parse::<KeyID>() {
                    return GroupKey::KeyChain { old: key, new };
                }
                if let Ok(to) = right.parse::<MemberID>() {
                    return GroupKey::Reveal { key, to };
                }
            }
            return GroupKey::Other(s.to_string());
        }
        match s.parse::<MemberID>() {
            Ok(member) => GroupKey::Member(member),
            Err(_) => GroupKey::Other(s.to_string()),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Member(member) => write!(f, "{member}"),
            GroupKey::ReadKey => f.write_str(READ_KEY),
            GroupKey::Reveal { key, to } => write!(f, "{key}{FOR}{to}"),
            GroupKey::KeyChain { old, new } => write!(f, "{old}{FOR}{new}"),
            GroupKey::Other(s) => f.write_str(s),
        }
    }
}

fn material(group: &CoID, map_key: &str) -> Vec<u8> {
    let mut m = group.as_bytes().to_vec();
    m.extend_from_slice(map_key.as_bytes());
    m
}

fn secret_from_bytes(bytes: Vec<u8>) -> Result<KeySecret> {
    let arr: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        PermsError::MissingReadKey(format!("invalid key length: expected 32, got {}", b.len()))
    })?;
    Ok(KeySecret::from_bytes(arr))
}

fn value_bytes(value: &serde_json::Value) -> Result<Vec<u8>> {
    let s = value
        .as_str()
        .ok_or_else(|| PermsError::MissingReadKey("key entry is not a string".into()))?;
    hex::decode(s).map_err(|e| PermsError::MissingReadKey(e.to_string()))
}

/// Map entry revealing `key` to `to`.
///
/// `sealer` is required for accounts and agents; `everyone` gets the key in
/// the clear.
pub fn reveal_entry(
    crypto: &dyn CryptoProvider,
    group: &CoID,
    key: &ReadKey,
    to: &MemberID,
    sealer: Option<&SealerID>,
) -> Result<(String, serde_json::Value)> {
    let map_key = GroupKey::Reveal { key: key.id, to: *to }.to_string();
    let value = match (to, sealer) {
        (MemberID::Everyone, _) => hex::encode(key.secret.as_bytes()),
        (_, Some(sealer)) => {
            let sealed = crypto.seal(sealer, key.secret.as_bytes(), &material(group, &map_key))?;
            hex::encode(sealed)
        }
        (_, None) => return Err(PermsError::UnknownMember(to.to_string())),
    };
    Ok((map_key, serde_json::Value::String(value)))
}

/// Open a reveal entry.
pub fn open_reveal(
    crypto: &dyn CryptoProvider,
    group: &CoID,
    map_key: &str,
    value: &serde_json::Value,
    sealer_secret: Option<&SealerSecret>,
) -> Result<KeySecret> {
    let bytes = value_bytes(value)?;
    match sealer_secret {
        None => secret_from_bytes(bytes),
        Some(secret) => secret_from_bytes(crypto.unseal(secret, &bytes, &material(group, map_key))?),
    }
}

/// Key-chain entry: `old` encrypted under `new`.
pub fn chain_entry(
    crypto: &dyn CryptoProvider,
    group: &CoID,
    old: &ReadKey,
    new: &ReadKey,
) -> Result<(String, serde_json::Value)> {
    let map_key = GroupKey::KeyChain {
        old: old.id,
        new: new.id,
    }
    .to_string();
    let encrypted = crypto.encrypt(&new.secret, old.secret.as_bytes(), &material(group, &map_key))?;
    Ok((map_key, serde_json::Value::String(hex::encode(encrypted))))
}

/// Recover the old key from a key-chain entry given the newer key.
pub fn open_chain_entry(
    crypto: &dyn CryptoProvider,
    group: &CoID,
    map_key: &str,
    value: &serde_json::Value,
    new_secret: &KeySecret,
) -> Result<KeySecret> {
    let bytes = value_bytes(value)?;
    secret_from_bytes(crypto.decrypt(new_secret, &bytes, &material(group, map_key))?)
}
