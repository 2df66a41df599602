//! Identifier types for coweave.
//!
//! Ids have a canonical string form with a type prefix (`co_`, `agent_`,
//! `key_`) and serialize as those strings, so they can be embedded in JSON
//! content and used as map keys.

use std::fmt;
use std::str::FromStr;

use crate::crypto::{impl_string_serde, AgentID, Hash, KeyID};
use crate::error::{CoreError, Result};

/// Content-addressed id of a CoValue: the hash of its canonical header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoID(pub Hash);

impl CoID {
    pub const PREFIX: &'static str = "co_";

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Hash::from_bytes(bytes))
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Display for CoID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0.to_hex())
    }
}

impl fmt::Debug for CoID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoID({})", &self.0.to_hex()[..16])
    }
}

impl FromStr for CoID {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| CoreError::MalformedId(s.to_string()))?;
        Hash::from_hex(body)
            .map(Self)
            .map_err(|_| CoreError::MalformedId(s.to_string()))
    }
}

impl_string_serde!(CoID);

impl fmt::Display for KeyID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key_{}", self.to_hex())
    }
}

impl FromStr for KeyID {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix("key_")
            .ok_or_else(|| CoreError::MalformedId(s.to_string()))?;
        KeyID::from_hex(body).map_err(|_| CoreError::MalformedId(s.to_string()))
    }
}

/// One writer's append-only log within a CoValue.
///
/// An agent opens a new session per device/process, so the same agent may
/// own several sessions distinguished by `suffix`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionID {
    pub agent: AgentID,
    pub suffix: u64,
}

impl SessionID {
    pub fn new(agent: AgentID, suffix: u64) -> Self {
        Self { agent, suffix }
    }
}

impl fmt::Display for SessionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_session_{:016x}", self.agent, self.suffix)
    }
}

impl fmt::Debug for SessionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionID({:?}, {:016x})", self.agent, self.suffix)
    }
}

impl FromStr for SessionID {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (agent, suffix) = s
            .rsplit_once("_session_")
            .ok_or_else(|| CoreError::MalformedId(s.to_string()))?;
        let suffix =
            u64::from_str_radix(suffix, 16).map_err(|_| CoreError::MalformedId(s.to_string()))?;
        Ok(Self {
            agent: agent.parse()?,
            suffix,
        })
    }
}

impl_string_serde!(SessionID);

/// Position of a transaction: its session and index within that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TransactionID {
    pub session: SessionID,
    pub index: u64,
}

impl TransactionID {
    pub fn new(session: SessionID, index: u64) -> Self {
        Self { session, index }
    }
}

/// A single change within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct OpID {
    pub tx: TransactionID,
    pub change: u32,
}

impl OpID {
    pub fn new(tx: TransactionID, change: u32) -> Self {
        Self { tx, change }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, SoftwareCrypto};

    #[test]
    fn test_coid_string_roundtrip() {
        let id = CoID::from_bytes([0xab; 32]);
        let s = id.to_string();
        assert_eq!(s, format!("co_{}", "ab".repeat(32)));
        assert_eq!(s.parse::<CoID>().unwrap(), id);
        assert!("co_abc".parse::<CoID>().is_err());
        assert!("xx_00".parse::<CoID>().is_err());
    }

    #[test]
    fn test_session_id_string_roundtrip() {
        let crypto = SoftwareCrypto;
        let agent = crypto.agent_id(&crypto.new_agent_secret());
        let session = SessionID::new(agent, 0xdead_beef);
        let parsed: SessionID = session.to_string().parse().unwrap();
        assert_eq!(parsed, session);
    }

    #[test]
    fn test_ids_serialize_as_strings() {
        let id = CoID::from_bytes([1; 32]);
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
        let back: CoID = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_key_id_string_roundtrip() {
        let key = SoftwareCrypto.new_read_key();
        let s = key.id.to_string();
        assert!(s.starts_with("key_"));
        assert_eq!(s.parse::<KeyID>().unwrap(), key.id);
    }
}
