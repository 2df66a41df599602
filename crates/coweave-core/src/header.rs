//! CoValue headers.
//!
//! The header is immutable and fixed at creation; the CoValue's id is the
//! hash of its canonical encoding.

use serde::{Deserialize, Serialize};

use crate::canonical::to_canonical_bytes;
use crate::crypto::{AgentID, CryptoProvider};
use crate::error::Result;
use crate::types::{now_millis, CoID};

/// Which interpreter projects a CoValue's transactions into state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Map,
    List,
    Stream,
    BinaryStream,
    Group,
    Account,
}

impl ContentType {
    /// Groups and accounts are interpreted as maps.
    pub fn is_group_like(&self) -> bool {
        matches!(self, ContentType::Group | ContentType::Account)
    }
}

/// How write permission and encryption keys are decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ruleset {
    /// The CoValue is itself a group; `initial_admin` may bootstrap it.
    Group { initial_admin: AgentID },
    /// Permissions and read keys come from the owning group.
    OwnedByGroup { group: CoID },
    /// Anyone may write, nothing is encrypted.
    UnsafeAllowAll,
}

/// Immutable description of a CoValue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub content_type: ContentType,
    pub ruleset: Ruleset,
    pub meta: Option<serde_json::Value>,
    pub created_at: Option<u64>,
    pub uniqueness: Option<String>,
}

impl Header {
    /// Header of the account owned by `agent`.
    ///
    /// Fully deterministic, so anyone can compute an agent's account id.
    pub fn account(agent: AgentID) -> Self {
        Self {
            content_type: ContentType::Account,
            ruleset: Ruleset::Group {
                initial_admin: agent,
            },
            meta: None,
            created_at: None,
            uniqueness: None,
        }
    }

    /// Header for a fresh group administered by `admin`.
    pub fn group(admin: AgentID, crypto: &dyn CryptoProvider) -> Self {
        Self {
            content_type: ContentType::Group,
            ruleset: Ruleset::Group {
                initial_admin: admin,
            },
            meta: None,
            created_at: Some(now_millis()),
            uniqueness: Some(hex::encode(crypto.random_bytes(12))),
        }
    }

    /// Header for a value owned by `group`.
    pub fn owned_by(
        content_type: ContentType,
        group: CoID,
        meta: Option<serde_json::Value>,
        crypto: &dyn CryptoProvider,
    ) -> Self {
        Self {
            content_type,
            ruleset: Ruleset::OwnedByGroup { group },
            meta,
            created_at: Some(now_millis()),
            uniqueness: Some(hex::encode(crypto.random_bytes(12))),
        }
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(self)
    }

    /// Content-addressed id of this header.
    pub fn id(&self, crypto: &dyn CryptoProvider) -> Result<CoID> {
        Ok(CoID(crypto.secure_hash(&self.canonical_bytes()?)))
    }

    /// The group whose permissions apply, if any.
    pub fn owner_group(&self) -> Option<CoID> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group } => Some(*group),
            _ => None,
        }
    }
}

/// Id of the account owned by `agent`.
pub fn account_id_of(agent: &AgentID, crypto: &dyn CryptoProvider) -> Result<CoID> {
    Header::account(*agent).id(crypto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareCrypto;

    #[test]
    fn test_account_id_deterministic() {
        let crypto = SoftwareCrypto;
        let agent = crypto.agent_id(&crypto.agent_secret_from_seed(&[7; 32]));
        let a = account_id_of(&agent, &crypto).unwrap();
        let b = account_id_of(&agent, &crypto).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_groups_are_unique() {
        let crypto = SoftwareCrypto;
        let agent = crypto.agent_id(&crypto.new_agent_secret());
        let g1 = Header::group(agent, &crypto).id(&crypto).unwrap();
        let g2 = Header::group(agent, &crypto).id(&crypto).unwrap();
        assert_ne!(g1, g2);
    }

    #[test]
    fn test_header_id_covers_meta() {
        let crypto = SoftwareCrypto;
        let group = CoID::from_bytes([3; 32]);
        let mut header = Header::owned_by(ContentType::Map, group, None, &crypto);
        let before = header.id(&crypto).unwrap();
        header.meta = Some(serde_json::json!({ "type": "note" }));
        assert_ne!(before, header.id(&crypto).unwrap());
        assert_eq!(header.owner_group(), Some(group));
    }
}
