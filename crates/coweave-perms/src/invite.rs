//! Invite secrets.
//!
//! An invite is a throwaway agent derived from a random seed and granted an
//! invite role in the group. Whoever holds the seed can act as that agent
//! once to admit themselves.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use coweave_core::{AgentSecret, CoID, CryptoProvider};

use crate::error::PermsError;

/// Shareable token: the group id plus the invite agent's seed.
///
/// The role is not embedded; it is whatever the group granted the invite
/// agent.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct InviteSecret {
    pub group: CoID,
    seed: [u8; 32],
}

impl InviteSecret {
    const PREFIX: &'static str = "invite_";

    pub fn new(group: CoID, seed: [u8; 32]) -> Self {
        Self { group, seed }
    }

    /// The invite agent's secret.
    pub fn agent_secret(&self, crypto: &dyn CryptoProvider) -> AgentSecret {
        crypto.agent_secret_from_seed(&self.seed)
    }
}

impl fmt::Display for InviteSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}_{}", Self::PREFIX, self.group, hex::encode(self.seed))
    }
}

impl fmt::Debug for InviteSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InviteSecret({:?})", self.group)
    }
}

impl FromStr for InviteSecret {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PermsError::InvalidInvite(s.to_string());
        let body = s.strip_prefix(Self::PREFIX).ok_or_else(invalid)?;
        let (group, seed) = body.rsplit_once('_').ok_or_else(invalid)?;
        let seed: [u8; 32] = hex::decode(seed)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(invalid)?;
        Ok(Self {
            group: group.parse().map_err(|_| invalid())?,
            seed,
        })
    }
}

impl From<InviteSecret> for String {
    fn from(secret: InviteSecret) -> Self {
        secret.to_string()
    }
}

impl TryFrom<String> for InviteSecret {
    type Error = PermsError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coweave_core::SoftwareCrypto;

    #[test]
    fn test_invite_string_roundtrip() {
        let secret = InviteSecret::new(CoID::from_bytes([6; 32]), [9; 32]);
        let s = secret.to_string();
        assert!(s.starts_with("invite_co_"));
        assert_eq!(s.parse::<InviteSecret>().unwrap(), secret);
        assert!(!format!("{secret:?}").contains(&hex::encode([9u8; 32])));
    }

    #[test]
    fn test_invite_rejects_garbage() {
        assert!("invite_".parse::<InviteSecret>().is_err());
        assert!("invite_co_00_11".parse::<InviteSecret>().is_err());
        assert!("hello".parse::<InviteSecret>().is_err());
    }

    #[test]
    fn test_invite_agent_is_deterministic() {
        let crypto = SoftwareCrypto;
        let secret = InviteSecret::new(CoID::from_bytes([6; 32]), [9; 32]);
        let a = crypto.agent_id(&secret.agent_secret(&crypto));
        let b = crypto.agent_id(&secret.agent_secret(&crypto));
        assert_eq!(a, b);
    }
}
