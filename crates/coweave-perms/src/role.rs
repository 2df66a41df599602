//! Roles and group members.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use coweave_core::{AgentID, CoID};

use crate::error::PermsError;

/// A member's role in a group.
///
/// Invite roles are held by throwaway invite agents; they allow admitting
/// one new member at or below the invite's level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Admin,
    Writer,
    Reader,
    Revoked,
    AdminInvite,
    WriterInvite,
    ReaderInvite,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::Revoked => "revoked",
            Role::AdminInvite => "adminInvite",
            Role::WriterInvite => "writerInvite",
            Role::ReaderInvite => "readerInvite",
        }
    }

    /// Access level of a member role: admin 3, writer 2, reader 1, else 0.
    pub fn level(&self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::Writer => 2,
            Role::Reader => 1,
            _ => 0,
        }
    }

    /// Ordering used when an agent is a member through several identities.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Role::Admin => 6,
            Role::Writer => 5,
            Role::Reader => 4,
            Role::AdminInvite => 3,
            Role::WriterInvite => 2,
            Role::ReaderInvite => 1,
            Role::Revoked => 0,
        }
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, Role::AdminInvite | Role::WriterInvite | Role::ReaderInvite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Role::Admin | Role::Writer)
    }

    pub fn can_read(&self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::Reader)
    }

    /// Whether the current read key is revealed to holders of this role.
    pub fn holds_keys(&self) -> bool {
        self.can_read() || self.is_invite()
    }

    /// The invite role that admits members at this role.
    pub fn invite(&self) -> Option<Role> {
        match self {
            Role::Admin => Some(Role::AdminInvite),
            Role::Writer => Some(Role::WriterInvite),
            Role::Reader => Some(Role::ReaderInvite),
            _ => None,
        }
    }

    /// The highest role an invite of this kind may grant.
    pub fn admitted_role(&self) -> Option<Role> {
        match self {
            Role::AdminInvite => Some(Role::Admin),
            Role::WriterInvite => Some(Role::Writer),
            Role::ReaderInvite => Some(Role::Reader),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "admin" => Role::Admin,
            "writer" => Role::Writer,
            "reader" => Role::Reader,
            "revoked" => Role::Revoked,
            "adminInvite" => Role::AdminInvite,
            "writerInvite" => Role::WriterInvite,
            "readerInvite" => Role::ReaderInvite,
            _ => return Err(PermsError::InvalidRole(s.to_string())),
        })
    }
}

/// Who a group role is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemberID {
    Account(CoID),
    Agent(AgentID),
    /// Every agent, including ones that are not members.
    Everyone,
}

impl MemberID {
    pub const EVERYONE: &'static str = "everyone";
}

impl fmt::Display for MemberID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberID::Account(id) => write!(f, "{id}"),
            MemberID::Agent(agent) => write!(f, "{agent}"),
            MemberID::Everyone => f.write_str(Self::EVERYONE),
        }
    }
}

impl FromStr for MemberID {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::EVERYONE {
            return Ok(MemberID::Everyone);
        }
        if s.starts_with(CoID::PREFIX) {
            return s
                .parse()
                .map(MemberID::Account)
                .map_err(|_| PermsError::InvalidMember(s.to_string()));
        }
        if s.starts_with(AgentID::PREFIX) {
            return s
                .parse()
                .map(MemberID::Agent)
                .map_err(|_| PermsError::InvalidMember(s.to_string()));
        }
        Err(PermsError::InvalidMember(s.to_string()))
    }
}

impl From<AgentID> for MemberID {
    fn from(agent: AgentID) -> Self {
        MemberID::Agent(agent)
    }
}

impl From<CoID> for MemberID {
    fn from(account: CoID) -> Self {
        MemberID::Account(account)
    }
}
