//! Sync protocol message types and their byte framing.
//!
//! Four messages are exchanged per CoValue id: `load`, `known`, `content`
//! and `done`. Over byte transports each message is a CBOR value prefixed
//! with its length as a big-endian `u32`.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use coweave_core::{CoID, KnownState, NewContentPiece};

use crate::error::{Result, SyncError};

/// Message size limits.
pub mod limits {
    /// Max encoded size of one framed message.
    pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
    /// Max sessions listed in a known state or content piece.
    pub const MAX_SESSIONS_PER_MESSAGE: usize = 10_000;
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMessage {
    /// Ask for a CoValue, telling the peer what we already have.
    Load { known: KnownState },

    /// What the sender holds.
    Known {
        known: KnownState,
        /// The receiver's assumption was wrong; resend from this state.
        is_correction: bool,
        /// Sent as a dependency of another CoValue.
        as_dependency_of: Option<CoID>,
    },

    /// Header and/or transactions the receiver is missing.
    Content { piece: NewContentPiece },

    /// Nothing more to send for this id.
    Done { id: CoID },
}

impl SyncMessage {
    pub fn id(&self) -> CoID {
        match self {
            SyncMessage::Load { known } | SyncMessage::Known { known, .. } => known.id,
            SyncMessage::Content { piece } => piece.id,
            SyncMessage::Done { id } => *id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load { .. } => "load",
            SyncMessage::Known { .. } => "known",
            SyncMessage::Content { .. } => "content",
            SyncMessage::Done { .. } => "done",
        }
    }

    /// A plain `known` reply.
    pub fn known(known: KnownState) -> Self {
        SyncMessage::Known {
            known,
            is_correction: false,
            as_dependency_of: None,
        }
    }

    /// A `known` correcting the receiver's view of us.
    pub fn correction(known: KnownState) -> Self {
        SyncMessage::Known {
            known,
            is_correction: true,
            as_dependency_of: None,
        }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        let sessions = match self {
            SyncMessage::Load { known } | SyncMessage::Known { known, .. } => known.sessions.len(),
            SyncMessage::Content { piece } => piece.new.len(),
            SyncMessage::Done { .. } => 0,
        };
        if sessions > limits::MAX_SESSIONS_PER_MESSAGE {
            return Err("too many sessions");
        }
        Ok(())
    }
}

/// Split a content piece so no part carries much more than `max_bytes` of
/// transactions. Sessions are never cut; a single large session stays one
/// part. The header travels with the first part.
pub fn split_piece(piece: NewContentPiece, max_bytes: usize) -> Vec<NewContentPiece> {
    let mut parts = Vec::new();
    let mut current = NewContentPiece {
        id: piece.id,
        header: piece.header,
        priority: piece.priority,
        new: Default::default(),
    };
    let mut current_bytes = 0;

    for (session, content) in piece.new {
        let size: usize = content
            .new_transactions
            .iter()
            .map(|tx| tx.canonical_bytes().map_or(0, |b| b.len()))
            .sum();
        if !current.new.is_empty() && current_bytes + size > max_bytes {
            let next = NewContentPiece {
                id: current.id,
                header: None,
                priority: current.priority,
                new: Default::default(),
            };
            parts.push(std::mem::replace(&mut current, next));
            current_bytes = 0;
        }
        current_bytes += size;
        current.new.insert(session, content);
    }

    if !current.is_empty() || parts.is_empty() {
        parts.push(current);
    }
    parts
}

/// Append a length-prefixed frame for `message` to `buf`.
pub fn encode_frame(message: &SyncMessage, buf: &mut BytesMut) -> Result<()> {
    let mut body = Vec::new();
    ciborium::into_writer(message, &mut body)
        .map_err(|e| SyncError::InvalidMessage(format!("encode {}: {e}", message.action())))?;
    if body.len() > limits::MAX_FRAME_BYTES {
        return Err(SyncError::InvalidMessage(format!(
            "{} message of {} bytes exceeds frame limit",
            message.action(),
            body.len()
        )));
    }
    buf.reserve(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

/// Take one complete frame off the front of `buf`, if there is one.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<SyncMessage>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > limits::MAX_FRAME_BYTES {
        return Err(SyncError::InvalidMessage(format!("frame of {len} bytes exceeds limit")));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    let body = buf.split_to(len);
    let message: SyncMessage = ciborium::from_reader(&body[..])
        .map_err(|e| SyncError::InvalidMessage(format!("decode: {e}")))?;
    message
        .validate_limits()
        .map_err(|e| SyncError::InvalidMessage(e.into()))?;
    Ok(Some(message))
}
