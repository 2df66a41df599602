//! BinaryCoStream: a file delivered as start / chunk* / end.

use bytes::{Bytes, BytesMut};

use crate::transaction::{Change, DecryptedTransaction};

/// Assembled state of a binary stream.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryChunks {
    pub mime_type: String,
    pub file_name: Option<String>,
    pub total_size: Option<u64>,
    pub chunks: Vec<Bytes>,
    pub finished: bool,
}

impl BinaryChunks {
    /// All chunks concatenated.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.chunks.iter().map(Bytes::len).sum());
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BinaryCoStream {
    state: Option<BinaryChunks>,
}

impl BinaryCoStream {
    /// Chunks before the start marker and anything after the end are ignored.
    pub fn from_transactions(txs: &[DecryptedTransaction]) -> Self {
        let mut state: Option<BinaryChunks> = None;
        for change in txs.iter().flat_map(|tx| tx.changes.iter()) {
            match (change, state.as_mut()) {
                (
                    Change::BinaryStart {
                        mime_type,
                        file_name,
                        total_size,
                    },
                    None,
                ) => {
                    state = Some(BinaryChunks {
                        mime_type: mime_type.clone(),
                        file_name: file_name.clone(),
                        total_size: *total_size,
                        chunks: Vec::new(),
                        finished: false,
                    });
                }
                (Change::BinaryChunk { chunk }, Some(s)) if !s.finished => {
                    s.chunks.push(chunk.clone());
                }
                (Change::BinaryEnd, Some(s)) => s.finished = true,
                _ => {}
            }
        }
        Self { state }
    }

    /// The stream's chunks, or `None` if it has not started, or has not
    /// finished and `allow_unfinished` is false.
    pub fn binary_chunks(&self, allow_unfinished: bool) -> Option<&BinaryChunks> {
        let state = self.state.as_ref()?;
        (state.finished || allow_unfinished).then_some(state)
    }

    pub fn is_started(&self) -> bool {
        self.state.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.state.as_ref().map_or(false, |s| s.finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::test_support::{agent, tx};

    fn start() -> Change {
        Change::BinaryStart {
            mime_type: "image/png".into(),
            file_name: Some("a.png".into()),
            total_size: Some(6),
        }
    }

    fn chunk(b: &'static [u8]) -> Change {
        Change::BinaryChunk {
            chunk: Bytes::from_static(b),
        }
    }

    #[test]
    fn test_finished_stream() {
        let a = agent(1);
        let s = BinaryCoStream::from_transactions(&[
            tx(a, 0, 1, vec![start()]),
            tx(a, 1, 2, vec![chunk(b"abc"), chunk(b"def")]),
            tx(a, 2, 3, vec![Change::BinaryEnd, chunk(b"late")]),
        ]);
        let chunks = s.binary_chunks(false).unwrap();
        assert_eq!(chunks.to_bytes(), Bytes::from_static(b"abcdef"));
        assert_eq!(chunks.mime_type, "image/png");
        assert!(s.is_finished());
    }

    #[test]
    fn test_unfinished_stream() {
        let a = agent(1);
        let s = BinaryCoStream::from_transactions(&[
            tx(a, 0, 1, vec![chunk(b"early"), start()]),
            tx(a, 1, 2, vec![chunk(b"abc")]),
        ]);
        assert!(s.binary_chunks(false).is_none());
        let chunks = s.binary_chunks(true).unwrap();
        assert_eq!(chunks.chunks, vec![Bytes::from_static(b"abc")]);
        assert!(!chunks.finished);
    }

    #[test]
    fn test_not_started() {
        let s = BinaryCoStream::from_transactions(&[]);
        assert!(s.binary_chunks(true).is_none());
        assert!(!s.is_started());
    }
}
