//! Response body chunking.
//!
//! Bodies up to the inline limit stay on the record. Larger bodies are cut
//! into `chunk_bytes` slices stored as `responseBodies` children and joined
//! back in index order by the gateway.

use bytes::{Bytes, BytesMut};
use std::fmt;

/// How a response body is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyLayout {
    Inline(Bytes),
    Chunked(Vec<Bytes>),
}

/// Split `body` for storage. Slicing is zero-copy.
pub fn split(body: Bytes, inline_limit: usize, chunk_bytes: usize) -> BodyLayout {
    if body.len() <= inline_limit {
        return BodyLayout::Inline(body);
    }
    BodyLayout::Chunked(split_chunks(&body, chunk_bytes))
}

/// Successive `limit`-sized slices; the last may be shorter. An empty body
/// yields no chunks.
pub fn split_chunks(body: &Bytes, limit: usize) -> Vec<Bytes> {
    let limit = limit.max(1);
    let mut chunks = Vec::with_capacity(body.len().div_ceil(limit));
    let mut start = 0;
    while start < body.len() {
        let end = (start + limit).min(body.len());
        chunks.push(body.slice(start..end));
        start = end;
    }
    chunks
}

/// One stored chunk as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub index: i64,
    pub size: i64,
    pub data: Bytes,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JoinError {
    CountMismatch { expected: usize, found: usize },
    BadIndex { position: usize, index: i64 },
    SizeMismatch { index: i64, size: i64, actual: usize },
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::CountMismatch { expected, found } => {
                write!(f, "expected {} chunks, found {}", expected, found)
            }
            JoinError::BadIndex { position, index } => {
                write!(f, "chunk at position {} has index {}", position, index)
            }
            JoinError::SizeMismatch {
                index,
                size,
                actual,
            } => write!(f, "chunk {} declares size {} but has {} bytes", index, size, actual),
        }
    }
}

impl std::error::Error for JoinError {}

/// Reassemble chunks in index order, checking that indices are exactly
/// `0..expected` and every declared size matches.
pub fn join(mut chunks: Vec<StoredChunk>, expected: usize) -> Result<Bytes, JoinError> {
    if chunks.len() != expected {
        return Err(JoinError::CountMismatch {
            expected,
            found: chunks.len(),
        });
    }
    chunks.sort_by_key(|c| c.index);

    let total: usize = chunks.iter().map(|c| c.data.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for (position, c) in chunks.iter().enumerate() {
        if c.index != position as i64 {
            return Err(JoinError::BadIndex {
                position,
                index: c.index,
            });
        }
        if c.size != c.data.len() as i64 {
            return Err(JoinError::SizeMismatch {
                index: c.index,
                size: c.size,
                actual: c.data.len(),
            });
        }
        out.extend_from_slice(&c.data);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(chunks: &[Bytes]) -> Vec<StoredChunk> {
        chunks
            .iter()
            .enumerate()
            .map(|(i, c)| StoredChunk {
                index: i as i64,
                size: c.len() as i64,
                data: c.clone(),
            })
            .collect()
    }

    #[test]
    fn test_small_body_stays_inline() {
        let body = Bytes::from_static(b"{\"ok\":true}");
        assert_eq!(split(body.clone(), 1024, 1024), BodyLayout::Inline(body));
    }

    #[test]
    fn test_empty_body_is_inline_and_has_no_chunks() {
        assert_eq!(split(Bytes::new(), 0, 10), BodyLayout::Inline(Bytes::new()));
        assert!(split_chunks(&Bytes::new(), 10).is_empty());
    }

    #[test]
    fn test_two_megabytes_in_900k_chunks() {
        let body = Bytes::from(vec![7u8; 2 * 1024 * 1024]);
        let BodyLayout::Chunked(chunks) = split(body.clone(), 900 * 1024, 900 * 1024) else {
            panic!("expected chunked layout");
        };
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 900 * 1024);
        assert_eq!(chunks[2].len(), 2 * 1024 * 1024 - 2 * 900 * 1024);
        assert_eq!(join(stored(&chunks), 3).unwrap(), body);
    }

    #[test]
    fn test_exact_multiple_has_no_short_tail() {
        let chunks = split_chunks(&Bytes::from(vec![1u8; 30]), 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 10));
    }

    #[test]
    fn test_split_then_join_round_trips_every_limit() {
        let source: Vec<u8> = (0..=200u32).map(|i| (i * 7 % 256) as u8).collect();
        for len in 0..=200usize {
            let body = Bytes::copy_from_slice(&source[..len]);
            for limit in 1..=64usize {
                let chunks = split_chunks(&body, limit);
                assert_eq!(chunks.len(), len.div_ceil(limit), "len={} limit={}", len, limit);
                assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= limit));

                let parts = stored(&chunks);
                assert!(parts.iter().enumerate().all(|(i, p)| p.index == i as i64));
                assert_eq!(join(parts, chunks.len()).unwrap(), body);

                match split(body.clone(), limit, limit) {
                    BodyLayout::Inline(b) => {
                        assert!(len <= limit);
                        assert_eq!(b, body);
                    }
                    BodyLayout::Chunked(c) => {
                        assert!(len > limit);
                        assert_eq!(join(stored(&c), c.len()).unwrap(), body);
                    }
                }
            }
        }
    }

    #[test]
    fn test_join_sorts_by_index() {
        let body = Bytes::from_static(b"abcdefgh");
        let mut parts = stored(&split_chunks(&body, 3));
        parts.reverse();
        assert_eq!(join(parts, 3).unwrap(), body);
    }

    #[test]
    fn test_join_rejects_gaps_and_bad_sizes() {
        let body = Bytes::from_static(b"abcdef");
        let mut parts = stored(&split_chunks(&body, 2));
        assert_eq!(
            join(parts[..2].to_vec(), 3),
            Err(JoinError::CountMismatch {
                expected: 3,
                found: 2
            })
        );

        parts[2].index = 5;
        assert_eq!(
            join(parts.clone(), 3),
            Err(JoinError::BadIndex {
                position: 2,
                index: 5
            })
        );

        parts[2].index = 2;
        parts[1].size = 9;
        assert!(matches!(
            join(parts, 3),
            Err(JoinError::SizeMismatch { index: 1, .. })
        ));
    }
}
