//! Splitting the roster into rate-limit friendly chunks.
//!
//! Each chunk is fetched under one API key, and chunk `n + 1` may not start
//! before `n * inter_chunk_delay` has elapsed since the first chunk began.

use std::time::Duration;

/// API keys and the roster size at which chunks start rotating across them.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    keys: Vec<String>,
    rotate_threshold: usize,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>, rotate_threshold: usize) -> Self {
        let keys = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            keys,
            rotate_threshold,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The key used for calls that are not part of a chunk.
    pub fn primary(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    pub fn for_chunk(&self, chunk_index: usize, roster_len: usize) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = if roster_len > self.rotate_threshold {
            chunk_index % self.keys.len()
        } else {
            0
        };
        Some(self.keys[idx].as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub members: Vec<String>,
    pub credential: String,
    /// Earliest start relative to the first chunk.
    pub start_offset: Duration,
}

pub fn plan_chunks(
    members: &[String],
    chunk_size: usize,
    credentials: &CredentialPool,
    inter_chunk_delay: Duration,
) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    members
        .chunks(chunk_size)
        .enumerate()
        .filter_map(|(index, slice)| {
            let credential = credentials.for_chunk(index, members.len())?;
            Some(Chunk {
                index,
                members: slice.to_vec(),
                credential: credential.to_string(),
                start_offset: inter_chunk_delay * index as u32,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("friend{}", i)).collect()
    }

    #[test]
    fn test_300_members_two_chunks() {
        let pool = CredentialPool::new(vec!["k1".into(), "k2".into()], 100);
        let chunks = plan_chunks(&roster(300), 200, &pool, Duration::from_secs(2));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].members.len(), 200);
        assert_eq!(chunks[1].members.len(), 100);
        assert_eq!(chunks[1].start_offset, Duration::from_secs(2));
        assert_eq!(chunks[0].credential, "k1");
        assert_eq!(chunks[1].credential, "k2");
    }

    #[test]
    fn test_small_roster_sticks_to_primary_key() {
        let pool = CredentialPool::new(vec!["k1".into(), "k2".into()], 100);
        let chunks = plan_chunks(&roster(60), 20, &pool, Duration::from_millis(500));
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.credential == "k1"));
    }

    #[test]
    fn test_no_keys_no_chunks() {
        let pool = CredentialPool::new(vec![" ".into()], 100);
        assert!(pool.is_empty());
        assert!(plan_chunks(&roster(5), 2, &pool, Duration::ZERO).is_empty());
    }
}
