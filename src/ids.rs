//! Deterministic client order ID generation.
//!
//! Client order IDs are a pure function of `(uid, offset)`: the MD5
//! digest of the supervisor uid concatenated with the big-endian offset,
//! rendered as UUID text. The offset is persisted by the owning
//! supervisor, so after a restart the stream resumes exactly where it
//! left off and a retried submission reuses the identical client ID.

use std::collections::VecDeque;

use uuid::Uuid;

/// How many IDs ahead of the current offset are precomputed.
const CACHE_DEPTH: usize = 10;

/// A monotonic stream of deterministic client order IDs.
#[derive(Debug, Clone)]
pub struct IdStream {
    uid: String,
    offset: u64,
    // IDs for offsets [offset, offset + len), front first.
    cache: VecDeque<String>,
}

impl IdStream {
    /// Create a stream for `uid`, positioned at `offset`.
    #[must_use]
    pub fn new(uid: impl Into<String>, offset: u64) -> Self {
        let uid = uid.into();
        let mut cache = VecDeque::with_capacity(CACHE_DEPTH);
        for i in 0..CACHE_DEPTH as u64 {
            cache.push_back(client_order_id(&uid, offset.wrapping_add(i)));
        }

        Self { uid, offset, cache }
    }

    /// The current offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The ID at the current offset.
    #[must_use]
    pub fn current(&self) -> &str {
        self.cache.front().expect("id cache is never empty")
    }

    /// Advance past the current ID, returning the new offset.
    pub fn advance(&mut self) -> u64 {
        self.cache.pop_front();
        let next_cached = self.offset.wrapping_add(self.cache.len() as u64 + 1);
        self.cache
            .push_back(client_order_id(&self.uid, next_cached));
        self.offset = self.offset.wrapping_add(1);

        self.offset
    }

    /// Step back one offset.
    ///
    /// Used when a submission failed with a network error before the
    /// exchange could have consumed the ID. Validation failures must NOT
    /// revert; the ID is burned to avoid ABA reuse.
    pub fn revert(&mut self) -> u64 {
        self.offset = self.offset.wrapping_sub(1);
        self.cache
            .push_front(client_order_id(&self.uid, self.offset));
        self.cache.truncate(CACHE_DEPTH);

        self.offset
    }
}

/// The deterministic ID for `(uid, offset)`.
#[must_use]
pub fn client_order_id(uid: &str, offset: u64) -> String {
    let mut data = Vec::with_capacity(uid.len() + 8);
    data.extend_from_slice(uid.as_bytes());
    data.extend_from_slice(&offset.to_be_bytes());

    let digest = md5::compute(&data);

    Uuid::from_bytes(digest.0).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_function_of_uid_and_offset() {
        assert_eq!(client_order_id("abc", 7), client_order_id("abc", 7));
        assert_ne!(client_order_id("abc", 7), client_order_id("abc", 8));
        assert_ne!(client_order_id("abc", 7), client_order_id("abd", 7));
    }

    #[test]
    fn streams_agree_on_overlap() {
        let mut early = IdStream::new("limiter-1", 3);
        let mut late = IdStream::new("limiter-1", 9);

        // Advance the early stream to the late stream's start.
        while early.offset() < late.offset() {
            early.advance();
        }

        for _ in 0..50 {
            assert_eq!(early.current(), late.current());
            early.advance();
            late.advance();
        }
    }

    #[test]
    fn revert_restores_the_previous_id() {
        let mut ids = IdStream::new("limiter-2", 0);
        let first = ids.current().to_owned();
        ids.advance();
        assert_ne!(ids.current(), first);
        ids.revert();
        assert_eq!(ids.current(), first);
    }

    #[test]
    fn ids_render_as_uuids() {
        let id = client_order_id("x", 0);
        assert!(Uuid::parse_str(&id).is_ok());
    }
}
