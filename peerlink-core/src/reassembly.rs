//! Per-peer reassembly of split messages.
//!
//! Chunks are trusted to arrive in send order (the transport asks the channel for
//! reliable-ordered delivery); there are no sequence numbers to re-sort by.

use crate::pool::HEADER_SIZE;

/// Chunks collected for the one split message currently in flight from a peer.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    chunks: Vec<Vec<u8>>,
    declared: u8,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. The first chunk after a reset declares the total count.
    pub fn push(&mut self, chunk: Vec<u8>) -> Result<(), ReassemblyError> {
        if self.is_empty() {
            match chunk.first() {
                Some(&count) if count > 0 => self.declared = count,
                _ => return Err(ReassemblyError::InvalidHeader(chunk)),
            }
        }
        self.chunks.push(chunk);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        !self.is_empty() && self.chunks.len() == self.declared as usize
    }

    pub fn declared(&self) -> u8 {
        self.declared
    }

    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    /// Length of the reassembled message: all chunk bytes minus the header.
    pub fn message_len(&self) -> usize {
        let total: usize = self.chunks.iter().map(Vec::len).sum();
        total.saturating_sub(HEADER_SIZE)
    }

    /// Concatenate chunk payloads into `out` (`out.len()` must equal `message_len()`).
    /// Only the first chunk carries a header; it is stripped. Does not reset.
    pub fn drain_into(&self, out: &mut [u8]) {
        let mut offset = 0;
        let mut skip = HEADER_SIZE;
        for chunk in &self.chunks {
            let part = &chunk[skip.min(chunk.len())..];
            out[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
            skip = 0;
        }
    }

    /// Forget the current message and hand back its chunk buffers.
    pub fn reset(&mut self) -> std::vec::Drain<'_, Vec<u8>> {
        self.declared = 0;
        self.chunks.drain(..)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReassemblyError {
    /// First chunk was empty or declared zero chunks; the chunk is handed back.
    #[error("first chunk has no valid chunk count header")]
    InvalidHeader(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SendPool;

    fn reassemble(buf: &ReassemblyBuffer) -> Vec<u8> {
        let mut out = vec![0u8; buf.message_len()];
        buf.drain_into(&mut out);
        out
    }

    #[test]
    fn collects_until_declared_count() {
        let mut buf = ReassemblyBuffer::new();
        assert!(buf.is_empty());
        assert!(!buf.is_full());

        buf.push(vec![3, 10, 11]).unwrap();
        assert_eq!(buf.declared(), 3);
        assert!(!buf.is_full());
        buf.push(vec![12, 13]).unwrap();
        assert!(!buf.is_full());
        buf.push(vec![14]).unwrap();
        assert!(buf.is_full());

        assert_eq!(buf.message_len(), 5);
        assert_eq!(reassemble(&buf), vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn drain_does_not_reset() {
        let mut buf = ReassemblyBuffer::new();
        buf.push(vec![1, 42]).unwrap();
        assert_eq!(reassemble(&buf), vec![42]);
        assert!(buf.is_full());
        let released: Vec<Vec<u8>> = buf.reset().collect();
        assert_eq!(released, vec![vec![1, 42]]);
        assert!(buf.is_empty());
        assert_eq!(buf.declared(), 0);
    }

    #[test]
    fn rejects_missing_header() {
        let mut buf = ReassemblyBuffer::new();
        assert!(matches!(
            buf.push(Vec::new()),
            Err(ReassemblyError::InvalidHeader(_))
        ));
        assert!(matches!(
            buf.push(vec![0, 1, 2]),
            Err(ReassemblyError::InvalidHeader(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn later_chunks_keep_their_first_byte() {
        let mut buf = ReassemblyBuffer::new();
        buf.push(vec![2, 1]).unwrap();
        buf.push(vec![0, 0, 7]).unwrap();
        assert_eq!(reassemble(&buf), vec![1, 0, 0, 7]);
    }

    #[test]
    fn split_then_reassemble_random_sizes() {
        use rand::{Rng, RngCore};

        let mut rng = rand::thread_rng();
        let mut pool = SendPool::new();
        for _ in 0..20 {
            let len = rng.gen_range(crate::MAX_PACKET_SIZE + 1..=crate::pool::MAX_MESSAGE_SIZE);
            let mut data = vec![0u8; len];
            rng.fill_bytes(&mut data);

            let mut buf = ReassemblyBuffer::new();
            for chunk in pool.split(&data).unwrap().iter() {
                assert!(!buf.is_full());
                buf.push(chunk.to_vec()).unwrap();
            }
            assert!(buf.is_full());
            assert_eq!(reassemble(&buf), data);
        }
    }
}
