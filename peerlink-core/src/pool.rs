//! Buffer pools: size-keyed receive free-lists and a pre-allocated send arena that splits
//! large messages into channel-sized chunks.

use std::collections::HashMap;

use crate::channel::MAX_PACKET_SIZE;

/// Bytes reserved at the front of the first chunk of a split message (holds the chunk count).
pub const HEADER_SIZE: usize = 1;

/// The header byte can count at most this many chunks.
pub const MAX_CHUNK_COUNT: usize = 255;

/// Largest message that can be sent as chunks.
pub const MAX_MESSAGE_SIZE: usize = MAX_CHUNK_COUNT * MAX_PACKET_SIZE - HEADER_SIZE;

/// Number of chunks needed for a message of `len` bytes (header included).
pub fn chunk_count(len: usize) -> usize {
    (len + HEADER_SIZE).div_ceil(MAX_PACKET_SIZE)
}

/// Free-lists of received buffers keyed by exact length.
#[derive(Debug, Default)]
pub struct ReceivePool {
    free: HashMap<usize, Vec<Vec<u8>>>,
}

impl ReceivePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer of exactly `size` bytes; reused if one was released earlier.
    pub fn acquire(&mut self, size: usize) -> Vec<u8> {
        self.free
            .get_mut(&size)
            .and_then(Vec::pop)
            .unwrap_or_else(|| vec![0u8; size])
    }

    /// Pooled copy of `src`.
    pub fn acquire_filled(&mut self, src: &[u8]) -> Vec<u8> {
        let mut buf = self.acquire(src.len());
        buf.copy_from_slice(src);
        buf
    }

    /// Return a buffer. It is filed under its own length.
    pub fn release(&mut self, buf: Vec<u8>) {
        self.free.entry(buf.len()).or_default().push(buf);
    }

    pub fn free_count(&self, size: usize) -> usize {
        self.free.get(&size).map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkSlot {
    /// Index into the ring of full-size buffers.
    Full(usize),
    /// Exact-size buffer for this length.
    Sized(usize),
}

/// Pre-allocated send buffers: one per size in `1..=MAX_PACKET_SIZE` plus
/// `MAX_CHUNK_COUNT` full-size buffers for split messages.
///
/// Every acquisition hands out the same instance for a given size, so a buffer is only
/// valid until the next acquisition of that size. The `&mut` borrows returned here make
/// that exclusive for the duration of one send.
pub struct SendPool {
    full: Vec<Box<[u8]>>,
    sized: Vec<Box<[u8]>>,
    chunks: Vec<ChunkSlot>,
}

impl SendPool {
    pub fn new() -> Self {
        let full = (0..MAX_CHUNK_COUNT)
            .map(|_| vec![0u8; MAX_PACKET_SIZE].into_boxed_slice())
            .collect();
        let sized = (1..=MAX_PACKET_SIZE)
            .map(|size| vec![0u8; size].into_boxed_slice())
            .collect();
        Self {
            full,
            sized,
            chunks: Vec::with_capacity(MAX_CHUNK_COUNT),
        }
    }

    /// The single buffer of exactly `size` bytes. `None` if `size > MAX_PACKET_SIZE`.
    pub fn acquire(&mut self, size: usize) -> Option<&mut [u8]> {
        match size {
            0 => Some(<&mut [u8]>::default()),
            s if s <= MAX_PACKET_SIZE => Some(&mut self.sized[s - 1][..]),
            _ => None,
        }
    }

    /// Split `data` into chunks. The first chunk is full-size and starts with the chunk
    /// count; later chunks carry continuation bytes only, the last one sized to the rest.
    pub fn split(&mut self, data: &[u8]) -> Result<ChunkList<'_>, SplitError> {
        if data.len() <= MAX_PACKET_SIZE {
            return Err(SplitError::NoSplitNeeded { len: data.len() });
        }
        let count = chunk_count(data.len());
        if count > MAX_CHUNK_COUNT {
            return Err(SplitError::TooManyChunks { count });
        }

        self.chunks.clear();

        let first_len = MAX_PACKET_SIZE - HEADER_SIZE;
        let first = &mut self.full[0];
        first[0] = count as u8;
        first[HEADER_SIZE..].copy_from_slice(&data[..first_len]);
        self.chunks.push(ChunkSlot::Full(0));

        let mut offset = first_len;
        let mut next_full = 1;
        while offset < data.len() {
            let size = (data.len() - offset).min(MAX_PACKET_SIZE);
            let slot = if size == MAX_PACKET_SIZE {
                next_full += 1;
                ChunkSlot::Full(next_full - 1)
            } else {
                ChunkSlot::Sized(size)
            };
            self.slot_mut(slot)
                .copy_from_slice(&data[offset..offset + size]);
            self.chunks.push(slot);
            offset += size;
        }

        Ok(ChunkList { pool: self })
    }

    fn slot(&self, slot: ChunkSlot) -> &[u8] {
        match slot {
            ChunkSlot::Full(i) => &self.full[i],
            ChunkSlot::Sized(size) => &self.sized[size - 1],
        }
    }

    fn slot_mut(&mut self, slot: ChunkSlot) -> &mut [u8] {
        match slot {
            ChunkSlot::Full(i) => &mut self.full[i],
            ChunkSlot::Sized(size) => &mut self.sized[size - 1],
        }
    }
}

impl Default for SendPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered chunks of the last split. Borrows the pool, so it must be fully consumed
/// before the next split or acquisition.
pub struct ChunkList<'a> {
    pool: &'a SendPool,
}

impl<'a> ChunkList<'a> {
    pub fn len(&self) -> usize {
        self.pool.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        let pool = self.pool;
        pool.chunks.iter().map(move |&slot| pool.slot(slot))
    }
}

/// Contract violation when asking the send pool to split a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("split makes no sense: {len} bytes fit in one {MAX_PACKET_SIZE}-byte packet")]
    NoSplitNeeded { len: usize },
    #[error("{count} chunks needed, at most {MAX_CHUNK_COUNT} supported")]
    TooManyChunks { count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn receive_pool_reuses_released_buffer() {
        let mut pool = ReceivePool::new();
        let buf = pool.acquire(300);
        let ptr = buf.as_ptr();
        pool.release(buf);
        assert_eq!(pool.free_count(300), 1);
        let again = pool.acquire(300);
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again.len(), 300);
        assert_eq!(pool.free_count(300), 0);
    }

    #[test]
    fn receive_pool_keys_by_exact_size() {
        let mut pool = ReceivePool::new();
        let buf = pool.acquire(10);
        pool.release(buf);
        let other = pool.acquire(11);
        assert_eq!(other.len(), 11);
        assert_eq!(pool.free_count(10), 1);
    }

    #[test]
    fn acquire_filled_copies() {
        let mut pool = ReceivePool::new();
        let buf = pool.acquire_filled(b"abc");
        assert_eq!(buf, b"abc");
    }

    #[test]
    fn send_pool_same_instance_per_size() {
        let mut pool = SendPool::new();
        let a = pool.acquire(1170).unwrap().as_ptr();
        let b = pool.acquire(1170).unwrap().as_ptr();
        assert_eq!(a, b);
        let c = pool.acquire(1169).unwrap().as_ptr();
        assert_ne!(a, c);
        assert_eq!(pool.acquire(1).unwrap().len(), 1);
        assert!(pool.acquire(0).unwrap().is_empty());
        assert!(pool.acquire(MAX_PACKET_SIZE + 1).is_none());
    }

    #[test]
    fn split_3000_bytes() {
        let mut pool = SendPool::new();
        let data = pattern(3000);
        let chunks = pool.split(&data).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![1170, 1170, 661]);

        let parts: Vec<&[u8]> = chunks.iter().collect();
        assert_eq!(parts[0][0], 3);
        assert_eq!(&parts[0][1..], &data[..1169]);
        assert_eq!(parts[1], &data[1169..2339]);
        assert_eq!(parts[2], &data[2339..]);
    }

    #[test]
    fn split_exact_multiple_has_no_remainder() {
        let mut pool = SendPool::new();
        let data = pattern(2 * MAX_PACKET_SIZE - HEADER_SIZE);
        let chunks = pool.split(&data).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == MAX_PACKET_SIZE));
    }

    #[test]
    fn split_just_over_one_packet() {
        let mut pool = SendPool::new();
        let data = pattern(MAX_PACKET_SIZE + 1);
        let chunks = pool.split(&data).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![1170, 2]);
    }

    #[test]
    fn split_rejects_small_payload() {
        let mut pool = SendPool::new();
        assert_eq!(
            pool.split(&pattern(MAX_PACKET_SIZE)).err(),
            Some(SplitError::NoSplitNeeded { len: MAX_PACKET_SIZE })
        );
        assert!(pool.split(&[]).is_err());
    }

    #[test]
    fn split_limits() {
        let mut pool = SendPool::new();
        let chunks = pool.split(&pattern(MAX_MESSAGE_SIZE)).unwrap();
        assert_eq!(chunks.len(), MAX_CHUNK_COUNT);
        let parts: Vec<&[u8]> = chunks.iter().collect();
        assert_eq!(parts[0][0], 255);

        assert_eq!(
            pool.split(&pattern(MAX_MESSAGE_SIZE + 1)).err(),
            Some(SplitError::TooManyChunks { count: 256 })
        );
    }

    #[test]
    fn chunk_list_is_reused_between_splits() {
        let mut pool = SendPool::new();
        assert_eq!(pool.split(&pattern(5000)).unwrap().len(), 5);
        assert_eq!(pool.split(&pattern(1500)).unwrap().len(), 2);
    }
}
