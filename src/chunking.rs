//! File chunking, checksums and reassembly
//!
//! A payload is cut into fixed-size [`Chunk`]s, each carrying the lowercase hex
//! SHA-256 of its bytes. On the receive side a chunk must pass
//! [`Chunk::verify`] before it can enter a [`ReassemblyBuffer`], which only
//! takes [`VerifiedChunk`]s.

use crate::error::{Result, ShareError};
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

/// Lowercase hex SHA-256 of `data`
pub fn compute_checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Chunks a [`ReassemblyBuffer`] holds before the header, unless told otherwise
pub const DEFAULT_EARLY_CHUNK_LIMIT: usize = 64;

/// Number of chunks needed for `size` bytes
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size as u64) as u32
}

/// One chunk of a file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based sequence number
    pub seq: u32,
    pub payload: Bytes,
    /// Lowercase hex SHA-256 of `payload`
    pub checksum: String,
}

impl Chunk {
    /// Create a chunk and compute its checksum
    pub fn new(seq: u32, payload: Bytes) -> Self {
        let checksum = compute_checksum(&payload);
        Self { seq, payload, checksum }
    }

    /// Check the payload against the carried checksum
    pub fn verify(self, transfer_id: &str) -> Result<VerifiedChunk> {
        if compute_checksum(&self.payload) != self.checksum.to_ascii_lowercase() {
            return Err(ShareError::ChecksumMismatch(transfer_id.to_string(), self.seq));
        }
        Ok(VerifiedChunk {
            seq: self.seq,
            payload: self.payload,
        })
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A chunk whose checksum matched
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedChunk {
    seq: u32,
    payload: Bytes,
}

impl VerifiedChunk {
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Split a payload into chunks of `chunk_size` bytes (the last may be shorter)
///
/// Chunk payloads share the input buffer. An empty payload yields no chunks.
pub fn split_into_chunks(data: &Bytes, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Chunk> = (0..data.len())
        .step_by(chunk_size)
        .enumerate()
        .map(|(seq, start)| {
            let end = (start + chunk_size).min(data.len());
            Chunk::new(seq as u32, data.slice(start..end))
        })
        .collect();

    debug!(
        "Split {} bytes into {} chunks of {} bytes",
        data.len(),
        chunks.len(),
        chunk_size
    );
    chunks
}

/// Verified chunks of one inbound transfer, keyed by sequence number
#[derive(Debug)]
pub struct ReassemblyBuffer {
    transfer_id: String,
    chunks: BTreeMap<u32, Bytes>,
    /// Known once the offer arrived
    total_chunks: Option<u32>,
    declared_size: Option<u64>,
    chunk_size: Option<u32>,
    received_bytes: u64,
    /// Chunks held while the header is unknown
    early_limit: usize,
}

impl ReassemblyBuffer {
    /// Create new reassembly buffer
    pub fn new(transfer_id: impl Into<String>) -> Self {
        Self::with_early_limit(transfer_id, DEFAULT_EARLY_CHUNK_LIMIT)
    }

    /// Buffer holding at most `early_limit` chunks ahead of the header
    pub fn with_early_limit(transfer_id: impl Into<String>, early_limit: usize) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            chunks: BTreeMap::new(),
            total_chunks: None,
            declared_size: None,
            chunk_size: None,
            received_bytes: 0,
            early_limit,
        }
    }

    /// Record the header, returns sequence numbers buffered before it that do not fit it
    ///
    /// Chunks out of range or longer than `chunk_size` are evicted.
    pub fn set_header(&mut self, total_chunks: u32, declared_size: u64, chunk_size: u32) -> Vec<u32> {
        self.total_chunks = Some(total_chunks);
        self.declared_size = Some(declared_size);
        self.chunk_size = Some(chunk_size);

        let evicted: Vec<u32> = self
            .chunks
            .iter()
            .filter(|(seq, payload)| **seq >= total_chunks || payload.len() > chunk_size as usize)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &evicted {
            if let Some(payload) = self.chunks.remove(seq) {
                self.received_bytes -= payload.len() as u64;
            }
        }
        evicted
    }

    pub fn has_header(&self) -> bool {
        self.total_chunks.is_some()
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.total_chunks
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    /// Whether `seq` was already accepted
    pub fn contains(&self, seq: u32) -> bool {
        self.chunks.contains_key(&seq)
    }

    pub fn chunk_size(&self) -> Option<u32> {
        self.chunk_size
    }

    /// Sequence numbers held, ascending
    pub fn received_seqs(&self) -> Vec<u32> {
        self.chunks.keys().copied().collect()
    }

    /// Store a verified chunk
    pub fn insert(&mut self, chunk: VerifiedChunk) -> Result<()> {
        if let Some(total) = self.total_chunks {
            if chunk.seq >= total {
                return Err(ShareError::SequenceOutOfRange(
                    self.transfer_id.clone(),
                    chunk.seq,
                    total,
                ));
            }
        }

        if self.chunks.contains_key(&chunk.seq) {
            return Err(ShareError::DuplicateChunk(self.transfer_id.clone(), chunk.seq));
        }

        let len = chunk.payload.len() as u64;
        match (self.chunk_size, self.declared_size) {
            (Some(chunk_size), Some(declared)) => {
                if len > u64::from(chunk_size) {
                    return Err(ShareError::SizeViolation(
                        self.transfer_id.clone(),
                        len,
                        u64::from(chunk_size),
                    ));
                }
                if self.received_bytes + len > declared {
                    return Err(ShareError::SizeViolation(
                        self.transfer_id.clone(),
                        self.received_bytes + len,
                        declared,
                    ));
                }
            }
            _ => {
                if self.chunks.len() >= self.early_limit {
                    return Err(ShareError::TooManyEarlyChunks(
                        self.transfer_id.clone(),
                        self.early_limit,
                    ));
                }
            }
        }

        self.received_bytes += chunk.payload.len() as u64;
        self.chunks.insert(chunk.seq, chunk.payload);
        Ok(())
    }

    pub fn received_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Header known and every chunk in `[0, total)` present
    pub fn is_complete(&self) -> bool {
        match self.total_chunks {
            Some(total) => self.chunks.len() == total as usize,
            None => false,
        }
    }

    /// Concatenate the chunks in sequence order
    pub fn reassemble(&self) -> Result<Bytes> {
        let (total, declared) = match (self.total_chunks, self.declared_size) {
            (Some(total), Some(size)) => (total, size),
            _ => {
                return Err(ShareError::Internal(format!(
                    "reassembly of {} before its header",
                    self.transfer_id
                )))
            }
        };

        if !self.is_complete() {
            return Err(ShareError::Internal(format!(
                "incomplete transfer {}: {}/{} chunks received",
                self.transfer_id,
                self.chunks.len(),
                total
            )));
        }

        let mut result = BytesMut::with_capacity(self.received_bytes as usize);
        for (expected, (seq, payload)) in (0..total).zip(self.chunks.iter()) {
            if expected != *seq {
                return Err(ShareError::Internal(format!(
                    "missing chunk {} of {}",
                    expected, self.transfer_id
                )));
            }
            result.extend_from_slice(payload);
        }

        if result.len() as u64 != declared {
            return Err(ShareError::SizeViolation(
                self.transfer_id.clone(),
                result.len() as u64,
                declared,
            ));
        }

        Ok(result.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_checksum_is_lowercase_sha256() {
        assert_eq!(
            compute_checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_split_sizes() {
        let data = sample(10_000);
        let chunks = split_into_chunks(&data, 4096);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[2].len(), 10_000 - 2 * 4096);
        assert_eq!(chunk_count(10_000, 4096), 3);

        let exact = split_into_chunks(&sample(8192), 4096);
        assert_eq!(exact.len(), 2);

        assert!(split_into_chunks(&Bytes::new(), 4096).is_empty());
        assert_eq!(chunk_count(0, 4096), 0);
    }

    #[test]
    fn test_roundtrip() {
        let data = sample(50_000);
        let chunks = split_into_chunks(&data, 1024);
        let mut buffer = ReassemblyBuffer::new("t1");
        buffer.set_header(chunks.len() as u32, data.len() as u64, 1024);
        for chunk in chunks {
            buffer.insert(chunk.verify("t1").unwrap()).unwrap();
        }
        assert!(buffer.is_complete());
        assert_eq!(buffer.reassemble().unwrap(), data);
    }

    #[test]
    fn test_out_of_order_and_early_chunks() {
        let data = sample(5000);
        let mut chunks = split_into_chunks(&data, 1024);
        chunks.reverse();
        let mut buffer = ReassemblyBuffer::new("t1");

        // Chunks before the header are buffered
        for chunk in chunks {
            buffer.insert(chunk.verify("t1").unwrap()).unwrap();
        }
        assert!(!buffer.is_complete());
        assert!(buffer.set_header(5, 5000, 1024).is_empty());
        assert!(buffer.is_complete());
        assert_eq!(buffer.reassemble().unwrap(), data);
    }

    #[test]
    fn test_corrupt_chunk_rejected() {
        let mut chunk = Chunk::new(0, Bytes::from_static(b"payload"));
        chunk.payload = Bytes::from_static(b"pay1oad");
        assert_eq!(
            chunk.verify("t1"),
            Err(ShareError::ChecksumMismatch("t1".into(), 0))
        );
    }

    #[test]
    fn test_duplicate_and_out_of_range() {
        let mut buffer = ReassemblyBuffer::new("t1");
        buffer.set_header(2, 6, 3);
        let chunk = Chunk::new(1, Bytes::from_static(b"abc"));
        buffer.insert(chunk.clone().verify("t1").unwrap()).unwrap();
        assert_eq!(
            buffer.insert(chunk.verify("t1").unwrap()),
            Err(ShareError::DuplicateChunk("t1".into(), 1))
        );
        assert_eq!(buffer.received_bytes(), 3);

        let stray = Chunk::new(2, Bytes::from_static(b"zzz"));
        assert_eq!(
            buffer.insert(stray.verify("t1").unwrap()),
            Err(ShareError::SequenceOutOfRange("t1".into(), 2, 2))
        );
    }

    #[test]
    fn test_header_evicts_stray_chunks() {
        let mut buffer = ReassemblyBuffer::new("t1");
        buffer
            .insert(Chunk::new(7, Bytes::from_static(b"x")).verify("t1").unwrap())
            .unwrap();
        buffer
            .insert(Chunk::new(0, Bytes::from_static(b"y")).verify("t1").unwrap())
            .unwrap();
        assert_eq!(buffer.set_header(1, 1, 1024), vec![7]);
        assert_eq!(buffer.received_bytes(), 1);
        assert!(buffer.is_complete());
    }

    #[test]
    fn test_size_violation() {
        let mut buffer = ReassemblyBuffer::new("t1");
        buffer.set_header(1, 10, 1024);
        buffer
            .insert(Chunk::new(0, Bytes::from_static(b"short")).verify("t1").unwrap())
            .unwrap();
        assert_eq!(
            buffer.reassemble(),
            Err(ShareError::SizeViolation("t1".into(), 5, 10))
        );
    }

    #[test]
    fn test_early_chunks_are_capped() {
        let mut buffer = ReassemblyBuffer::with_early_limit("t1", 2);
        for seq in 0..2 {
            buffer
                .insert(Chunk::new(seq, Bytes::from_static(b"ab")).verify("t1").unwrap())
                .unwrap();
        }
        let third = Chunk::new(4000, Bytes::from_static(b"cd")).verify("t1").unwrap();
        assert_eq!(
            buffer.insert(third),
            Err(ShareError::TooManyEarlyChunks("t1".into(), 2))
        );
        assert_eq!(buffer.received_seqs(), vec![0, 1]);

        // Once the header is known the cap no longer applies
        buffer.set_header(3, 6, 2);
        buffer
            .insert(Chunk::new(2, Bytes::from_static(b"ef")).verify("t1").unwrap())
            .unwrap();
        assert!(buffer.is_complete());
    }

    #[test]
    fn test_oversized_chunks_rejected_on_insert() {
        let mut buffer = ReassemblyBuffer::new("t1");
        buffer.set_header(2, 6, 4);
        let long = Chunk::new(0, Bytes::from_static(b"abcde")).verify("t1").unwrap();
        assert_eq!(
            buffer.insert(long),
            Err(ShareError::SizeViolation("t1".into(), 5, 4))
        );

        buffer
            .insert(Chunk::new(0, Bytes::from_static(b"abcd")).verify("t1").unwrap())
            .unwrap();
        // Fits the chunk size but not the declared total
        let past_end = Chunk::new(1, Bytes::from_static(b"efg")).verify("t1").unwrap();
        assert_eq!(
            buffer.insert(past_end),
            Err(ShareError::SizeViolation("t1".into(), 7, 6))
        );
        assert_eq!(buffer.received_bytes(), 4);
    }

    #[test]
    fn test_header_evicts_oversized_early_chunks() {
        let mut buffer = ReassemblyBuffer::new("t1");
        buffer
            .insert(Chunk::new(0, Bytes::from(vec![1u8; 2048])).verify("t1").unwrap())
            .unwrap();
        assert_eq!(buffer.set_header(2, 2048, 1024), vec![0]);
        assert_eq!(buffer.received_bytes(), 0);
    }

    #[test]
    fn test_empty_payload() {
        let mut buffer = ReassemblyBuffer::new("t1");
        buffer.set_header(0, 0, 1024);
        assert!(buffer.is_complete());
        assert!(buffer.reassemble().unwrap().is_empty());
    }
}
