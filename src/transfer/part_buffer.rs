//! Part Buffer (§4.C) — slices the inbound byte stream into part-sized
//! chunks using a single pre-allocated backing region per in-flight part.
//! No data structure here grows per chunk; the backing `Vec` is allocated
//! once per part at its final capacity and handed off whole.

use crate::errors::TransferError;
use bytes::Bytes;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

const DEFAULT_PART_SIZE: u64 = 100 * MIB;
const MID_PART_SIZE: u64 = 250 * MIB;
const LARGE_PART_SIZE: u64 = 500 * MIB;

const MID_THRESHOLD: u64 = 10 * GIB;
const LARGE_THRESHOLD: u64 = 100 * GIB;

const MIN_PART_SIZE: u64 = 5 * MIB;
const MAX_PART_SIZE: u64 = 5 * GIB;
const MAX_PARTS: u64 = 10_000;

/// Choose the part size once, given the total object size (`-1` when
/// unknown). Doubles the base size until the part count fits within
/// `MAX_PARTS`; fails with `CONFIG` if even the 5 GiB ceiling can't fit.
pub fn part_size(total_bytes: i64) -> Result<u64, TransferError> {
    let mut p = if total_bytes < 0 || (total_bytes as u64) < MID_THRESHOLD {
        DEFAULT_PART_SIZE
    } else if (total_bytes as u64) < LARGE_THRESHOLD {
        MID_PART_SIZE
    } else {
        LARGE_PART_SIZE
    };

    p = p.clamp(MIN_PART_SIZE, MAX_PART_SIZE);

    if total_bytes > 0 {
        let n = total_bytes as u64;
        while ceil_div(n, p) > MAX_PARTS {
            if p >= MAX_PART_SIZE {
                return Err(TransferError::config(format!(
                    "{n} bytes cannot fit within {MAX_PARTS} parts even at the {MAX_PART_SIZE}-byte ceiling"
                )));
            }
            p = (p * 2).min(MAX_PART_SIZE);
        }
    }

    Ok(p)
}

fn ceil_div(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// A part handed off to the Upload Scheduler, with its true length (the
/// final part of a transfer may be shorter than the nominal part size).
#[derive(Debug, Clone)]
pub struct FinishedPart {
    pub part_number: u32,
    pub bytes: Bytes,
}

/// Owns the single in-flight backing region and the running byte counter.
/// Only the Transfer Coordinator drives this; it is not `Send`-shared.
pub struct PartBuffer {
    part_size: u64,
    current: Vec<u8>,
    offset: usize,
    next_part_number: u32,
    bytes_transferred: u64,
}

impl PartBuffer {
    pub fn new(part_size: u64) -> Self {
        Self {
            part_size,
            current: Vec::with_capacity(part_size as usize),
            offset: 0,
            next_part_number: 1,
            bytes_transferred: 0,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Ingest one reader chunk. Returns zero or more finished parts — more
    /// than one when a single chunk spans multiple part boundaries.
    /// `bytes_transferred` advances by the chunk length regardless of
    /// whether a part was handed off.
    pub fn ingest(&mut self, chunk: &[u8]) -> Vec<FinishedPart> {
        let mut finished = Vec::new();
        let mut remaining = chunk;
        self.bytes_transferred += chunk.len() as u64;

        while !remaining.is_empty() {
            let capacity = self.part_size as usize;
            let space = capacity - self.offset;
            let take = space.min(remaining.len());

            self.current.extend_from_slice(&remaining[..take]);
            self.offset += take;
            remaining = &remaining[take..];

            if self.offset == capacity {
                finished.push(self.cut_part());
            }
        }

        finished
    }

    fn cut_part(&mut self) -> FinishedPart {
        let part_number = self.next_part_number;
        self.next_part_number += 1;
        let bytes = std::mem::replace(&mut self.current, Vec::with_capacity(self.part_size as usize));
        self.offset = 0;
        FinishedPart {
            part_number,
            bytes: Bytes::from(bytes),
        }
    }

    /// Call once at end-of-stream. A trailing partial part (if any) is
    /// returned. If no bytes ever arrived, the transfer fails with
    /// `SOURCE_EMPTY` before any multipart upload is initiated.
    pub fn finish(mut self) -> Result<Option<FinishedPart>, TransferError> {
        if self.offset > 0 {
            Ok(Some(self.cut_part()))
        } else if self.next_part_number == 1 {
            Err(TransferError::SourceEmpty)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_size_defaults_under_10gib() {
        assert_eq!(part_size(5 * GIB as i64).unwrap(), 100 * MIB);
    }

    #[test]
    fn part_size_mid_tier() {
        assert_eq!(part_size(50 * GIB as i64).unwrap(), 250 * MIB);
    }

    #[test]
    fn part_size_large_tier() {
        assert_eq!(part_size(200 * GIB as i64).unwrap(), 500 * MIB);
    }

    #[test]
    fn part_size_doubles_to_fit_six_terabytes() {
        let n = 6i64 * 1024 * 1024 * 1024 * 1024; // 6 TiB
        let p = part_size(n).unwrap();
        assert!(p >= 500 * MIB && p <= MAX_PART_SIZE);
        assert!(ceil_div(n as u64, p) <= MAX_PARTS);
    }

    #[test]
    fn part_size_unknown_total_uses_default() {
        assert_eq!(part_size(-1).unwrap(), DEFAULT_PART_SIZE);
    }

    #[test]
    fn ingest_exact_boundary_yields_one_part() {
        let mut buf = PartBuffer::new(4);
        let finished = buf.ingest(&[1, 2, 3, 4]);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].part_number, 1);
        assert_eq!(&finished[0].bytes[..], &[1, 2, 3, 4]);
        assert_eq!(buf.bytes_transferred(), 4);
    }

    #[test]
    fn ingest_chunk_spanning_multiple_parts() {
        let mut buf = PartBuffer::new(4);
        let finished = buf.ingest(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].part_number, 1);
        assert_eq!(finished[1].part_number, 2);
        assert_eq!(&finished[0].bytes[..], &[1, 2, 3, 4]);
        assert_eq!(&finished[1].bytes[..], &[5, 6, 7, 8]);
        assert_eq!(buf.bytes_transferred(), 9);
    }

    #[test]
    fn finish_yields_trailing_partial_part() {
        let mut buf = PartBuffer::new(4);
        let _ = buf.ingest(&[1, 2, 3, 4, 5]);
        let tail = buf.finish().unwrap().unwrap();
        assert_eq!(tail.part_number, 2);
        assert_eq!(&tail.bytes[..], &[5]);
    }

    #[test]
    fn finish_on_empty_stream_fails() {
        let buf = PartBuffer::new(4);
        let err = buf.finish().unwrap_err();
        assert_eq!(err.code(), "SOURCE_EMPTY");
    }

    #[test]
    fn finish_on_exact_multiple_has_no_trailing_part() {
        let mut buf = PartBuffer::new(4);
        let _ = buf.ingest(&[1, 2, 3, 4]);
        let tail = buf.finish().unwrap();
        assert!(tail.is_none());
    }
}
