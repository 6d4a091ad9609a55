use std::cmp::Ordering;

use bytes::{Bytes, BytesMut};

use crate::chunk::chunk_data::{ChunkData, PayloadProtocolIdentifier};
use crate::error::{Error, Result};
use crate::util::*;

fn sort_chunks_by_tsn(c: &mut [ChunkData]) {
    c.sort_by(|a, b| {
        if sna32lt(a.tsn, b.tsn) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    });
}

fn sort_chunk_sets_by_ssn(c: &mut [ChunkSet]) {
    c.sort_by(|a, b| {
        if sna16lt(a.ssn, b.ssn) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    });
}

/// The fragments of one user message, keyed by SSN for ordered delivery.
#[derive(Debug, Clone)]
pub(crate) struct ChunkSet {
    /// meaningful only for ordered chunks
    pub(crate) ssn: u16,
    pub(crate) ppi: PayloadProtocolIdentifier,
    pub(crate) chunks: Vec<ChunkData>,
}

impl ChunkSet {
    pub(crate) fn new(ssn: u16, ppi: PayloadProtocolIdentifier) -> Self {
        ChunkSet {
            ssn,
            ppi,
            chunks: vec![],
        }
    }

    /// Inserts the fragment in TSN order, ignoring a duplicate TSN.
    /// Returns whether the set became complete.
    pub(crate) fn push(&mut self, chunk: ChunkData) -> bool {
        for c in &self.chunks {
            if c.tsn == chunk.tsn {
                return false;
            }
        }

        self.chunks.push(chunk);
        sort_chunks_by_tsn(&mut self.chunks);

        self.is_complete()
    }

    /// A set is complete when it starts with a beginning fragment, ends
    /// with an ending fragment, and the TSNs in between are strictly
    /// sequential (RFC 4960 section 3.3.1).
    pub(crate) fn is_complete(&self) -> bool {
        let n_chunks = self.chunks.len();
        if n_chunks == 0 {
            return false;
        }

        if !self.chunks[0].beginning_fragment {
            return false;
        }

        if !self.chunks[n_chunks - 1].ending_fragment {
            return false;
        }

        let mut last_tsn = 0u32;
        for (i, c) in self.chunks.iter().enumerate() {
            if i > 0 && c.tsn != last_tsn.wrapping_add(1) {
                // a mid or end fragment is missing
                return false;
            }
            last_tsn = c.tsn;
        }

        true
    }
}

/// Per-stream reassembly state: incomplete ordered sets by SSN, loose
/// unordered fragments awaiting a contiguous run, and complete unordered
/// sets ready for delivery.
#[derive(Default, Debug)]
pub(crate) struct ReassemblyQueue {
    pub(crate) si: u16,
    /// expected SSN of the next ordered message
    pub(crate) next_ssn: u16,
    pub(crate) ordered: Vec<ChunkSet>,
    pub(crate) unordered: Vec<ChunkSet>,
    pub(crate) unordered_chunks: Vec<ChunkData>,
    pub(crate) n_bytes: usize,
}

impl ReassemblyQueue {
    /// SSNs start from 0 when the association is established and wrap at
    /// 65535 (RFC 4960 section 6.5).
    pub(crate) fn new(si: u16) -> Self {
        ReassemblyQueue {
            si,
            ..Default::default()
        }
    }

    /// Accepts one DATA chunk. Returns whether a complete message became
    /// available.
    pub(crate) fn push(&mut self, chunk: ChunkData) -> bool {
        if chunk.stream_identifier != self.si {
            return false;
        }

        if chunk.unordered {
            self.n_bytes += chunk.user_data.len();
            self.unordered_chunks.push(chunk);
            sort_chunks_by_tsn(&mut self.unordered_chunks);

            // A contiguous begin..end run among the loose fragments forms
            // a deliverable set.
            if let Some(cset) = self.find_complete_unordered_chunk_set() {
                self.unordered.push(cset);
                return true;
            }

            false
        } else {
            // Anything older than the delivery point is a stray
            // retransmission of a message already delivered or abandoned.
            if sna16lt(chunk.stream_sequence_number, self.next_ssn) {
                return false;
            }

            self.n_bytes += chunk.user_data.len();

            for s in &mut self.ordered {
                if s.ssn == chunk.stream_sequence_number {
                    return s.push(chunk);
                }
            }

            let mut cset = ChunkSet::new(chunk.stream_sequence_number, chunk.payload_type);
            let ok = cset.push(chunk);
            self.ordered.push(cset);
            sort_chunk_sets_by_ssn(&mut self.ordered);

            ok
        }
    }

    fn find_complete_unordered_chunk_set(&mut self) -> Option<ChunkSet> {
        let mut start_idx: Option<usize> = None;
        let mut n_chunks = 0usize;
        let mut last_tsn = 0u32;
        let mut found = false;

        for (i, c) in self.unordered_chunks.iter().enumerate() {
            if c.beginning_fragment {
                start_idx = Some(i);
                n_chunks = 1;
                last_tsn = c.tsn;

                if c.ending_fragment {
                    found = true;
                    break;
                }
                continue;
            }

            if start_idx.is_none() {
                continue;
            }

            if c.tsn != last_tsn.wrapping_add(1) {
                start_idx = None;
                continue;
            }

            last_tsn = c.tsn;
            n_chunks += 1;

            if c.ending_fragment {
                found = true;
                break;
            }
        }

        let start = match (found, start_idx) {
            (true, Some(start)) => start,
            _ => return None,
        };

        let chunks: Vec<ChunkData> = self
            .unordered_chunks
            .drain(start..start + n_chunks)
            .collect();

        let mut chunk_set = ChunkSet::new(0, chunks[0].payload_type);
        chunk_set.chunks = chunks;

        Some(chunk_set)
    }

    pub(crate) fn is_readable(&self) -> bool {
        // sets in unordered are complete by construction
        if !self.unordered.is_empty() {
            return true;
        }

        if let Some(cset) = self.ordered.first() {
            if cset.is_complete() && sna16lte(cset.ssn, self.next_ssn) {
                return true;
            }
        }
        false
    }

    /// Takes the next deliverable message. Unordered messages go first;
    /// an ordered message is deliverable only at its turn in SSN order.
    pub(crate) fn read(&mut self) -> Result<(Bytes, PayloadProtocolIdentifier)> {
        let cset = if !self.unordered.is_empty() {
            self.unordered.remove(0)
        } else if !self.ordered.is_empty() {
            let cset = &self.ordered[0];
            if !cset.is_complete() {
                return Err(Error::ErrTryAgain);
            }
            if sna16gt(cset.ssn, self.next_ssn) {
                return Err(Error::ErrTryAgain);
            }
            if cset.ssn == self.next_ssn {
                self.next_ssn = self.next_ssn.wrapping_add(1);
            }
            self.ordered.remove(0)
        } else {
            return Err(Error::ErrTryAgain);
        };

        let total: usize = cset.chunks.iter().map(|c| c.user_data.len()).sum();
        self.subtract_num_bytes(total);

        let mut assembled = BytesMut::with_capacity(total);
        for c in &cset.chunks {
            assembled.extend_from_slice(&c.user_data);
        }

        Ok((assembled.freeze(), cset.ppi))
    }

    /// Drops incomplete ordered sets at or below `last_ssn` and moves the
    /// delivery point past them.
    pub(crate) fn forward_tsn_for_ordered(&mut self, last_ssn: u16) {
        let num_bytes = self
            .ordered
            .iter()
            .filter(|s| sna16lte(s.ssn, last_ssn) && !s.is_complete())
            .fold(0, |n, s| {
                n + s.chunks.iter().fold(0, |acc, c| acc + c.user_data.len())
            });
        self.subtract_num_bytes(num_bytes);

        self.ordered
            .retain(|s| !sna16lte(s.ssn, last_ssn) || s.is_complete());

        if sna16lte(self.next_ssn, last_ssn) {
            self.next_ssn = last_ssn.wrapping_add(1);
        }
    }

    /// Drops loose unordered fragments at or below the new cumulative TSN.
    /// Complete sets are unaffected; they remain deliverable.
    pub(crate) fn forward_tsn_for_unordered(&mut self, new_cumulative_tsn: u32) {
        let keep_from = self
            .unordered_chunks
            .iter()
            .position(|c| sna32gt(c.tsn, new_cumulative_tsn))
            .unwrap_or(self.unordered_chunks.len());

        let dropped: usize = self.unordered_chunks[..keep_from]
            .iter()
            .map(|c| c.user_data.len())
            .sum();
        self.subtract_num_bytes(dropped);
        self.unordered_chunks.drain(..keep_from);
    }

    pub(crate) fn subtract_num_bytes(&mut self, n_bytes: usize) {
        self.n_bytes = self.n_bytes.saturating_sub(n_bytes);
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }
}
