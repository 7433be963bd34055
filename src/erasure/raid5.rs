//! RAID5 single parity
//!
//! The parity chunk is the XOR of the `k` data chunks; any single lost chunk
//! is the XOR of the other `k`. RDP and EVENODD reuse this scheme for their
//! row parity.

use crate::ds::BitmaskArray;
use crate::erasure::{check_encode_args, chunk_span, lost_chunks, xor_into, Coding, CodingScheme};
use crate::{Error, Result};

pub struct Raid5Coding {
    data_chunks: usize,
    chunk_size: usize,
}

impl Raid5Coding {
    pub fn new(data_chunks: usize, parity_chunks: usize, chunk_size: usize) -> Result<Self> {
        if data_chunks == 0 || parity_chunks != 1 {
            return Err(Error::unsupported(
                CodingScheme::Raid5,
                format!("needs k > 0 and m = 1, got k = {}, m = {}", data_chunks, parity_chunks),
            ));
        }
        Ok(Self {
            data_chunks,
            chunk_size,
        })
    }

    /// Rebuild chunk `target` of the first `k + 1` chunks from the others
    pub(crate) fn rebuild(&self, chunks: &mut [Vec<u8>], target: usize) {
        let mut rebuilt = vec![0u8; self.chunk_size];
        for (i, chunk) in chunks.iter().enumerate().take(self.data_chunks + 1) {
            if i != target {
                xor_into(&mut rebuilt, chunk);
            }
        }
        chunks[target] = rebuilt;
    }
}

impl Coding for Raid5Coding {
    fn scheme(&self) -> CodingScheme {
        CodingScheme::Raid5
    }

    fn data_chunks(&self) -> usize {
        self.data_chunks
    }

    fn parity_chunks(&self) -> usize {
        1
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn encode_range(
        &self,
        data: &[&[u8]],
        parity: &mut [u8],
        index: usize,
        start: usize,
        end: usize,
    ) -> Result<()> {
        check_encode_args(self, data, parity, index, start, end)?;
        for (c, chunk) in data.iter().enumerate() {
            if let Some(span) = chunk_span(c, self.chunk_size, start, end) {
                xor_into(&mut parity[span.clone()], &chunk[span]);
            }
        }
        Ok(())
    }

    fn decode(&self, chunks: &mut [Vec<u8>], status: &BitmaskArray) -> Result<()> {
        if let Some(&target) = lost_chunks(self, chunks, status)?.first() {
            self.rebuild(chunks, target);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure::test_util::*;

    #[test]
    fn test_single_failure_recovery() {
        let coding = Raid5Coding::new(4, 1, 32).unwrap();
        assert_recovers_all(&coding, 1, 5);
    }

    #[test]
    fn test_double_failure_rejected() {
        let coding = Raid5Coding::new(3, 1, 8).unwrap();
        let stripe = encode_stripe(&coding, &random_chunks(3, 8, 6));
        assert!(matches!(
            lose_and_decode(&coding, &stripe, &[0, 3]),
            Err(Error::Unrecoverable { failed: 2, tolerance: 1 })
        ));
    }

    #[test]
    fn test_delta_encode_matches_full_encode() {
        let coding = Raid5Coding::new(4, 1, 16).unwrap();
        assert_delta_matches_full(&coding, 12, 40, 7);
    }
}
