//! RAID0 striping: no redundancy at all

use crate::ds::BitmaskArray;
use crate::erasure::{check_encode_args, lost_chunks, Coding, CodingScheme};
use crate::{Error, Result};

pub struct Raid0Coding {
    data_chunks: usize,
    chunk_size: usize,
}

impl Raid0Coding {
    pub fn new(data_chunks: usize, parity_chunks: usize, chunk_size: usize) -> Result<Self> {
        if data_chunks == 0 || parity_chunks != 0 {
            return Err(Error::unsupported(
                CodingScheme::Raid0,
                format!("needs k > 0 and m = 0, got k = {}, m = {}", data_chunks, parity_chunks),
            ));
        }
        Ok(Self {
            data_chunks,
            chunk_size,
        })
    }
}

impl Coding for Raid0Coding {
    fn scheme(&self) -> CodingScheme {
        CodingScheme::Raid0
    }

    fn data_chunks(&self) -> usize {
        self.data_chunks
    }

    fn parity_chunks(&self) -> usize {
        0
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
        // Always rejects: there is no parity index to write
        check_encode_args(self, data, parity, index, start, end)
    }

    fn decode(&self, chunks: &mut [Vec<u8>], status: &BitmaskArray) -> Result<()> {
        lost_chunks(self, chunks, status).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_only_checks_liveness() {
        let coding = Raid0Coding::new(3, 0, 4).unwrap();
        let mut chunks = vec![vec![1u8; 4], vec![2u8; 4], vec![3u8; 4]];
        let mut status = BitmaskArray::new(3, 1);
        for i in 0..3 {
            status.set(0, i);
        }
        assert!(coding.decode(&mut chunks, &status).is_ok());

        status.unset(0, 1);
        assert!(matches!(
            coding.decode(&mut chunks, &status),
            Err(Error::Unrecoverable { failed: 1, tolerance: 0 })
        ));
        assert_eq!(chunks[1], vec![2u8; 4]);
    }

    #[test]
    fn test_encode_rejected() {
        let coding = Raid0Coding::new(2, 0, 4).unwrap();
        let zeros = [0u8; 4];
        let data = [&zeros[..], &zeros[..]];
        let mut parity = [0u8; 4];
        assert!(coding.encode(&data, &mut parity, 1).is_err());
    }

    #[test]
    fn test_parity_not_allowed() {
        assert!(Raid0Coding::new(2, 1, 4).is_err());
    }
}
