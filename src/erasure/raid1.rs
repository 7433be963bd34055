//! RAID1 mirroring
//!
//! One data chunk and `m` replicas. Any surviving copy rebuilds the rest.

use crate::ds::BitmaskArray;
use crate::erasure::{check_encode_args, chunk_span, lost_chunks, xor_into, Coding, CodingScheme};
use crate::{Error, Result};

pub struct Raid1Coding {
    replicas: usize,
    chunk_size: usize,
}

impl Raid1Coding {
    pub fn new(data_chunks: usize, parity_chunks: usize, chunk_size: usize) -> Result<Self> {
        if data_chunks != 1 || parity_chunks == 0 {
            return Err(Error::unsupported(
                CodingScheme::Raid1,
                format!("needs k = 1 and m > 0, got k = {}, m = {}", data_chunks, parity_chunks),
            ));
        }
        Ok(Self {
            replicas: parity_chunks,
            chunk_size,
        })
    }
}

impl Coding for Raid1Coding {
    fn scheme(&self) -> CodingScheme {
        CodingScheme::Raid1
    }

    fn data_chunks(&self) -> usize {
        1
    }

    fn parity_chunks(&self) -> usize {
        self.replicas
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
        if let Some(span) = chunk_span(0, self.chunk_size, start, end) {
            xor_into(&mut parity[span.clone()], &data[0][span]);
        }
        Ok(())
    }

    fn decode(&self, chunks: &mut [Vec<u8>], status: &BitmaskArray) -> Result<()> {
        let lost = lost_chunks(self, chunks, status)?;
        if lost.is_empty() {
            return Ok(());
        }
        // lost_chunks guarantees at least one survivor
        let survivor = (0..chunks.len())
            .find(|i| !lost.contains(i))
            .ok_or(Error::Unrecoverable {
                failed: lost.len(),
                tolerance: self.replicas,
            })?;
        let copy = chunks[survivor].clone();
        for target in lost {
            chunks[target].copy_from_slice(&copy);
        }
        Ok(())
    }
}
