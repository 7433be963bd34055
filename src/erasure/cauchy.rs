//! Cauchy Reed-Solomon coding
//!
//! Parity chunk `i` is the GF(2^8) combination of the data chunks weighted by
//! row `i` of a Cauchy matrix. Every square submatrix of a Cauchy matrix is
//! invertible, so any `k` surviving chunks rebuild the stripe.

use crate::ds::BitmaskArray;
use crate::erasure::galois::{Matrix, MatrixCode};
use crate::erasure::{Coding, CodingScheme};
use crate::Result;

pub struct CauchyCoding {
    code: MatrixCode,
}

impl CauchyCoding {
    pub fn new(data_chunks: usize, parity_chunks: usize, chunk_size: usize) -> Result<Self> {
        MatrixCode::check_params(CodingScheme::Cauchy, data_chunks, parity_chunks, chunk_size)?;
        let matrix = Matrix::cauchy(data_chunks, parity_chunks);
        Ok(Self {
            code: MatrixCode::new(CodingScheme::Cauchy, matrix, chunk_size),
        })
    }

    /// The `m x k` coefficient matrix
    pub fn matrix(&self) -> &Matrix {
        self.code.matrix()
    }
}

impl Coding for CauchyCoding {
    fn scheme(&self) -> CodingScheme {
        CodingScheme::Cauchy
    }

    fn data_chunks(&self) -> usize {
        self.code.data_chunks()
    }

    fn parity_chunks(&self) -> usize {
        self.code.parity_chunks()
    }

    fn chunk_size(&self) -> usize {
        self.code.chunk_size()
    }

    fn encode_range(
        &self,
        data: &[&[u8]],
        parity: &mut [u8],
        index: usize,
        start: usize,
        end: usize,
    ) -> Result<()> {
        self.code.encode_range(data, parity, index, start, end)
    }

    fn decode(&self, chunks: &mut [Vec<u8>], status: &BitmaskArray) -> Result<()> {
        self.code.decode(chunks, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure::test_util::*;
    use crate::Error;

    #[test]
    fn test_recover_chunks_zero_and_three() {
        let coding = CauchyCoding::new(4, 2, 64).unwrap();
        let data = random_chunks(4, 64, 7);
        let stripe = encode_stripe(&coding, &data);

        let recovered = lose_and_decode(&coding, &stripe, &[0, 3]).unwrap();
        assert_eq!(recovered[0], data[0]);
        assert_eq!(recovered[3], data[3]);
    }

    #[test]
    fn test_recover_every_double_failure() {
        let coding = CauchyCoding::new(4, 2, 32).unwrap();
        assert_recovers_all(&coding, 2, 11);
    }

    #[test]
    fn test_recover_every_triple_failure() {
        let coding = CauchyCoding::new(5, 3, 16).unwrap();
        assert_recovers_all(&coding, 3, 12);
    }

    #[test]
    fn test_three_failures_over_limit() {
        let coding = CauchyCoding::new(4, 2, 32).unwrap();
        let data = random_chunks(4, 32, 3);
        let stripe = encode_stripe(&coding, &data);

        let mut chunks = stripe.clone();
        let mut status = BitmaskArray::new(6, 1);
        for i in [1, 2, 5] {
            status.set(0, i);
        }
        chunks[0].fill(0);
        chunks[3].fill(0);
        chunks[4].fill(0);

        let result = coding.decode(&mut chunks, &status);
        assert!(matches!(result, Err(Error::Unrecoverable { failed: 3, tolerance: 2 })));
        // Survivors untouched
        assert_eq!(chunks[1], stripe[1]);
        assert_eq!(chunks[2], stripe[2]);
        assert_eq!(chunks[5], stripe[5]);
    }

    #[test]
    fn test_delta_encode_matches_full_encode() {
        let coding = CauchyCoding::new(6, 2, 128).unwrap();
        // Inside one chunk, then straddling chunks 2 and 3
        assert_delta_matches_full(&coding, 10, 50, 21);
        assert_delta_matches_full(&coding, 2 * 128 + 100, 3 * 128 + 20, 22);
    }

    #[test]
    fn test_too_many_chunks_rejected() {
        assert!(CauchyCoding::new(250, 10, 64).is_err());
        assert!(CauchyCoding::new(4, 0, 64).is_err());
    }
}
