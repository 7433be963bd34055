//! Vandermonde Reed-Solomon coding
//!
//! The `(k + m) x k` Vandermonde matrix is multiplied by the inverse of its
//! top `k x k` block, which makes the code systematic: the top block becomes
//! the identity and the bottom `m` rows are the parity coefficients.

use crate::ds::BitmaskArray;
use crate::erasure::galois::{Matrix, MatrixCode};
use crate::erasure::{Coding, CodingScheme};
use crate::{Error, Result};

pub struct ReedSolomonCoding {
    code: MatrixCode,
}

impl ReedSolomonCoding {
    pub fn new(data_chunks: usize, parity_chunks: usize, chunk_size: usize) -> Result<Self> {
        let scheme = CodingScheme::ReedSolomon;
        MatrixCode::check_params(scheme, data_chunks, parity_chunks, chunk_size)?;

        let total = data_chunks + parity_chunks;
        let vandermonde = Matrix::vandermonde(total, data_chunks);
        let top_inverse = vandermonde
            .sub_rows(0, data_chunks)
            .invert()
            .ok_or_else(|| Error::unsupported(scheme, "singular Vandermonde block"))?;
        let systematic = vandermonde.multiply(&top_inverse);

        Ok(Self {
            code: MatrixCode::new(scheme, systematic.sub_rows(data_chunks, total), chunk_size),
        })
    }

    pub fn matrix(&self) -> &Matrix {
        self.code.matrix()
    }
}

impl Coding for ReedSolomonCoding {
    fn scheme(&self) -> CodingScheme {
        CodingScheme::ReedSolomon
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

    #[test]
    fn test_parity_coefficients_non_zero() {
        // A zero coefficient would make a 1x1 minor singular
        let coding = ReedSolomonCoding::new(4, 2, 16).unwrap();
        for r in 0..2 {
            assert!(coding.matrix().row(r).iter().all(|&c| c != 0));
        }
    }

    #[test]
    fn test_recover_every_double_failure() {
        let coding = ReedSolomonCoding::new(6, 2, 24).unwrap();
        assert_recovers_all(&coding, 2, 31);
    }

    #[test]
    fn test_recover_four_parity() {
        let coding = ReedSolomonCoding::new(4, 4, 8).unwrap();
        assert_recovers_all(&coding, 4, 32);
    }

    #[test]
    fn test_delta_encode_matches_full_encode() {
        let coding = ReedSolomonCoding::new(4, 3, 64).unwrap();
        assert_delta_matches_full(&coding, 64 + 3, 64 + 9, 33);
        assert_delta_matches_full(&coding, 0, 4 * 64, 34);
    }
}
