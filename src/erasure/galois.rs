//! Matrix arithmetic over GF(2^8)
//!
//! Field operations come from `reed_solomon_erasure::galois_8`; this module
//! layers the coding matrices and the shared matrix-based encoder/decoder used
//! by the Cauchy and Vandermonde Reed-Solomon schemes on top of them.

use reed_solomon_erasure::galois_8;

use crate::ds::BitmaskArray;
use crate::erasure::{check_encode_args, chunk_span, lost_chunks, Coding, CodingScheme};
use crate::{Error, Result};

/// Largest stripe a GF(2^8) code can describe
pub const FIELD_SIZE: usize = 256;

/// Dense row-major matrix of field elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn identity(size: usize) -> Self {
        let mut matrix = Self::new(size, size);
        for i in 0..size {
            matrix.set(i, i, 1);
        }
        matrix
    }

    /// `V[r][c] = r^c`
    pub fn vandermonde(rows: usize, cols: usize) -> Self {
        let mut matrix = Self::new(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                matrix.set(r, c, galois_8::exp(r as u8, c));
            }
        }
        matrix
    }

    /// `m x k` Cauchy matrix with `C[i][j] = 1 / ((k + i) ^ j)`
    pub fn cauchy(k: usize, m: usize) -> Self {
        let mut matrix = Self::new(m, k);
        for i in 0..m {
            for j in 0..k {
                let x = ((k + i) ^ j) as u8;
                matrix.set(i, j, galois_8::div(1, x));
            }
        }
        matrix
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> u8 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, value: u8) {
        self.data[r * self.cols + c] = value;
    }

    pub fn row(&self, r: usize) -> &[u8] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn multiply(&self, rhs: &Matrix) -> Matrix {
        assert_eq!(self.cols, rhs.rows, "matrix dimensions do not agree");
        let mut out = Matrix::new(self.rows, rhs.cols);
        for r in 0..self.rows {
            for c in 0..rhs.cols {
                let mut acc = 0u8;
                for i in 0..self.cols {
                    acc ^= galois_8::mul(self.get(r, i), rhs.get(i, c));
                }
                out.set(r, c, acc);
            }
        }
        out
    }

    /// Rows `from..to` as a new matrix
    pub fn sub_rows(&self, from: usize, to: usize) -> Matrix {
        Matrix {
            rows: to - from,
            cols: self.cols,
            data: self.data[from * self.cols..to * self.cols].to_vec(),
        }
    }

    /// Gauss-Jordan inversion; `None` when the matrix is singular
    pub fn invert(&self) -> Option<Matrix> {
        assert_eq!(self.rows, self.cols, "only square matrices invert");
        let n = self.rows;
        let mut work = self.clone();
        let mut inverse = Matrix::identity(n);

        for col in 0..n {
            let pivot = (col..n).find(|&r| work.get(r, col) != 0)?;
            if pivot != col {
                work.swap_rows(pivot, col);
                inverse.swap_rows(pivot, col);
            }

            let scale = galois_8::div(1, work.get(col, col));
            work.scale_row(col, scale);
            inverse.scale_row(col, scale);

            for r in 0..n {
                let factor = work.get(r, col);
                if r != col && factor != 0 {
                    work.add_scaled_row(r, col, factor);
                    inverse.add_scaled_row(r, col, factor);
                }
            }
        }
        Some(inverse)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        for c in 0..self.cols {
            self.data.swap(a * self.cols + c, b * self.cols + c);
        }
    }

    fn scale_row(&mut self, r: usize, factor: u8) {
        for c in 0..self.cols {
            let value = galois_8::mul(self.get(r, c), factor);
            self.set(r, c, value);
        }
    }

    /// `row[dst] += factor * row[src]`
    fn add_scaled_row(&mut self, dst: usize, src: usize, factor: u8) {
        for c in 0..self.cols {
            let value = self.get(dst, c) ^ galois_8::mul(factor, self.get(src, c));
            self.set(dst, c, value);
        }
    }
}

/// Systematic linear code described by its `m x k` parity matrix
pub(crate) struct MatrixCode {
    scheme: CodingScheme,
    k: usize,
    chunk_size: usize,
    parity: Matrix,
}

impl MatrixCode {
    pub(crate) fn new(scheme: CodingScheme, parity: Matrix, chunk_size: usize) -> Self {
        Self {
            scheme,
            k: parity.cols(),
            chunk_size,
            parity,
        }
    }

    /// Check the shape limits of a GF(2^8) code
    pub(crate) fn check_params(scheme: CodingScheme, k: usize, m: usize, chunk_size: usize) -> Result<()> {
        if k == 0 || m == 0 {
            return Err(Error::unsupported(scheme, "needs at least one data and one parity chunk"));
        }
        if k + m > FIELD_SIZE {
            return Err(Error::unsupported(
                scheme,
                format!("k + m = {} exceeds the GF(2^8) limit of {}", k + m, FIELD_SIZE),
            ));
        }
        if chunk_size == 0 {
            return Err(Error::unsupported(scheme, "chunk size must be non-zero"));
        }
        Ok(())
    }

    pub(crate) fn matrix(&self) -> &Matrix {
        &self.parity
    }

    /// Generator row for chunk `index`: identity for data, parity row otherwise
    fn generator_row(&self, index: usize) -> Vec<u8> {
        if index < self.k {
            let mut row = vec![0u8; self.k];
            row[index] = 1;
            row
        } else {
            self.parity.row(index - self.k).to_vec()
        }
    }
}

impl Coding for MatrixCode {
    fn scheme(&self) -> CodingScheme {
        self.scheme
    }

    fn data_chunks(&self) -> usize {
        self.k
    }

    fn parity_chunks(&self) -> usize {
        self.parity.rows()
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
        let row = self.parity.row(index - 1);
        for (c, chunk) in data.iter().enumerate() {
            if row[c] == 0 {
                continue;
            }
            if let Some(span) = chunk_span(c, self.chunk_size, start, end) {
                galois_8::mul_slice_xor(row[c], &chunk[span.clone()], &mut parity[span]);
            }
        }
        Ok(())
    }

    fn decode(&self, chunks: &mut [Vec<u8>], status: &BitmaskArray) -> Result<()> {
        let lost = lost_chunks(self, chunks, status)?;
        if lost.is_empty() {
            return Ok(());
        }

        let k = self.k;
        let survivors: Vec<usize> = (0..self.total_chunks())
            .filter(|i| !lost.contains(i))
            .take(k)
            .collect();

        let mut decode_matrix = Matrix::new(k, k);
        for (r, &index) in survivors.iter().enumerate() {
            for (c, value) in self.generator_row(index).into_iter().enumerate() {
                decode_matrix.set(r, c, value);
            }
        }
        let inverse = decode_matrix.invert().ok_or(Error::Unrecoverable {
            failed: lost.len(),
            tolerance: self.fault_tolerance(),
        })?;

        for &target in lost.iter().filter(|&&i| i < k) {
            let mut rebuilt = vec![0u8; self.chunk_size];
            for (t, &source) in survivors.iter().enumerate() {
                let coefficient = inverse.get(target, t);
                if coefficient != 0 {
                    galois_8::mul_slice_xor(coefficient, &chunks[source], &mut rebuilt);
                }
            }
            chunks[target] = rebuilt;
        }

        for &target in lost.iter().filter(|&&i| i >= k) {
            let mut parity = vec![0u8; self.chunk_size];
            {
                let data: Vec<&[u8]> = chunks[..k].iter().map(Vec::as_slice).collect();
                self.encode(&data, &mut parity, target - k + 1)?;
            }
            chunks[target] = parity;
        }
        Ok(())
    }
}
