//! Shared machinery of the XOR array codes (RDP and EVENODD)
//!
//! Each chunk is cut into `p - 1` symbols of `chunk_size / (p - 1)` bytes for
//! a prime `p`. Parities are XORs of symbols along rows and diagonals, so a
//! lost chunk pair can always be phrased as a linear system over GF(2) whose
//! unknowns are the lost symbols.

use std::collections::HashMap;
use std::ops::Range;

use crate::ds::BitmaskArray;
use crate::erasure::{xor_into, CodingScheme};
use crate::{Error, Result};

/// Primes above this bound are not searched
pub const MAX_PRIME: usize = 1000;

pub fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    (2..).take_while(|d| d * d <= n).all(|d| n % d != 0)
}

/// Smallest prime `p >= min` such that `chunk_size` splits into `p - 1`
/// equal symbols
pub fn select_prime(scheme: CodingScheme, min: usize, odd_only: bool, chunk_size: usize) -> Result<usize> {
    (min.max(2)..=MAX_PRIME)
        .filter(|&p| is_prime(p) && !(odd_only && p == 2))
        .find(|&p| chunk_size % (p - 1) == 0)
        .ok_or_else(|| {
            Error::unsupported(
                scheme,
                format!(
                    "no prime p >= {} up to {} with chunk size {} a multiple of p - 1",
                    min, MAX_PRIME, chunk_size
                ),
            )
        })
}

/// Symbol geometry of one stripe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolLayout {
    pub prime: usize,
    pub symbol_size: usize,
}

impl SymbolLayout {
    pub fn new(prime: usize, chunk_size: usize) -> Self {
        Self {
            prime,
            symbol_size: chunk_size / (prime - 1),
        }
    }

    /// Symbols per chunk
    pub fn rows(&self) -> usize {
        self.prime - 1
    }

    /// Byte range of symbol `row` within a chunk
    pub fn symbol(&self, row: usize) -> Range<usize> {
        row * self.symbol_size..(row + 1) * self.symbol_size
    }

    /// Split a chunk-local byte span into `(row, range within the symbol)`
    /// pieces
    pub fn segments(&self, span: Range<usize>) -> Vec<(usize, Range<usize>)> {
        let s = self.symbol_size;
        let mut out = Vec::new();
        let mut pos = span.start;
        while pos < span.end {
            let row = pos / s;
            let hi = span.end.min((row + 1) * s);
            out.push((row, pos - row * s..hi - row * s));
            pos = hi;
        }
        out
    }
}

/// One symbol taking part in a parity equation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cell {
    /// Symbol `row` of chunk `chunk`
    Symbol { chunk: usize, row: usize },
    /// A derived quantity that is not stored (the EVENODD adjuster)
    Hidden(usize),
}

/// Solve for every unknown cell given equations of the form
/// `XOR(cells) == 0`
///
/// Known cells are read from `chunks`. Returns the value of each unknown in
/// order, or `None` when the system does not pin the unknowns down.
pub fn solve(
    equations: &[Vec<Cell>],
    unknowns: &[Cell],
    chunks: &[Vec<u8>],
    layout: &SymbolLayout,
) -> Option<Vec<Vec<u8>>> {
    let columns: HashMap<Cell, usize> = unknowns.iter().enumerate().map(|(i, &c)| (c, i)).collect();
    let width = unknowns.len();

    let mut rows: Vec<(BitmaskArray, Vec<u8>)> = equations
        .iter()
        .map(|cells| {
            let mut coefficients = BitmaskArray::new(width, 1);
            let mut rhs = vec![0u8; layout.symbol_size];
            for cell in cells {
                match (columns.get(cell), cell) {
                    (Some(&col), _) => {
                        if coefficients.check(0, col) {
                            coefficients.unset(0, col);
                        } else {
                            coefficients.set(0, col);
                        }
                    }
                    (None, Cell::Symbol { chunk, row }) => {
                        xor_into(&mut rhs, &chunks[*chunk][layout.symbol(*row)]);
                    }
                    // Hidden cells are always unknowns
                    (None, Cell::Hidden(_)) => {}
                }
            }
            (coefficients, rhs)
        })
        .collect();

    for col in 0..width {
        let pivot = (col..rows.len()).find(|&i| rows[i].0.check(0, col))?;
        rows.swap(col, pivot);
        let (pivot_bits, pivot_rhs) = rows[col].clone();
        for (i, (bits, rhs)) in rows.iter_mut().enumerate() {
            if i != col && bits.check(0, col) {
                bits.xor_entry(0, &pivot_bits, 0);
                xor_into(rhs, &pivot_rhs);
            }
        }
    }

    Some(rows.into_iter().take(width).map(|(_, rhs)| rhs).collect())
}

/// Every symbol of the listed chunks, in chunk then row order
pub fn lost_symbols(lost: &[usize], layout: &SymbolLayout) -> Vec<Cell> {
    lost.iter()
        .flat_map(|&chunk| (0..layout.rows()).map(move |row| Cell::Symbol { chunk, row }))
        .collect()
}

/// Write solved symbols back into their chunks
pub fn apply_solution(chunks: &mut [Vec<u8>], unknowns: &[Cell], values: Vec<Vec<u8>>, layout: &SymbolLayout) {
    for (cell, value) in unknowns.iter().zip(values) {
        if let Cell::Symbol { chunk, row } = *cell {
            chunks[chunk][layout.symbol(row)].copy_from_slice(&value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_prime() {
        let primes: Vec<usize> = (0..30).filter(|&n| is_prime(n)).collect();
        assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
    }

    #[test]
    fn test_select_prime_needs_divisible_chunk() {
        // 5 - 1 = 4 divides 64
        assert_eq!(select_prime(CodingScheme::Rdp, 5, false, 64).unwrap(), 5);
        // 7 - 1 = 6 does not divide 64; 17 - 1 = 16 does
        assert_eq!(select_prime(CodingScheme::Rdp, 7, false, 64).unwrap(), 17);
        // Odd-only skips 2
        assert_eq!(select_prime(CodingScheme::EvenOdd, 1, true, 64).unwrap(), 3);
        assert!(select_prime(CodingScheme::Rdp, 3, false, 7).is_err());
    }

    #[test]
    fn test_segments() {
        let layout = SymbolLayout::new(5, 16);
        assert_eq!(layout.symbol_size, 4);
        assert_eq!(layout.segments(2..11), vec![(0, 2..4), (1, 0..4), (2, 0..3)]);
        assert!(layout.segments(3..3).is_empty());
    }

    #[test]
    fn test_solve_two_unknowns() {
        // a ^ b ^ k1 = 0 and a ^ k2 = 0 with k1 = [3], k2 = [5]
        let layout = SymbolLayout::new(2, 1);
        let chunks = vec![vec![0u8], vec![0u8], vec![3u8], vec![5u8]];
        let a = Cell::Symbol { chunk: 0, row: 0 };
        let b = Cell::Symbol { chunk: 1, row: 0 };
        let k1 = Cell::Symbol { chunk: 2, row: 0 };
        let k2 = Cell::Symbol { chunk: 3, row: 0 };

        let values = solve(&[vec![a, b, k1], vec![a, k2]], &[a, b], &chunks, &layout).unwrap();
        assert_eq!(values, vec![vec![5u8], vec![6u8]]);
    }

    #[test]
    fn test_solve_underdetermined() {
        let layout = SymbolLayout::new(2, 1);
        let chunks = vec![vec![0u8], vec![0u8]];
        let a = Cell::Symbol { chunk: 0, row: 0 };
        let b = Cell::Symbol { chunk: 1, row: 0 };
        assert!(solve(&[vec![a, b]], &[a, b], &chunks, &layout).is_none());
    }
}
