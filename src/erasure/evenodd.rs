//! EVENODD coding
//!
//! Chunks `0..k` hold data, chunk `k` the row parity and chunk `k + 1` the
//! diagonal parity. Diagonal parity symbol `d` is the XOR of the data
//! symbols on diagonal `(c + r) mod p == d` plus the adjuster `S`, the XOR of
//! the data symbols on diagonal `p - 1`.

use crate::ds::BitmaskArray;
use crate::erasure::array_code::{self, Cell, SymbolLayout};
use crate::erasure::raid5::Raid5Coding;
use crate::erasure::{check_encode_args, chunk_span, lost_chunks, xor_into, Coding, CodingScheme};
use crate::{Error, Result};

const ADJUSTER: Cell = Cell::Hidden(0);

pub struct EvenOddCoding {
    data_chunks: usize,
    chunk_size: usize,
    layout: SymbolLayout,
    row: Raid5Coding,
}

impl EvenOddCoding {
    pub fn new(data_chunks: usize, parity_chunks: usize, chunk_size: usize) -> Result<Self> {
        let scheme = CodingScheme::EvenOdd;
        if data_chunks == 0 || parity_chunks != 2 {
            return Err(Error::unsupported(
                scheme,
                format!("needs k > 0 and m = 2, got k = {}, m = {}", data_chunks, parity_chunks),
            ));
        }
        let prime = array_code::select_prime(scheme, data_chunks, true, chunk_size)?;
        Ok(Self {
            data_chunks,
            chunk_size,
            layout: SymbolLayout::new(prime, chunk_size),
            row: Raid5Coding::new(data_chunks, 1, chunk_size)?,
        })
    }

    pub fn prime(&self) -> usize {
        self.layout.prime
    }

    fn reencode_diagonal(&self, chunks: &mut [Vec<u8>]) -> Result<()> {
        let k = self.data_chunks;
        let mut parity = vec![0u8; self.chunk_size];
        {
            let data: Vec<&[u8]> = chunks[..k].iter().map(Vec::as_slice).collect();
            self.encode(&data, &mut parity, 2)?;
        }
        chunks[k + 1] = parity;
        Ok(())
    }

    fn data_on_diagonal(&self, d: usize) -> Vec<Cell> {
        let p = self.layout.prime;
        (0..self.data_chunks)
            .flat_map(|chunk| (0..p - 1).map(move |row| (chunk, row)))
            .filter(|&(chunk, row)| (chunk + row) % p == d)
            .map(|(chunk, row)| Cell::Symbol { chunk, row })
            .collect()
    }

    fn equations(&self) -> Vec<Vec<Cell>> {
        let k = self.data_chunks;
        let p = self.layout.prime;

        let mut equations: Vec<Vec<Cell>> = (0..p - 1)
            .map(|row| (0..=k).map(|chunk| Cell::Symbol { chunk, row }).collect())
            .collect();

        let mut adjuster = self.data_on_diagonal(p - 1);
        adjuster.push(ADJUSTER);
        equations.push(adjuster);

        for d in 0..p - 1 {
            let mut cells = self.data_on_diagonal(d);
            cells.push(ADJUSTER);
            cells.push(Cell::Symbol { chunk: k + 1, row: d });
            equations.push(cells);
        }
        equations
    }
}

impl Coding for EvenOddCoding {
    fn scheme(&self) -> CodingScheme {
        CodingScheme::EvenOdd
    }

    fn data_chunks(&self) -> usize {
        self.data_chunks
    }

    fn parity_chunks(&self) -> usize {
        2
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
        if index == 1 {
            return self.row.encode_range(data, parity, 1, start, end);
        }

        let p = self.layout.prime;
        let s = self.layout.symbol_size;
        for (c, chunk) in data.iter().enumerate() {
            let Some(span) = chunk_span(c, self.chunk_size, start, end) else {
                continue;
            };
            for (r, seg) in self.layout.segments(span) {
                let src = &chunk[r * s + seg.start..r * s + seg.end];
                let d = (c + r) % p;
                if d == p - 1 {
                    // Feeds S, which every diagonal parity symbol carries
                    for target in 0..p - 1 {
                        xor_into(&mut parity[target * s + seg.start..target * s + seg.end], src);
                    }
                } else {
                    xor_into(&mut parity[d * s + seg.start..d * s + seg.end], src);
                }
            }
        }
        Ok(())
    }

    fn decode(&self, chunks: &mut [Vec<u8>], status: &BitmaskArray) -> Result<()> {
        let k = self.data_chunks;
        let lost = lost_chunks(self, chunks, status)?;

        match lost.as_slice() {
            [] => Ok(()),
            [diagonal] if *diagonal == k + 1 => self.reencode_diagonal(chunks),
            [single] => {
                self.row.rebuild(chunks, *single);
                Ok(())
            }
            [first, diagonal] if *diagonal == k + 1 => {
                self.row.rebuild(chunks, *first);
                self.reencode_diagonal(chunks)
            }
            _ => {
                let mut unknowns = array_code::lost_symbols(&lost, &self.layout);
                unknowns.push(ADJUSTER);
                let values = array_code::solve(&self.equations(), &unknowns, chunks, &self.layout).ok_or(
                    Error::Unrecoverable {
                        failed: lost.len(),
                        tolerance: 2,
                    },
                )?;
                array_code::apply_solution(chunks, &unknowns, values, &self.layout);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure::test_util::*;

    #[test]
    fn test_prime_selection() {
        assert_eq!(EvenOddCoding::new(4, 2, 64).unwrap().prime(), 5);
        assert_eq!(EvenOddCoding::new(5, 2, 64).unwrap().prime(), 5);
        // Never 2, even for a single data chunk
        assert_eq!(EvenOddCoding::new(1, 2, 64).unwrap().prime(), 3);
    }

    #[test]
    fn test_recover_every_double_failure() {
        for (k, chunk_size) in [(4, 64), (5, 32), (3, 12), (1, 8)] {
            let coding = EvenOddCoding::new(k, 2, chunk_size).unwrap();
            assert_recovers_all(&coding, 2, 50 + k as u64);
        }
    }

    #[test]
    fn test_triple_failure_rejected() {
        let coding = EvenOddCoding::new(4, 2, 64).unwrap();
        let stripe = encode_stripe(&coding, &random_chunks(4, 64, 51));
        assert!(lose_and_decode(&coding, &stripe, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_delta_encode_matches_full_encode() {
        let coding = EvenOddCoding::new(4, 2, 64).unwrap();
        // Touch symbols on the adjuster diagonal as well as ordinary ones
        assert_delta_matches_full(&coding, 0, 4 * 64, 52);
        assert_delta_matches_full(&coding, 64 + 40, 64 + 56, 53);
    }
}
