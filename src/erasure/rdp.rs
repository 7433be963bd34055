//! Row-Diagonal Parity coding
//!
//! Chunks `0..k` hold data, chunk `k` the row parity and chunk `k + 1` the
//! diagonal parity. Symbol `r` of column `c` (row parity included, as column
//! `k`) lies on diagonal `(c + r) mod p`; diagonal `p - 1` is not stored.
//! Row parity is delegated to a RAID5 instance.

use crate::ds::BitmaskArray;
use crate::erasure::array_code::{self, Cell, SymbolLayout};
use crate::erasure::raid5::Raid5Coding;
use crate::erasure::{check_encode_args, chunk_span, lost_chunks, xor_into, Coding, CodingScheme};
use crate::{Error, Result};

pub struct RdpCoding {
    data_chunks: usize,
    chunk_size: usize,
    layout: SymbolLayout,
    row: Raid5Coding,
}

impl RdpCoding {
    pub fn new(data_chunks: usize, parity_chunks: usize, chunk_size: usize) -> Result<Self> {
        let scheme = CodingScheme::Rdp;
        if data_chunks == 0 || parity_chunks != 2 {
            return Err(Error::unsupported(
                scheme,
                format!("needs k > 0 and m = 2, got k = {}, m = {}", data_chunks, parity_chunks),
            ));
        }
        let prime = array_code::select_prime(scheme, data_chunks + 1, false, chunk_size)?;
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

    pub fn symbol_size(&self) -> usize {
        self.layout.symbol_size
    }

    fn diagonal(&self, column: usize, row: usize) -> usize {
        (column + row) % self.layout.prime
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

    /// Row and diagonal equations over columns `0..=k` plus the diagonal
    /// parity chunk
    fn equations(&self) -> Vec<Vec<Cell>> {
        let k = self.data_chunks;
        let p = self.layout.prime;
        let rows = self.layout.rows();

        let mut equations: Vec<Vec<Cell>> = (0..rows)
            .map(|row| (0..=k).map(|chunk| Cell::Symbol { chunk, row }).collect())
            .collect();
        for d in 0..p - 1 {
            let mut cells: Vec<Cell> = (0..=k)
                .flat_map(|chunk| (0..rows).map(move |row| (chunk, row)))
                .filter(|&(chunk, row)| self.diagonal(chunk, row) == d)
                .map(|(chunk, row)| Cell::Symbol { chunk, row })
                .collect();
            cells.push(Cell::Symbol { chunk: k + 1, row: d });
            equations.push(cells);
        }
        equations
    }
}

impl Coding for RdpCoding {
    fn scheme(&self) -> CodingScheme {
        CodingScheme::Rdp
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

        let k = self.data_chunks;
        let p = self.layout.prime;
        let s = self.layout.symbol_size;
        for (c, chunk) in data.iter().enumerate() {
            let Some(span) = chunk_span(c, self.chunk_size, start, end) else {
                continue;
            };
            for (r, seg) in self.layout.segments(span) {
                let src = &chunk[r * s + seg.start..r * s + seg.end];
                // The data symbol and the row parity symbol it feeds
                for d in [self.diagonal(c, r), self.diagonal(k, r)] {
                    if d != p - 1 {
                        xor_into(&mut parity[d * s + seg.start..d * s + seg.end], src);
                    }
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
                let unknowns = array_code::lost_symbols(&lost, &self.layout);
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
