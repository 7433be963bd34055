//! Erasure coding implementations
//!
//! Every scheme implements [`Coding`] over fixed-size chunk buffers: `k` data
//! chunks followed by `m` parity chunks. Encoding is linear, so a parity
//! chunk can be patched in place from the XOR delta of a partial write
//! ([`Coding::encode_range`]) instead of being recomputed from scratch.

pub mod array_code;
pub mod cauchy;
pub mod evenodd;
pub mod galois;
pub mod raid0;
pub mod raid1;
pub mod raid5;
pub mod rdp;
pub mod reed_solomon;

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ds::BitmaskArray;
use crate::{Error, Result};

/// Coding schemes understood by [`create_coding`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodingScheme {
    Raid0,
    Raid1,
    Raid5,
    Cauchy,
    ReedSolomon,
    Rdp,
    EvenOdd,
}

impl CodingScheme {
    pub const ALL: [CodingScheme; 7] = [
        CodingScheme::Raid0,
        CodingScheme::Raid1,
        CodingScheme::Raid5,
        CodingScheme::Cauchy,
        CodingScheme::ReedSolomon,
        CodingScheme::Rdp,
        CodingScheme::EvenOdd,
    ];

    /// Name used in configuration files and on the command line
    pub fn name(&self) -> &'static str {
        match self {
            CodingScheme::Raid0 => "raid0",
            CodingScheme::Raid1 => "raid1",
            CodingScheme::Raid5 => "raid5",
            CodingScheme::Cauchy => "cauchy",
            CodingScheme::ReedSolomon => "reed_solomon",
            CodingScheme::Rdp => "rdp",
            CodingScheme::EvenOdd => "even_odd",
        }
    }
}

impl fmt::Display for CodingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodingScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.to_ascii_lowercase().replace('-', "_");
        CodingScheme::ALL
            .into_iter()
            .find(|scheme| match normalized.as_str() {
                "rs" => *scheme == CodingScheme::ReedSolomon,
                "evenodd" => *scheme == CodingScheme::EvenOdd,
                name => scheme.name() == name,
            })
            .ok_or_else(|| Error::InvalidConfig(format!("unknown coding scheme '{}'", s)))
    }
}

/// Common capability of all coding schemes
pub trait Coding: Send + Sync {
    fn scheme(&self) -> CodingScheme;

    /// Number of data chunks per stripe (`k`)
    fn data_chunks(&self) -> usize;

    /// Number of parity chunks per stripe (`m`)
    fn parity_chunks(&self) -> usize;

    /// Get total number of chunks (data + parity)
    fn total_chunks(&self) -> usize {
        self.data_chunks() + self.parity_chunks()
    }

    /// Size of every chunk buffer in bytes
    fn chunk_size(&self) -> usize;

    /// Number of simultaneous chunk losses `decode` can repair
    fn fault_tolerance(&self) -> usize {
        self.parity_chunks()
    }

    /// Compute parity chunk `index` (1-based) from the `k` data chunks,
    /// overwriting `parity`
    fn encode(&self, data: &[&[u8]], parity: &mut [u8], index: usize) -> Result<()> {
        let end = self.data_chunks() * self.chunk_size();
        check_encode_args(self, data, parity, index, 0, end)?;
        parity.fill(0);
        self.encode_range(data, parity, index, 0, end)
    }

    /// XOR the parity delta of `data` restricted to `[start, end)` into
    /// `parity`
    ///
    /// The range is expressed in the concatenated data space, where byte `o`
    /// of data chunk `c` sits at `c * chunk_size + o`. `data` holds the XOR
    /// delta of the write (zeros elsewhere).
    fn encode_range(
        &self,
        data: &[&[u8]],
        parity: &mut [u8],
        index: usize,
        start: usize,
        end: usize,
    ) -> Result<()>;

    /// Rebuild every chunk whose bit is unset in entry 0 of `status`
    ///
    /// `chunks` holds all `n` chunks, data first. Surviving chunks are never
    /// modified. Returns [`Error::Unrecoverable`] when more chunks are lost
    /// than the scheme tolerates.
    fn decode(&self, chunks: &mut [Vec<u8>], status: &BitmaskArray) -> Result<()>;
}

/// Create a coding scheme instance
pub fn create_coding(
    scheme: CodingScheme,
    data_chunks: usize,
    parity_chunks: usize,
    chunk_size: usize,
) -> Result<Box<dyn Coding>> {
    Ok(match scheme {
        CodingScheme::Raid0 => Box::new(raid0::Raid0Coding::new(data_chunks, parity_chunks, chunk_size)?),
        CodingScheme::Raid1 => Box::new(raid1::Raid1Coding::new(data_chunks, parity_chunks, chunk_size)?),
        CodingScheme::Raid5 => Box::new(raid5::Raid5Coding::new(data_chunks, parity_chunks, chunk_size)?),
        CodingScheme::Cauchy => Box::new(cauchy::CauchyCoding::new(data_chunks, parity_chunks, chunk_size)?),
        CodingScheme::ReedSolomon => Box::new(reed_solomon::ReedSolomonCoding::new(data_chunks, parity_chunks, chunk_size)?),
        CodingScheme::Rdp => Box::new(rdp::RdpCoding::new(data_chunks, parity_chunks, chunk_size)?),
        CodingScheme::EvenOdd => Box::new(evenodd::EvenOddCoding::new(data_chunks, parity_chunks, chunk_size)?),
    })
}

/// Validate the arguments shared by `encode` and `encode_range`
pub(crate) fn check_encode_args<C: Coding + ?Sized>(
    coding: &C,
    data: &[&[u8]],
    parity: &[u8],
    index: usize,
    start: usize,
    end: usize,
) -> Result<()> {
    let k = coding.data_chunks();
    let chunk_size = coding.chunk_size();

    if index == 0 || index > coding.parity_chunks() {
        return Err(Error::InvalidParityIndex {
            index,
            parity_chunks: coding.parity_chunks(),
        });
    }
    if data.len() != k {
        return Err(Error::InvalidChunk(format!(
            "expected {} data chunks, got {}",
            k,
            data.len()
        )));
    }
    if let Some(chunk) = data.iter().find(|c| c.len() != chunk_size) {
        return Err(Error::InvalidChunk(format!(
            "data chunk of {} bytes, chunk size is {}",
            chunk.len(),
            chunk_size
        )));
    }
    if parity.len() != chunk_size {
        return Err(Error::InvalidChunk(format!(
            "parity chunk of {} bytes, chunk size is {}",
            parity.len(),
            chunk_size
        )));
    }
    if start > end || end > k * chunk_size {
        return Err(Error::InvalidChunk(format!(
            "byte range {}..{} outside {} data bytes",
            start,
            end,
            k * chunk_size
        )));
    }
    Ok(())
}

/// Validate decode input and list the lost chunk indices
pub(crate) fn lost_chunks<C: Coding + ?Sized>(
    coding: &C,
    chunks: &[Vec<u8>],
    status: &BitmaskArray,
) -> Result<Vec<usize>> {
    let n = coding.total_chunks();
    if chunks.len() != n {
        return Err(Error::InvalidChunk(format!(
            "expected {} chunks, got {}",
            n,
            chunks.len()
        )));
    }
    if status.size() < n || status.entries() == 0 {
        return Err(Error::InvalidChunk(format!(
            "status bitmap covers {} chunks, stripe has {}",
            status.size(),
            n
        )));
    }
    if let Some(chunk) = chunks.iter().find(|c| c.len() != coding.chunk_size()) {
        return Err(Error::InvalidChunk(format!(
            "chunk of {} bytes, chunk size is {}",
            chunk.len(),
            coding.chunk_size()
        )));
    }

    let lost: Vec<usize> = (0..n).filter(|&i| !status.check(0, i)).collect();
    if lost.len() > coding.fault_tolerance() {
        return Err(Error::Unrecoverable {
            failed: lost.len(),
            tolerance: coding.fault_tolerance(),
        });
    }
    Ok(lost)
}

/// Bytes of data chunk `chunk` covered by the concatenated range
/// `[start, end)`, as a range local to that chunk
pub(crate) fn chunk_span(chunk: usize, chunk_size: usize, start: usize, end: usize) -> Option<Range<usize>> {
    let base = chunk * chunk_size;
    let lo = start.max(base);
    let hi = end.min(base + chunk_size);
    (lo < hi).then(|| lo - base..hi - base)
}

/// `dst ^= src`
pub(crate) fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_from_str() {
        assert_eq!("cauchy".parse::<CodingScheme>().unwrap(), CodingScheme::Cauchy);
        assert_eq!("RS".parse::<CodingScheme>().unwrap(), CodingScheme::ReedSolomon);
        assert_eq!("even-odd".parse::<CodingScheme>().unwrap(), CodingScheme::EvenOdd);
        assert_eq!("evenodd".parse::<CodingScheme>().unwrap(), CodingScheme::EvenOdd);
        assert!("raid6".parse::<CodingScheme>().is_err());
    }

    #[test]
    fn test_chunk_span() {
        assert_eq!(chunk_span(0, 16, 4, 20), Some(4..16));
        assert_eq!(chunk_span(1, 16, 4, 20), Some(0..4));
        assert_eq!(chunk_span(2, 16, 4, 20), None);
        assert_eq!(chunk_span(1, 16, 16, 16), None);
    }

    #[test]
    fn test_factory_builds_every_scheme() {
        let params = [
            (CodingScheme::Raid0, 4, 0),
            (CodingScheme::Raid1, 1, 2),
            (CodingScheme::Raid5, 4, 1),
            (CodingScheme::Cauchy, 4, 2),
            (CodingScheme::ReedSolomon, 4, 2),
            (CodingScheme::Rdp, 4, 2),
            (CodingScheme::EvenOdd, 4, 2),
        ];
        for (scheme, k, m) in params {
            let coding = create_coding(scheme, k, m, 96).unwrap();
            assert_eq!(coding.scheme(), scheme);
            assert_eq!(coding.total_chunks(), k + m);
        }
    }

    #[test]
    fn test_invalid_parity_index() {
        let coding = create_coding(CodingScheme::Cauchy, 2, 2, 8).unwrap();
        let data = vec![vec![1u8; 8], vec![2u8; 8]];
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let mut parity = vec![0u8; 8];

        assert!(matches!(
            coding.encode(&refs, &mut parity, 0),
            Err(Error::InvalidParityIndex { index: 0, .. })
        ));
        assert!(matches!(
            coding.encode(&refs, &mut parity, 3),
            Err(Error::InvalidParityIndex { index: 3, .. })
        ));
    }
}
