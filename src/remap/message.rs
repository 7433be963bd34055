//! State message codec
//!
//! ```text
//! [count u8] { [ipv4 4][port 2 BE][state 1] } * count
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use super::RemapState;
use crate::{Error, Result};

/// Largest encoded message
pub const MAX_MESSAGE_SIZE: usize = 4096;
/// Bytes per server record
pub const RECORD_SIZE: usize = 7;

/// Encode the states of up to 255 servers
pub fn encode_states(records: &[(SocketAddrV4, RemapState)]) -> Result<Vec<u8>> {
    let size = 1 + records.len() * RECORD_SIZE;
    if records.len() > u8::MAX as usize || size > MAX_MESSAGE_SIZE {
        return Err(Error::Message(format!(
            "too many servers to include in a message: {}",
            records.len()
        )));
    }

    let mut buf = Vec::with_capacity(size);
    buf.push(records.len() as u8);
    for (server, state) in records {
        buf.extend_from_slice(&server.ip().octets());
        buf.extend_from_slice(&server.port().to_be_bytes());
        buf.push(*state as u8);
    }
    Ok(buf)
}

pub fn decode_states(buf: &[u8]) -> Result<Vec<(SocketAddrV4, RemapState)>> {
    let (&count, body) = buf
        .split_first()
        .ok_or_else(|| Error::Message("empty state message".into()))?;
    let count = count as usize;
    if body.len() < count * RECORD_SIZE {
        return Err(Error::Message(format!(
            "state message holds {} bytes, {} records need {}",
            body.len(),
            count,
            count * RECORD_SIZE
        )));
    }

    body.chunks_exact(RECORD_SIZE)
        .take(count)
        .map(|record| {
            let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
            let port = u16::from_be_bytes([record[4], record[5]]);
            Ok((SocketAddrV4::new(ip, port), RemapState::try_from(record[6])?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn test_wire_layout() {
        let buf = encode_states(&[(server(7, 0x1f90), RemapState::Intermediate)]).unwrap();
        assert_eq!(buf, vec![1, 10, 0, 0, 7, 0x1f, 0x90, 2]);
    }

    #[test]
    fn test_decode_multiple_records() {
        let records = vec![
            (server(1, 9000), RemapState::Degraded),
            (server(2, 9001), RemapState::WaitNormal),
        ];
        let buf = encode_states(&records).unwrap();
        assert_eq!(buf.len(), 1 + 2 * RECORD_SIZE);
        assert_eq!(decode_states(&buf).unwrap(), records);
    }

    #[test]
    fn test_record_limit() {
        let records: Vec<_> = (0..256u32)
            .map(|i| (server(i as u8, i as u16), RemapState::Normal))
            .collect();
        assert!(encode_states(&records[..255]).is_ok());
        assert!(encode_states(&records).is_err());
    }

    #[test]
    fn test_malformed_messages() {
        assert!(decode_states(&[]).is_err());
        // Claims two records, carries one
        assert!(decode_states(&[2, 10, 0, 0, 1, 0, 80, 1]).is_err());
        // Unknown state byte
        assert!(decode_states(&[1, 10, 0, 0, 1, 0, 80, 9]).is_err());
        // Empty but well-formed
        assert!(decode_states(&[0]).unwrap().is_empty());
    }
}
