//! Fixed-size little-endian records.
//!
//! Every record has an explicit byte layout; nothing is transmitted as a raw
//! in-memory struct.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::buf::RemoteTarget;
use crate::types::Gid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("insufficient data: need {need} bytes but only {have} remain")]
    InsufficientData { need: usize, have: usize },
    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },
    #[error("{field} is {len} bytes, at most {max} fit")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

/// A record with a fixed encoded size.
pub trait WireRecord: Sized {
    const SIZE: usize;

    /// Writes exactly `SIZE` bytes at the start of `out`.
    fn encode_into(&self, out: &mut [u8]) -> Result<(), WireError>;

    /// Reads from the first `SIZE` bytes of `buf`; trailing bytes are ignored.
    fn decode(buf: &[u8]) -> Result<Self, WireError>;

    fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = vec![0u8; Self::SIZE];
        self.encode_into(&mut out)?;
        Ok(out)
    }
}

/// Fails unless `buf` holds at least `need` bytes.
pub fn ensure_len(buf: &[u8], need: usize) -> Result<(), WireError> {
    if buf.len() < need {
        return Err(WireError::InsufficientData {
            need,
            have: buf.len(),
        });
    }
    Ok(())
}

/// What each side tells the other over the handshake channel.
///
/// Layout (32 bytes):
///
/// | offset | field       | type     |
/// |--------|-------------|----------|
/// | 0      | qp_num      | u32      |
/// | 4      | gid         | [u8; 16] |
/// | 20     | buffer_addr | u64      |
/// | 28     | rkey        | u32      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerAddressRecord {
    pub qp_num: u32,
    pub gid: Gid,
    pub buffer_addr: u64,
    pub rkey: u32,
}

impl PeerAddressRecord {
    /// Target descriptor for one-sided operations against this peer's buffer.
    pub fn remote_target(&self) -> RemoteTarget {
        RemoteTarget::new(self.buffer_addr, self.rkey)
    }
}

impl WireRecord for PeerAddressRecord {
    const SIZE: usize = 32;

    fn encode_into(&self, out: &mut [u8]) -> Result<(), WireError> {
        if out.len() < Self::SIZE {
            return Err(WireError::InsufficientData {
                need: Self::SIZE,
                have: out.len(),
            });
        }
        LittleEndian::write_u32(&mut out[0..4], self.qp_num);
        out[4..20].copy_from_slice(self.gid.as_bytes());
        LittleEndian::write_u64(&mut out[20..28], self.buffer_addr);
        LittleEndian::write_u32(&mut out[28..32], self.rkey);
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, Self::SIZE)?;
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[4..20]);
        Ok(Self {
            qp_num: LittleEndian::read_u32(&buf[0..4]),
            gid: Gid::new(gid),
            buffer_addr: LittleEndian::read_u64(&buf[20..28]),
            rkey: LittleEndian::read_u32(&buf[28..32]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PeerAddressRecord {
        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        gid[15] = 0x2a;
        PeerAddressRecord {
            qp_num: 0x0001_0203,
            gid: Gid::new(gid),
            buffer_addr: 0x7f00_dead_beef_0000,
            rkey: 0xcafe_babe,
        }
    }

    #[test]
    fn test_peer_record_layout_is_little_endian() {
        let bytes = sample().encode().unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..4], &[0x03, 0x02, 0x01, 0x00]);
        assert_eq!(bytes[4], 0xfe);
        assert_eq!(bytes[19], 0x2a);
        assert_eq!(&bytes[20..28], &0x7f00_dead_beef_0000u64.to_le_bytes());
        assert_eq!(&bytes[28..32], &[0xbe, 0xba, 0xfe, 0xca]);
    }

    #[test]
    fn test_peer_record_decode() {
        let bytes = sample().encode().unwrap();
        assert_eq!(PeerAddressRecord::decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_decode_short_buffer() {
        let err = PeerAddressRecord::decode(&[0u8; 31]).unwrap_err();
        assert_eq!(err, WireError::InsufficientData { need: 32, have: 31 });
    }

    #[test]
    fn test_encode_into_short_buffer() {
        let mut out = [0u8; 16];
        assert!(sample().encode_into(&mut out).is_err());
    }

    #[test]
    fn test_remote_target() {
        let target = sample().remote_target();
        assert_eq!(target.addr, 0x7f00_dead_beef_0000);
        assert_eq!(target.rkey, 0xcafe_babe);
    }
}
