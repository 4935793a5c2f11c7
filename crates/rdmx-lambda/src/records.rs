//! Lambda request and result records.

use byteorder::{ByteOrder, LittleEndian};
use rdmx_verbs::wire::{ensure_len, WireRecord};
use rdmx_verbs::{PeerAddressRecord, WireError};

/// Bytes reserved for the function name, NUL padded.
pub const FUNCTION_NAME_LEN: usize = 128;

/// Describes one request. Sent together with the caller's return address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LambdaMetadata {
    pub function_name: String,
    pub code_size: u64,
    pub input_size: u64,
    pub entry_offset: u64,
}

/// First write of every request.
///
/// Layout (184 bytes):
///
/// | offset | field         | type       |
/// |--------|---------------|------------|
/// | 0      | function_name | [u8; 128]  |
/// | 128    | code_size     | u64        |
/// | 136    | input_size    | u64        |
/// | 144    | entry_offset  | u64        |
/// | 152    | return record | 32 bytes   |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LambdaRequestHeader {
    pub metadata: LambdaMetadata,
    /// Where the result record must be written.
    pub return_to: PeerAddressRecord,
}

impl WireRecord for LambdaRequestHeader {
    const SIZE: usize = FUNCTION_NAME_LEN + 24 + PeerAddressRecord::SIZE;

    fn encode_into(&self, out: &mut [u8]) -> Result<(), WireError> {
        ensure_len(out, Self::SIZE)?;
        let name = self.metadata.function_name.as_bytes();
        // One byte is kept for the terminating NUL.
        if name.len() >= FUNCTION_NAME_LEN {
            return Err(WireError::FieldTooLong {
                field: "function_name",
                len: name.len(),
                max: FUNCTION_NAME_LEN - 1,
            });
        }
        out[..FUNCTION_NAME_LEN].fill(0);
        out[..name.len()].copy_from_slice(name);
        LittleEndian::write_u64(&mut out[128..136], self.metadata.code_size);
        LittleEndian::write_u64(&mut out[136..144], self.metadata.input_size);
        LittleEndian::write_u64(&mut out[144..152], self.metadata.entry_offset);
        self.return_to.encode_into(&mut out[152..Self::SIZE])
    }

    fn decode(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, Self::SIZE)?;
        let raw = &buf[..FUNCTION_NAME_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(FUNCTION_NAME_LEN);
        let function_name = std::str::from_utf8(&raw[..end])
            .map_err(|_| WireError::InvalidUtf8 {
                field: "function_name",
            })?
            .to_string();
        Ok(Self {
            metadata: LambdaMetadata {
                function_name,
                code_size: LittleEndian::read_u64(&buf[128..136]),
                input_size: LittleEndian::read_u64(&buf[136..144]),
                entry_offset: LittleEndian::read_u64(&buf[144..152]),
            },
            return_to: PeerAddressRecord::decode(&buf[152..Self::SIZE])?,
        })
    }
}

/// Bytes before the output in a result record.
pub const RESULT_HEADER_LEN: usize = 12;

/// What the server writes back.
///
/// `status: i32 @0 | output_size: u64 @4 | output @12`, little-endian. The
/// output is cut to whatever fits the buffer, while `output_size` keeps the
/// size the function reported.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LambdaResult {
    pub status: i32,
    pub output_size: u64,
    pub output: Vec<u8>,
}

impl LambdaResult {
    pub fn new(status: i32, output: Vec<u8>) -> Self {
        Self {
            status,
            output_size: output.len() as u64,
            output,
        }
    }

    pub fn rejected(rejection: Rejection) -> Self {
        Self::new(rejection.status(), Vec::new())
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// True when the buffer could not hold everything the function produced.
    pub fn is_truncated(&self) -> bool {
        (self.output.len() as u64) < self.output_size
    }

    pub fn rejection(&self) -> Option<Rejection> {
        Rejection::from_status(self.status)
    }

    /// Output interpreted as a NUL-terminated string.
    pub fn output_str(&self) -> String {
        let end = self
            .output
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.output.len());
        String::from_utf8_lossy(&self.output[..end]).into_owned()
    }

    /// Encodes into `out`, truncating the output to fit. Returns the number
    /// of bytes written.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize, WireError> {
        ensure_len(out, RESULT_HEADER_LEN)?;
        let copied = self.output.len().min(out.len() - RESULT_HEADER_LEN);
        LittleEndian::write_i32(&mut out[0..4], self.status);
        LittleEndian::write_u64(&mut out[4..12], self.output_size);
        out[RESULT_HEADER_LEN..RESULT_HEADER_LEN + copied].copy_from_slice(&self.output[..copied]);
        Ok(RESULT_HEADER_LEN + copied)
    }

    /// Decodes a record that occupies at most `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        ensure_len(buf, RESULT_HEADER_LEN)?;
        let status = LittleEndian::read_i32(&buf[0..4]);
        let output_size = LittleEndian::read_u64(&buf[4..12]);
        let available = buf.len() - RESULT_HEADER_LEN;
        let copied = usize::try_from(output_size).map_or(available, |n| n.min(available));
        Ok(Self {
            status,
            output_size,
            output: buf[RESULT_HEADER_LEN..RESULT_HEADER_LEN + copied].to_vec(),
        })
    }
}

/// Why the server refused to run a request. Sent as a negative status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// `code_size` is zero or above the code region.
    CodeSize,
    /// `entry_offset` is not inside the code.
    EntryOffset,
    /// `input_size` does not fit the input region.
    InputSize,
    /// The execution policy refused the code.
    Policy,
    /// A phase arrived with an unexpected length.
    Protocol,
}

pub const REJECTED_CODE_SIZE: i32 = -1;
pub const REJECTED_ENTRY_OFFSET: i32 = -2;
pub const REJECTED_INPUT_SIZE: i32 = -3;
pub const REJECTED_BY_POLICY: i32 = -4;
pub const REJECTED_PROTOCOL: i32 = -5;

impl Rejection {
    pub fn status(self) -> i32 {
        match self {
            Rejection::CodeSize => REJECTED_CODE_SIZE,
            Rejection::EntryOffset => REJECTED_ENTRY_OFFSET,
            Rejection::InputSize => REJECTED_INPUT_SIZE,
            Rejection::Policy => REJECTED_BY_POLICY,
            Rejection::Protocol => REJECTED_PROTOCOL,
        }
    }

    pub fn from_status(status: i32) -> Option<Self> {
        match status {
            REJECTED_CODE_SIZE => Some(Rejection::CodeSize),
            REJECTED_ENTRY_OFFSET => Some(Rejection::EntryOffset),
            REJECTED_INPUT_SIZE => Some(Rejection::InputSize),
            REJECTED_BY_POLICY => Some(Rejection::Policy),
            REJECTED_PROTOCOL => Some(Rejection::Protocol),
            _ => None,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Rejection::CodeSize => "invalid code size",
            Rejection::EntryOffset => "entry offset outside code",
            Rejection::InputSize => "input too large",
            Rejection::Policy => "refused by execution policy",
            Rejection::Protocol => "protocol violation",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdmx_verbs::Gid;

    fn header() -> LambdaRequestHeader {
        LambdaRequestHeader {
            metadata: LambdaMetadata {
                function_name: "process_data".into(),
                code_size: 62,
                input_size: 3,
                entry_offset: 0x35,
            },
            return_to: PeerAddressRecord {
                qp_num: 17,
                gid: Gid::new([1; 16]),
                buffer_addr: 0x1000,
                rkey: 0x5a00_0003,
            },
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = header().encode().unwrap();
        assert_eq!(bytes.len(), 184);
        assert_eq!(&bytes[..12], b"process_data");
        assert!(bytes[12..128].iter().all(|&b| b == 0));
        assert_eq!(&bytes[128..136], &62u64.to_le_bytes());
        assert_eq!(&bytes[136..144], &3u64.to_le_bytes());
        assert_eq!(&bytes[144..152], &0x35u64.to_le_bytes());
        assert_eq!(&bytes[152..156], &17u32.to_le_bytes());
        assert_eq!(LambdaRequestHeader::decode(&bytes).unwrap(), header());
    }

    #[test]
    fn test_header_name_limits() {
        let mut h = header();
        h.metadata.function_name = "x".repeat(127);
        assert!(h.encode().is_ok());
        h.metadata.function_name = "x".repeat(128);
        assert_eq!(
            h.encode().unwrap_err(),
            WireError::FieldTooLong {
                field: "function_name",
                len: 128,
                max: 127
            }
        );

        let mut bytes = header().encode().unwrap();
        bytes[0] = 0xff;
        assert!(matches!(
            LambdaRequestHeader::decode(&bytes),
            Err(WireError::InvalidUtf8 { .. })
        ));
        assert!(LambdaRequestHeader::decode(&bytes[..183]).is_err());
    }

    #[test]
    fn test_result_layout() {
        let result = LambdaResult::new(0, b"ABC\0".to_vec());
        let mut buf = [0u8; 64];
        let n = result.encode_into(&mut buf).unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf[0..4], &0i32.to_le_bytes());
        assert_eq!(&buf[4..12], &4u64.to_le_bytes());
        assert_eq!(&buf[12..16], b"ABC\0");

        let decoded = LambdaResult::decode(&buf).unwrap();
        assert_eq!(decoded, result);
        assert_eq!(decoded.output_str(), "ABC");
        assert!(!decoded.is_truncated());
    }

    #[test]
    fn test_result_truncates_to_buffer() {
        let result = LambdaResult::new(3, vec![b'z'; 100]);
        let mut buf = [0u8; 32];
        assert_eq!(result.encode_into(&mut buf).unwrap(), 32);

        let decoded = LambdaResult::decode(&buf).unwrap();
        assert_eq!(decoded.status, 3);
        assert_eq!(decoded.output_size, 100);
        assert_eq!(decoded.output.len(), 20);
        assert!(decoded.is_truncated());
    }

    #[test]
    fn test_negative_status_maps_to_rejection() {
        for r in [
            Rejection::CodeSize,
            Rejection::EntryOffset,
            Rejection::InputSize,
            Rejection::Policy,
            Rejection::Protocol,
        ] {
            let result = LambdaResult::rejected(r);
            assert!(result.status < 0);
            assert_eq!(result.rejection(), Some(r));
        }
        assert_eq!(Rejection::from_status(0), None);
        assert_eq!(Rejection::from_status(7), None);
    }
}
