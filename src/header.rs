use crate::error::{Error, ErrorKind, Result};

/// On-disk layout of a record header: `magic, tv_sec, tv_usec, mlen`, 16
/// bytes, little-endian. Payload bytes follow immediately in the segment.
pub const HEADER_SIZE: usize = 16;

/// Default magic a freshly-initialized directory stamps into its metastore
/// and every record header it writes.
pub const DEFAULT_HDR_MAGIC: u32 = 0x663A_7318;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: u32,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub mlen: u32,
}

impl RecordHeader {
    pub fn new(magic: u32, tv_sec: u32, tv_usec: u32, mlen: u32) -> Self {
        Self {
            magic,
            tv_sec,
            tv_usec,
            mlen,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tv_sec.to_le_bytes());
        buf[8..12].copy_from_slice(&self.tv_usec.to_le_bytes());
        buf[12..16].copy_from_slice(&self.mlen.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes(bytes[0..4].try_into().expect("slice length")),
            tv_sec: u32::from_le_bytes(bytes[4..8].try_into().expect("slice length")),
            tv_usec: u32::from_le_bytes(bytes[8..12].try_into().expect("slice length")),
            mlen: u32::from_le_bytes(bytes[12..16].try_into().expect("slice length")),
        }
    }

    /// Total on-disk size of this record: header plus payload.
    pub fn record_len(&self) -> u64 {
        HEADER_SIZE as u64 + self.mlen as u64
    }

    pub fn check_magic(&self, expected: u32) -> Result<()> {
        if self.magic == expected {
            Ok(())
        } else {
            Err(Error::with_detail(
                ErrorKind::FileCorrupt,
                format!("record magic {:#010x} != directory magic {:#010x}", self.magic, expected),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = RecordHeader::new(DEFAULT_HDR_MAGIC, 1_700_000_000, 123_456, 11);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let parsed = RecordHeader::from_bytes(&bytes);
        assert_eq!(parsed, header);
    }

    #[test]
    fn record_len_is_header_plus_payload() {
        let header = RecordHeader::new(DEFAULT_HDR_MAGIC, 0, 0, 42);
        assert_eq!(header.record_len(), HEADER_SIZE as u64 + 42);
    }

    #[test]
    fn check_magic_rejects_mismatch() {
        let header = RecordHeader::new(1, 0, 0, 0);
        assert!(header.check_magic(DEFAULT_HDR_MAGIC).is_err());
        assert!(header.check_magic(1).is_ok());
    }
}
