//! Loggable records.
//!
//! Every record appended to the log has the same envelope:
//!
//! ```text
//! +---------+------------------+--------------+---------+-----------+
//! |type:u8  |structure_id:u32  |data_len:u32  | data    |crc32:u32  |
//! +---------+------------------+--------------+---------+-----------+
//! | 1 byte  | 4 bytes          | 4 bytes      | var len | 4 bytes   |
//! +---------+------------------+--------------+---------+-----------+
//! ```
//!
//! Integers are big-endian, the CRC32 covers everything before it. Type 0 is
//! never written, so a zeroed region is recognized as the end of a file.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::address::Address;
use crate::error::Result;
use crate::Error;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const HEADER_SIZE: usize = 9;
pub const TRAILER_SIZE: usize = 4;
pub const OVERHEAD: usize = HEADER_SIZE + TRAILER_SIZE;

/// Loggable not owned by any structure.
pub const NO_STRUCTURE_ID: u32 = 0;
/// Structure id of the tree mapping store names to their roots.
pub const META_TREE_ID: u32 = 1;
/// First id handed out to user stores.
pub const FIRST_USER_STRUCTURE_ID: u32 = 2;

pub const DATABASE_ROOT: u8 = 1;
pub const LEAF: u8 = 2;
pub const INTERNAL: u8 = 3;
pub const BOTTOM_ROOT: u8 = 4;
pub const INTERNAL_ROOT: u8 = 5;

/// An immutable record of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loggable {
    pub address: Address,
    pub type_id: u8,
    pub structure_id: u32,
    pub data: Vec<u8>,
}

impl Loggable {
    /// Bytes the record occupies in the log.
    pub fn length(&self) -> u64 {
        (OVERHEAD + self.data.len()) as u64
    }

    /// Address right past this record.
    pub fn end_address(&self) -> Address {
        self.address + self.length()
    }

    pub fn is_tree_page(&self) -> bool {
        matches!(self.type_id, LEAF | INTERNAL | BOTTOM_ROOT | INTERNAL_ROOT)
    }
}

/// A record waiting to be appended.
#[derive(Debug, Clone, Copy)]
pub struct LoggableToWrite<'a> {
    pub type_id: u8,
    pub structure_id: u32,
    pub data: &'a [u8],
}

impl<'a> LoggableToWrite<'a> {
    pub fn new(type_id: u8, structure_id: u32, data: &'a [u8]) -> Self {
        Self {
            type_id,
            structure_id,
            data,
        }
    }

    pub fn length(&self) -> u64 {
        (OVERHEAD + self.data.len()) as u64
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.type_id == 0 {
            return Err(Error::InvalidInput("Loggable type 0 is reserved".to_string()));
        }
        let data_len = u32::try_from(self.data.len()).map_err(|_| {
            Error::InvalidInput(format!("Loggable is too large: {} bytes", self.data.len()))
        })?;

        let mut buf = Vec::with_capacity(OVERHEAD + self.data.len());
        buf.write_u8(self.type_id)?;
        buf.write_u32::<BigEndian>(self.structure_id)?;
        buf.write_u32::<BigEndian>(data_len)?;
        buf.extend_from_slice(self.data);
        let checksum = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(checksum)?;
        Ok(buf)
    }
}

/// Fixed-size part in front of the record data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggableHeader {
    pub type_id: u8,
    pub structure_id: u32,
    pub data_len: u32,
}

impl LoggableHeader {
    /// Decodes a header. Returns `None` for a zeroed header, which marks the
    /// unused end of a file.
    pub fn decode(address: Address, buf: &[u8; HEADER_SIZE]) -> Result<Option<Self>> {
        let type_id = buf[0];
        if type_id == 0 {
            return Ok(None);
        }
        if type_id > INTERNAL_ROOT {
            return Err(Error::CorruptedLog(format!(
                "Unknown loggable type {} at address {}",
                type_id, address
            )));
        }
        Ok(Some(Self {
            type_id,
            structure_id: BigEndian::read_u32(&buf[1..5]),
            data_len: BigEndian::read_u32(&buf[5..9]),
        }))
    }

    pub fn length(&self) -> u64 {
        (OVERHEAD as u64) + self.data_len as u64
    }

    /// Verifies the checksum of a complete record (header, data and trailer)
    /// and turns it into a loggable.
    pub fn finish(self, address: Address, record: &[u8]) -> Result<Loggable> {
        let body_len = HEADER_SIZE + self.data_len as usize;
        if record.len() != body_len + TRAILER_SIZE {
            return Err(Error::CorruptedLog(format!(
                "Loggable at address {} is truncated",
                address
            )));
        }
        let stored = BigEndian::read_u32(&record[body_len..]);
        let computed = CRC32.checksum(&record[..body_len]);
        if stored != computed {
            return Err(Error::CorruptedLog(format!(
                "Checksum mismatch at address {}: computed = {}, stored = {}",
                address, computed, stored
            )));
        }
        Ok(Loggable {
            address,
            type_id: self.type_id,
            structure_id: self.structure_id,
            data: record[HEADER_SIZE..body_len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(address: Address, bytes: &[u8]) -> Result<Loggable> {
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let header = LoggableHeader::decode(address, &header)?.expect("not a zero header");
        header.finish(address, bytes)
    }

    #[test]
    fn test_encode_decode() {
        let bytes = LoggableToWrite::new(LEAF, 7, b"payload").encode().unwrap();
        assert_eq!(bytes.len(), OVERHEAD + 7);

        let loggable = decode(2048, &bytes).unwrap();
        assert_eq!(loggable.address, 2048);
        assert_eq!(loggable.type_id, LEAF);
        assert_eq!(loggable.structure_id, 7);
        assert_eq!(loggable.data, b"payload");
        assert_eq!(loggable.length(), bytes.len() as u64);
        assert_eq!(loggable.end_address(), 2048 + bytes.len() as u64);
    }

    #[test]
    fn test_zero_header_is_end_of_file() {
        let header = [0u8; HEADER_SIZE];
        assert_eq!(LoggableHeader::decode(0, &header).unwrap(), None);
    }

    #[test]
    fn test_unknown_type() {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = 99;
        assert!(matches!(
            LoggableHeader::decode(0, &header),
            Err(Error::CorruptedLog(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = LoggableToWrite::new(INTERNAL, 3, b"abc").encode().unwrap();
        bytes[HEADER_SIZE] ^= 0xff;
        assert!(matches!(decode(0, &bytes), Err(Error::CorruptedLog(_))));
    }

    #[test]
    fn test_reserved_type() {
        assert!(LoggableToWrite::new(0, 0, b"").encode().is_err());
    }
}
