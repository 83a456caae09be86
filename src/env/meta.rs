//! Records of the meta tree and the database root.
//!
//! ```text
//! database root:  meta_root:u64 | txn_id:u64 | next_structure_id:u32
//! meta tree:      store name -> bincode(StoreMeta)
//! ```

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::encoding::bincode;
use crate::error::Result;
use crate::log::{Address, Loggable};
use crate::tree::BTree;
use crate::Error;

/// Where a store lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub structure_id: u32,
    pub root_address: Address,
    pub duplicates: bool,
}

impl StoreMeta {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}

pub const DATABASE_ROOT_SIZE: usize = 20;

/// Payload of the loggable every commit ends with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseRoot {
    pub meta_root: Address,
    pub txn_id: u64,
    pub next_structure_id: u32,
}

impl DatabaseRoot {
    pub fn encode(&self) -> [u8; DATABASE_ROOT_SIZE] {
        let mut buf = [0u8; DATABASE_ROOT_SIZE];
        BigEndian::write_u64(&mut buf[0..8], self.meta_root);
        BigEndian::write_u64(&mut buf[8..16], self.txn_id);
        BigEndian::write_u32(&mut buf[16..20], self.next_structure_id);
        buf
    }

    pub fn decode(loggable: &Loggable) -> Result<Self> {
        let data = &loggable.data;
        if data.len() != DATABASE_ROOT_SIZE {
            return Err(Error::CorruptedLog(format!(
                "Database root at address {} has {} bytes",
                loggable.address,
                data.len()
            )));
        }
        Ok(Self {
            meta_root: BigEndian::read_u64(&data[0..8]),
            txn_id: BigEndian::read_u64(&data[8..16]),
            next_structure_id: BigEndian::read_u32(&data[16..20]),
        })
    }
}

/// The published state of an environment: what a new transaction sees.
#[derive(Debug)]
pub(crate) struct MetaState {
    pub meta: BTree,
    /// Address and length of the database root loggable.
    pub root: Option<(Address, u64)>,
    pub txn_id: u64,
    pub next_structure_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::loggable::{DATABASE_ROOT, NO_STRUCTURE_ID};

    #[test]
    fn test_database_root_layout() {
        let root = DatabaseRoot {
            meta_root: 0x0102,
            txn_id: 7,
            next_structure_id: 3,
        };
        let loggable = Loggable {
            address: 0,
            type_id: DATABASE_ROOT,
            structure_id: NO_STRUCTURE_ID,
            data: root.encode().to_vec(),
        };
        assert_eq!(&loggable.data[..8], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(DatabaseRoot::decode(&loggable).unwrap(), root);
    }

    #[test]
    fn test_short_database_root() {
        let loggable = Loggable {
            address: 42,
            type_id: DATABASE_ROOT,
            structure_id: NO_STRUCTURE_ID,
            data: vec![0; 12],
        };
        assert!(matches!(
            DatabaseRoot::decode(&loggable),
            Err(Error::CorruptedLog(_))
        ));
    }

    #[test]
    fn test_store_meta_encoding() {
        let meta = StoreMeta {
            structure_id: 9,
            root_address: u64::MAX,
            duplicates: true,
        };
        assert_eq!(StoreMeta::decode(&meta.encode().unwrap()).unwrap(), meta);
        assert!(StoreMeta::decode(&[1, 2]).is_err());
    }
}
