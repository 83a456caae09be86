//! Mapping between log addresses and log file names.
//!
//! A log file starting at byte offset `address` is named after
//! `address / 1024`, written as 11 base-32 digits (most significant first)
//! followed by `.xd`:
//!
//! ```text
//! address 0        -> 00000000000.xd
//! address 1024     -> 00000000001.xd
//! address 32768    -> 00000000010.xd
//! ```
//!
//! 11 digits of 5 bits spell 55 bits of block numbers, but addresses are
//! 64 bits wide, so only blocks up to `u64::MAX / 1024` (`fvvvvvvvvvv.xd`)
//! name a real file. Names above that are rejected.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

/// Byte offset into the log.
pub type Address = u64;

/// Marker for "no address", e.g. the root of a tree that was never saved.
pub const NULL_ADDRESS: Address = u64::MAX;

/// Log files are aligned by kilobytes.
pub const LOG_BLOCK_ALIGNMENT: u64 = 1024;
pub const LOG_FILE_NAME_LENGTH: usize = 11;
pub const LOG_FILE_EXTENSION: &str = ".xd";
pub const LOG_FILE_NAME_WITH_EXT_LENGTH: usize = LOG_FILE_NAME_LENGTH + LOG_FILE_EXTENSION.len();
/// Suffix given to reclaimed files when the collector renames instead of deleting.
pub const DELETED_FILE_EXTENSION: &str = ".del";

const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
const MAX_BLOCK: u64 = u64::MAX / LOG_BLOCK_ALIGNMENT;

/// Reverse lookup of `ALPHABET`, -1 for characters outside of it.
const ALPHABET_INDEX: [i8; 128] = {
    let mut index = [-1i8; 128];
    let mut i = 0;
    while i < ALPHABET.len() {
        index[ALPHABET[i] as usize] = i as i8;
        i += 1;
    }
    index
};

/// Returns the file name of the log file starting at `address`.
pub fn file_name(address: Address) -> Result<String> {
    if address % LOG_BLOCK_ALIGNMENT != 0 {
        return Err(Error::InvalidAddress(format!(
            "Starting address of a log file is badly aligned: {}",
            address
        )));
    }
    let mut block = address / LOG_BLOCK_ALIGNMENT;

    let mut name = [0u8; LOG_FILE_NAME_LENGTH];
    for slot in name.iter_mut().rev() {
        *slot = ALPHABET[(block & 0x1f) as usize];
        block >>= 5;
    }

    let mut result = String::with_capacity(LOG_FILE_NAME_WITH_EXT_LENGTH);
    result.extend(name.iter().map(|b| *b as char));
    result.push_str(LOG_FILE_EXTENSION);
    Ok(result)
}

/// Parses a log file name back into the starting address of the file.
pub fn address_of(name: &str) -> Result<Address> {
    let invalid = || Error::InvalidAddress(format!("Invalid log file name: {}", name));

    if name.len() != LOG_FILE_NAME_WITH_EXT_LENGTH || !name.ends_with(LOG_FILE_EXTENSION) {
        return Err(invalid());
    }

    let mut block = 0u64;
    for byte in name.as_bytes()[..LOG_FILE_NAME_LENGTH].iter() {
        let digit = ALPHABET_INDEX.get(*byte as usize).copied().unwrap_or(-1);
        if digit < 0 {
            return Err(invalid());
        }
        block = (block << 5) | digit as u64;
    }
    if block > MAX_BLOCK {
        return Err(invalid());
    }
    block.checked_mul(LOG_BLOCK_ALIGNMENT).ok_or_else(invalid)
}

pub fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| address_of(name).is_ok())
}

/// Lists the log files of `dir` ordered by address.
pub fn list_files(dir: &Path) -> Result<Vec<(Address, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.len() != LOG_FILE_NAME_WITH_EXT_LENGTH || !name.ends_with(LOG_FILE_EXTENSION) {
            continue;
        }
        if let Ok(address) = address_of(name) {
            files.push((address, entry.path()));
        }
    }
    files.sort_by_key(|(address, _)| *address);
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_names() {
        assert_eq!(file_name(0).unwrap(), "00000000000.xd");
        assert_eq!(file_name(1024).unwrap(), "00000000001.xd");
        assert_eq!(file_name(31 * 1024).unwrap(), "0000000000v.xd");
        assert_eq!(file_name(32 * 1024).unwrap(), "00000000010.xd");
        assert_eq!(file_name(MAX_BLOCK * 1024).unwrap(), "fvvvvvvvvvv.xd");
        assert_eq!(address_of("fvvvvvvvvvv.xd").unwrap(), MAX_BLOCK * 1024);
    }

    #[test]
    fn test_round_trip() {
        let mut block = 1u64;
        while block <= MAX_BLOCK {
            for address in [block * 1024, (block - 1) * 1024, (block + 7).min(MAX_BLOCK) * 1024] {
                let name = file_name(address).unwrap();
                assert_eq!(name.len(), LOG_FILE_NAME_WITH_EXT_LENGTH);
                assert_eq!(address_of(&name).unwrap(), address);
            }
            block = block * 3 + 1;
        }
    }

    #[test]
    fn test_misaligned_address() {
        assert!(matches!(file_name(1), Err(Error::InvalidAddress(_))));
        assert!(matches!(file_name(1023), Err(Error::InvalidAddress(_))));
        assert!(matches!(file_name(u64::MAX), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_names_beyond_the_address_space() {
        for name in ["vvvvvvvvvvv.xd", "g0000000000.xd", "h000000000v.xd"] {
            assert!(
                matches!(address_of(name), Err(Error::InvalidAddress(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_malformed_names() {
        for name in [
            "",
            "00000000000",
            "0000000000.xd",
            "000000000000.xd",
            "00000000000.xx",
            "0000000000w.xd",
            "0000000000A.xd",
            "00000000-00.xd",
            "0000000000\u{e9}.xd",
        ] {
            assert!(
                matches!(address_of(name), Err(Error::InvalidAddress(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_list_files_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        for name in ["00000000002.xd", "00000000000.xd", "00000000001.xd.del", "notalog.xd", "xd.lck"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let files = list_files(dir.path()).unwrap();
        let addresses: Vec<_> = files.iter().map(|(address, _)| *address).collect();
        assert_eq!(addresses, vec![0, 2048]);
        assert!(is_log_file(&files[0].1));
        assert!(!is_log_file(&dir.path().join("notalog.xd")));
    }
}
