use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use super::address::{self, Address};
use super::loggable::{Loggable, LoggableHeader, DATABASE_ROOT, HEADER_SIZE};
use crate::error::Result;
use crate::Error;

/// State of the log directory after recovery.
pub(crate) struct Recovered {
    pub files: Vec<(Address, PathBuf)>,
    pub high_address: Address,
    pub root: Option<Loggable>,
}

/// Finds the newest database root and discards everything after it.
///
/// Files are scanned newest first. Within a file the scan stops at the first
/// record that is torn or fails its checksum. The file holding the newest
/// root is truncated right after it and newer files are removed: pages
/// written by a transaction that never appended its root are unreachable.
pub(crate) fn recover(dir: &Path, file_length: u64) -> Result<Recovered> {
    let files = address::list_files(dir)?;
    if let Some((address, _)) = files.iter().find(|(address, _)| address % file_length != 0) {
        return Err(Error::InvalidState(format!(
            "Log file at address {} is not aligned to the file length {}",
            address, file_length
        )));
    }

    for index in (0..files.len()).rev() {
        let (file_address, path) = &files[index];
        let Some(root) = last_root(*file_address, path)? else {
            continue;
        };

        let end = root.end_address() - file_address;
        let file = OpenOptions::new().write(true).open(path)?;
        let len = file.metadata()?.len();
        if len > end {
            tracing::warn!(
                file = ?path,
                discarded = len - end,
                "Truncating log after the last database root"
            );
            file.set_len(end)?;
            file.sync_all()?;
        }

        for (address, newer) in &files[index + 1..] {
            tracing::warn!(file = ?newer, address, "Removing log file written after the last database root");
            fs::remove_file(newer)?;
        }

        return Ok(Recovered {
            high_address: root.end_address(),
            root: Some(root),
            files: files[..=index].to_vec(),
        });
    }

    for (_, path) in &files {
        tracing::warn!(file = ?path, "Removing log file without any database root");
        fs::remove_file(path)?;
    }
    Ok(Recovered {
        files: Vec::new(),
        high_address: 0,
        root: None,
    })
}

/// Outcome of scanning the records of one file.
#[derive(Debug)]
struct FileScan {
    root: Option<Loggable>,
    /// Address of the first record that is torn or fails its checksum.
    damaged: Option<Address>,
    /// Bytes from the damaged record to the end of the file.
    dropped: u64,
}

/// Returns the last intact database root of a file.
fn last_root(file_address: Address, path: &Path) -> Result<Option<Loggable>> {
    let bytes = fs::read(path)?;
    let scan = scan_file(file_address, &bytes);
    if let Some(damaged) = scan.damaged {
        tracing::warn!(
            file = ?path,
            address = damaged,
            dropped = scan.dropped,
            "Damaged record in log file, ignoring everything after it"
        );
    }
    Ok(scan.root)
}

fn scan_file(file_address: Address, bytes: &[u8]) -> FileScan {
    let mut position = 0usize;
    let mut root = None;
    let mut damaged = None;

    while position + HEADER_SIZE <= bytes.len() {
        let address = file_address + position as u64;
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[position..position + HEADER_SIZE]);
        let header = match LoggableHeader::decode(address, &header) {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(_) => {
                damaged = Some(address);
                break;
            }
        };
        let end = position + header.length() as usize;
        if end > bytes.len() {
            damaged = Some(address);
            break;
        }
        let Ok(loggable) = header.finish(address, &bytes[position..end]) else {
            damaged = Some(address);
            break;
        };
        if loggable.type_id == DATABASE_ROOT {
            root = Some(loggable);
        }
        position = end;
    }
    if damaged.is_none() && position < bytes.len() && bytes[position..].iter().any(|b| *b != 0) {
        // a header cut short
        damaged = Some(file_address + position as u64);
    }

    FileScan {
        root,
        dropped: damaged.map_or(0, |_| (bytes.len() - position) as u64),
        damaged,
    }
}

#[cfg(test)]
mod tests {
    use super::super::loggable::{LoggableToWrite, LEAF, NO_STRUCTURE_ID};
    use super::super::Log;
    use super::*;
    use crate::config::LogConfig;
    use std::io::Write;
    use tempfile::TempDir;

    fn config() -> LogConfig {
        LogConfig::default().file_length(1024)
    }

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        let (log, root) = Log::open(dir.path(), &config()).unwrap();
        assert!(root.is_none());
        assert_eq!(log.high_address(), 0);
        assert_eq!(log.number_of_files(), 0);
    }

    #[test]
    fn test_truncates_after_last_root() {
        let dir = TempDir::new().unwrap();
        let root_address;
        {
            let (log, _) = Log::open(dir.path(), &config()).unwrap();
            log.append(LoggableToWrite::new(LEAF, 2, &[1; 100])).unwrap();
            root_address = log
                .append(LoggableToWrite::new(DATABASE_ROOT, NO_STRUCTURE_ID, &[0; 20]))
                .unwrap();
            // uncommitted pages, spilling into the next file
            for _ in 0..4 {
                log.append(LoggableToWrite::new(LEAF, 2, &[2; 400])).unwrap();
            }
            log.sync().unwrap();
            assert!(log.number_of_files() > 1);
        }

        let (log, root) = Log::open(dir.path(), &config()).unwrap();
        let root = root.expect("root should be recovered");
        assert_eq!(root.address, root_address);
        assert_eq!(log.high_address(), root.end_address());
        assert_eq!(log.number_of_files(), 1);
        assert_eq!(log.file_size(0), root.end_address());
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let root_end;
        {
            let (log, _) = Log::open(dir.path(), &config()).unwrap();
            let address = log
                .append(LoggableToWrite::new(DATABASE_ROOT, NO_STRUCTURE_ID, &[0; 20]))
                .unwrap();
            root_end = log.read(address).unwrap().end_address();
            log.sync().unwrap();
        }
        // half a record
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("00000000000.xd"))
            .unwrap();
        file.write_all(&[LEAF, 0, 0, 0, 2, 0, 0, 1, 0, 9, 9]).unwrap();
        drop(file);

        let (log, root) = Log::open(dir.path(), &config()).unwrap();
        assert!(root.is_some());
        assert_eq!(log.high_address(), root_end);
        let next = log.append(LoggableToWrite::new(LEAF, 2, b"x")).unwrap();
        assert_eq!(next, root_end);
    }

    fn records(records: &[LoggableToWrite<'_>]) -> (Vec<u8>, Vec<usize>) {
        let mut bytes = Vec::new();
        let mut offsets = Vec::new();
        for record in records {
            offsets.push(bytes.len());
            bytes.extend(record.encode().unwrap());
        }
        (bytes, offsets)
    }

    #[test]
    fn test_scan_reports_damaged_record() {
        let (mut bytes, offsets) = records(&[
            LoggableToWrite::new(LEAF, 2, &[1; 50]),
            LoggableToWrite::new(DATABASE_ROOT, NO_STRUCTURE_ID, &[0; 20]),
            LoggableToWrite::new(LEAF, 2, &[2; 50]),
            LoggableToWrite::new(DATABASE_ROOT, NO_STRUCTURE_ID, &[0; 20]),
        ]);

        let scan = scan_file(0, &bytes);
        assert_eq!(scan.root.unwrap().address, offsets[3] as u64);
        assert_eq!(scan.damaged, None);
        assert_eq!(scan.dropped, 0);

        // a flipped bit in front of the newest root hides it
        bytes[offsets[2] + HEADER_SIZE + 10] ^= 0x01;
        let scan = scan_file(4096, &bytes);
        assert_eq!(scan.root.unwrap().address, 4096 + offsets[1] as u64);
        assert_eq!(scan.damaged, Some(4096 + offsets[2] as u64));
        assert_eq!(scan.dropped, (bytes.len() - offsets[2]) as u64);
    }

    #[test]
    fn test_scan_of_torn_tail() {
        let (bytes, offsets) = records(&[
            LoggableToWrite::new(DATABASE_ROOT, NO_STRUCTURE_ID, &[0; 20]),
            LoggableToWrite::new(LEAF, 2, &[2; 50]),
        ]);
        let torn = &bytes[..offsets[1] + 5];
        let scan = scan_file(0, torn);
        assert_eq!(scan.root.unwrap().address, 0);
        assert_eq!(scan.damaged, Some(offsets[1] as u64));
        assert_eq!(scan.dropped, 5);

        // the unused zeroed end of a file is not damage
        let mut padded = bytes[..offsets[1]].to_vec();
        padded.extend([0u8; 64]);
        let scan = scan_file(0, &padded);
        assert_eq!(scan.damaged, None);
        assert_eq!(scan.dropped, 0);
    }

    #[test]
    fn test_log_without_root_is_empty() {
        let dir = TempDir::new().unwrap();
        {
            let (log, _) = Log::open(dir.path(), &config()).unwrap();
            log.append(LoggableToWrite::new(LEAF, 2, &[1; 100])).unwrap();
            log.sync().unwrap();
        }
        let (log, root) = Log::open(dir.path(), &config()).unwrap();
        assert!(root.is_none());
        assert_eq!(log.number_of_files(), 0);
        assert!(!dir.path().join("00000000000.xd").exists());
    }
}
