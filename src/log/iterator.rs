use super::address::Address;
use super::{Log, Loggable};
use crate::error::Result;

/// Forward iterator over the records of the log.
///
/// Skips the unused end of each file and files that were removed, stops at
/// the high address observed when the iterator was created. After an error
/// the iterator is exhausted.
pub struct LoggableIterator<'a> {
    log: &'a Log,
    address: Address,
    end: Address,
    failed: bool,
}

impl<'a> LoggableIterator<'a> {
    pub(crate) fn new(log: &'a Log, address: Address, end: Address) -> Self {
        Self {
            log,
            address,
            end,
            failed: false,
        }
    }

    /// Address of the next record to be returned.
    pub fn address(&self) -> Address {
        self.address
    }

    fn fail(&mut self, e: crate::Error) -> Option<Result<Loggable>> {
        self.failed = true;
        Some(Err(e))
    }

    /// Moves to the first file after `file_address`. Returns false at the end of the log.
    fn skip_to_next_file(&mut self, file_address: Address) -> Result<bool> {
        match self.log.next_file(file_address)? {
            Some(next) => {
                self.address = next.address();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Iterator for LoggableIterator<'_> {
    type Item = Result<Loggable>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed || self.address >= self.end {
                return None;
            }

            let file = match self.log.file_containing(self.address) {
                Ok(file) => file,
                Err(_) => {
                    // the address is in a removed file or in the gap after a file
                    match self.skip_to_next_file(self.address) {
                        Ok(true) => continue,
                        Ok(false) => return None,
                        Err(e) => return self.fail(e),
                    }
                }
            };

            if self.address >= file.address() + file.length() {
                match self.skip_to_next_file(file.address()) {
                    Ok(true) => continue,
                    Ok(false) => return None,
                    Err(e) => return self.fail(e),
                }
            }

            match self.log.read_header(&file, self.address) {
                Ok(Some(header)) => match self.log.read_body(&file, self.address, header) {
                    Ok(loggable) => {
                        self.address = loggable.end_address();
                        return Some(Ok(loggable));
                    }
                    Err(e) => return self.fail(e),
                },
                Ok(None) => match self.skip_to_next_file(file.address()) {
                    Ok(true) => continue,
                    Ok(false) => return None,
                    Err(e) => return self.fail(e),
                },
                Err(e) => return self.fail(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::loggable::{LoggableToWrite, INTERNAL, LEAF};
    use super::super::RemoveBlockType;
    use super::*;
    use crate::config::LogConfig;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir, file_length: u64) -> Log {
        Log::open(dir.path(), &LogConfig::default().file_length(file_length))
            .unwrap()
            .0
    }

    #[test]
    fn test_iterate_across_files() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir, 1024);

        let mut written = Vec::new();
        for i in 0..20u8 {
            let data = vec![i; 200];
            let address = log.append(LoggableToWrite::new(LEAF, 2, &data)).unwrap();
            written.push((address, data));
        }
        assert!(log.number_of_files() > 1);

        let read: Vec<_> = log
            .iter_from(0)
            .map(|l| l.map(|l| (l.address, l.data)))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, written);
    }

    #[test]
    fn test_restart_from_any_record() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir, 1024);
        let mut addresses = Vec::new();
        for i in 0..10u8 {
            addresses.push(log.append(LoggableToWrite::new(INTERNAL, 3, &[i; 300])).unwrap());
        }

        let from = addresses[4];
        let rest: Vec<_> = log.iter_from(from).map(|l| l.unwrap().address).collect();
        assert_eq!(rest, addresses[4..].to_vec());
    }

    #[test]
    fn test_skips_removed_files() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir, 1024);
        let mut addresses = Vec::new();
        for i in 0..4u8 {
            addresses.push(log.append(LoggableToWrite::new(LEAF, 2, &[i; 900])).unwrap());
        }
        log.remove_file(addresses[1], RemoveBlockType::Delete).unwrap();

        let rest: Vec<_> = log.iter_from(0).map(|l| l.unwrap().address).collect();
        assert_eq!(rest, vec![addresses[0], addresses[2], addresses[3]]);
    }

    #[test]
    fn test_stops_at_high_address_of_creation() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir, 4096);
        log.append(LoggableToWrite::new(LEAF, 2, b"a")).unwrap();
        let mut iter = log.iter_from(0);
        log.append(LoggableToWrite::new(LEAF, 2, b"b")).unwrap();

        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_empty_log() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir, 4096);
        assert!(log.iter_from(0).next().is_none());
    }
}
