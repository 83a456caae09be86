//! Append-only log split into fixed-length files.
//!
//! The log is a single address space of bytes. It is cut into files of at
//! most `file_length` bytes, file `n` covering `[n * file_length,
//! (n + 1) * file_length)`. A record never straddles two files: when it does
//! not fit into what is left of the tail file, the log starts the next file
//! and the unused rest of the previous one is never addressed.
//!
//! ```text
//!  00000000000.xd          00000000008.xd          0000000000g.xd
//! +-----------------+-----+-----------------+-----+-------------+
//! | L | L | L | L   | gap | L | L | L | L   | gap | L | L |      <- high address
//! +-----------------+-----+-----------------+-----+-------------+
//! 0                      8K                     16K
//! ```
//!
//! # Durability
//!
//! Appends go through a buffered writer. `flush` hands the buffer to the OS,
//! `sync` additionally fsyncs the tail file and the directory. Readers never
//! observe a torn buffer: reading past the flushed watermark flushes first.
//!
//! # Recovery
//!
//! On open the newest database root record is located and everything written
//! after it is discarded (see [`recovery`]).

pub mod address;
pub mod iterator;
pub mod loggable;
pub mod recovery;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::LogConfig;
use crate::error::Result;
use crate::Error;

pub use address::{Address, NULL_ADDRESS};
pub use iterator::LoggableIterator;
pub use loggable::{Loggable, LoggableToWrite};

use loggable::{LoggableHeader, HEADER_SIZE};

/// Called with the address of every file the log creates.
pub type NewFileListener = Box<dyn Fn(Address) + Send + Sync>;

/// What happens to a reclaimed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveBlockType {
    Delete,
    /// Keep the bytes around as `<name>.del` for external archival.
    Rename,
}

/// Read side of one log file.
#[derive(Debug)]
pub(crate) struct LogFile {
    address: Address,
    path: PathBuf,
    file: File,
    /// Logical length, including bytes still sitting in the tail buffer.
    length: AtomicU64,
}

impl LogFile {
    fn open(address: Address, path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;
        let length = file.metadata()?.len();
        Ok(Self {
            address,
            path,
            file,
            length: AtomicU64::new(length),
        })
    }

    pub(crate) fn address(&self) -> Address {
        self.address
    }

    pub(crate) fn length(&self) -> u64 {
        self.length.load(Ordering::SeqCst)
    }

    fn read_exact_at(&self, buf: &mut [u8], address: Address) -> Result<()> {
        match self.file.read_exact_at(buf, address - self.address) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::CorruptedLog(format!(
                "Unexpected end of file {:?} reading {} bytes at address {}",
                self.path,
                buf.len(),
                address
            ))),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Write side of the tail file.
struct TailWriter {
    address: Address,
    writer: BufWriter<File>,
}

pub struct Log {
    dir: PathBuf,
    file_length: u64,
    write_buffer_size: usize,
    files: RwLock<BTreeMap<Address, Arc<LogFile>>>,
    tail: Mutex<Option<TailWriter>>,
    /// Address the next record is appended at.
    high_address: AtomicU64,
    /// Everything below is readable through the file handles.
    flushed_address: AtomicU64,
    listeners: RwLock<Vec<NewFileListener>>,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("dir", &self.dir)
            .field("file_length", &self.file_length)
            .field("high_address", &self.high_address())
            .finish()
    }
}

impl Log {
    /// Opens the log in `dir`, discarding whatever follows the newest
    /// database root. Returns the log together with that root record.
    pub fn open(dir: impl AsRef<Path>, config: &LogConfig) -> Result<(Self, Option<Loggable>)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let recovered = recovery::recover(&dir, config.file_length)?;

        let mut files = BTreeMap::new();
        for (address, path) in recovered.files {
            files.insert(address, Arc::new(LogFile::open(address, path)?));
        }

        let tail = match files.values().next_back() {
            Some(last) => {
                let file = OpenOptions::new().append(true).open(&last.path)?;
                Some(TailWriter {
                    address: last.address,
                    writer: BufWriter::with_capacity(config.write_buffer_size, file),
                })
            }
            None => None,
        };

        let log = Self {
            dir,
            file_length: config.file_length,
            write_buffer_size: config.write_buffer_size,
            files: RwLock::new(files),
            tail: Mutex::new(tail),
            high_address: AtomicU64::new(recovered.high_address),
            flushed_address: AtomicU64::new(recovered.high_address),
            listeners: RwLock::new(Vec::new()),
        };

        tracing::debug!(
            dir = ?log.dir,
            high_address = recovered.high_address,
            files = log.number_of_files(),
            "Opened log"
        );
        Ok((log, recovered.root))
    }

    pub fn location(&self) -> &Path {
        &self.dir
    }

    pub fn file_length_bound(&self) -> u64 {
        self.file_length
    }

    pub fn high_address(&self) -> Address {
        self.high_address.load(Ordering::SeqCst)
    }

    /// Address of the tail file, or `NULL_ADDRESS` for an empty log.
    pub fn high_file_address(&self) -> Address {
        self.files
            .read()
            .map(|files| files.keys().next_back().copied().unwrap_or(NULL_ADDRESS))
            .unwrap_or(NULL_ADDRESS)
    }

    /// Starting address of the file `address` belongs to.
    pub fn file_address(&self, address: Address) -> Address {
        address - address % self.file_length
    }

    pub fn number_of_files(&self) -> usize {
        self.files.read().map(|files| files.len()).unwrap_or(0)
    }

    /// Addresses of all files, oldest first.
    pub fn file_addresses(&self) -> Vec<Address> {
        self.files
            .read()
            .map(|files| files.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Bytes written to the file starting at `file_address`, 0 if there is no such file.
    pub fn file_size(&self, file_address: Address) -> u64 {
        self.files
            .read()
            .ok()
            .and_then(|files| files.get(&file_address).map(|file| file.length()))
            .unwrap_or(0)
    }

    /// Sum of all file sizes.
    pub fn disk_usage(&self) -> u64 {
        self.files
            .read()
            .map(|files| files.values().map(|file| file.length()).sum())
            .unwrap_or(0)
    }

    pub fn add_new_file_listener(&self, listener: NewFileListener) -> Result<()> {
        self.listeners.write()?.push(listener);
        Ok(())
    }

    /// Appends a record at the tail, rolling over to a new file when the
    /// record does not fit into the current one.
    pub fn append(&self, loggable: LoggableToWrite<'_>) -> Result<Address> {
        let bytes = loggable.encode()?;
        let length = bytes.len() as u64;
        if length > self.file_length {
            return Err(Error::InvalidInput(format!(
                "Loggable of {} bytes exceeds the log file length {}",
                length, self.file_length
            )));
        }

        let mut created = None;
        let address = {
            let mut tail = self.tail.lock()?;
            let mut high = self.high_address();

            let needs_file = match tail.as_ref() {
                None => true,
                Some(current) => high - current.address + length > self.file_length,
            };
            if needs_file {
                let next = match tail.take() {
                    Some(mut current) => {
                        // the previous file is complete, make it durable before moving on
                        current.writer.flush()?;
                        current.writer.get_ref().sync_all()?;
                        current.address + self.file_length
                    }
                    None => self.file_address(high),
                };
                *tail = Some(self.create_file(next)?);
                high = next;
                self.high_address.store(high, Ordering::SeqCst);
                self.flushed_address.store(high, Ordering::SeqCst);
                created = Some(next);
            }

            let current = tail
                .as_mut()
                .ok_or_else(|| Error::InvalidState("Log has no tail file".to_string()))?;
            current.writer.write_all(&bytes)?;
            if let Some(file) = self.files.read()?.get(&current.address) {
                file.length.fetch_add(length, Ordering::SeqCst);
            }
            self.high_address.store(high + length, Ordering::SeqCst);
            high
        };

        if let Some(file_address) = created {
            let name = address::file_name(file_address)?;
            tracing::debug!(file = %name, "Created log file");
            for listener in self.listeners.read()?.iter() {
                listener(file_address);
            }
        }
        Ok(address)
    }

    fn create_file(&self, file_address: Address) -> Result<TailWriter> {
        let path = self.dir.join(address::file_name(file_address)?);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;
        self.files
            .write()?
            .insert(file_address, Arc::new(LogFile::open(file_address, path)?));
        Ok(TailWriter {
            address: file_address,
            writer: BufWriter::with_capacity(self.write_buffer_size, file),
        })
    }

    /// Reads the record at `address`.
    pub fn read(&self, address: Address) -> Result<Loggable> {
        if address >= self.high_address() {
            return Err(Error::InvalidAddress(format!(
                "Address {} is beyond the high address {}",
                address,
                self.high_address()
            )));
        }
        let file = self.file_containing(address)?;
        if address >= file.address + file.length() {
            return Err(Error::InvalidAddress(format!(
                "Address {} points past the end of file {}",
                address,
                address::file_name(file.address)?
            )));
        }
        match self.read_header(&file, address)? {
            Some(header) => self.read_body(&file, address, header),
            None => Err(Error::CorruptedLog(format!(
                "No loggable at address {}",
                address
            ))),
        }
    }

    /// Iterates records from `address` up to the high address observed now.
    pub fn iter_from(&self, address: Address) -> LoggableIterator<'_> {
        LoggableIterator::new(self, address, self.high_address())
    }

    pub(crate) fn file_containing(&self, address: Address) -> Result<Arc<LogFile>> {
        let files = self.files.read()?;
        files
            .range(..=address)
            .next_back()
            .filter(|(base, _)| address < *base + self.file_length)
            .map(|(_, file)| file.clone())
            .ok_or_else(|| Error::InvalidAddress(format!("No log file contains address {}", address)))
    }

    /// First file starting after `address`.
    pub(crate) fn next_file(&self, address: Address) -> Result<Option<Arc<LogFile>>> {
        let files = self.files.read()?;
        Ok(files
            .range(address.saturating_add(1)..)
            .next()
            .map(|(_, file)| file.clone()))
    }

    pub(crate) fn read_header(
        &self,
        file: &LogFile,
        address: Address,
    ) -> Result<Option<LoggableHeader>> {
        self.ensure_readable(address + HEADER_SIZE as u64)?;
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header, address)?;
        LoggableHeader::decode(address, &header)
    }

    pub(crate) fn read_body(
        &self,
        file: &LogFile,
        address: Address,
        header: LoggableHeader,
    ) -> Result<Loggable> {
        let length = header.length();
        if address + length > file.address + file.length() {
            return Err(Error::CorruptedLog(format!(
                "Loggable at address {} overruns its file",
                address
            )));
        }
        self.ensure_readable(address + length)?;
        let mut record = vec![0u8; length as usize];
        file.read_exact_at(&mut record, address)?;
        header.finish(address, &record)
    }

    fn ensure_readable(&self, end: Address) -> Result<()> {
        if end > self.flushed_address.load(Ordering::SeqCst) {
            self.flush()?;
        }
        Ok(())
    }

    /// Hands buffered bytes to the OS.
    pub fn flush(&self) -> Result<()> {
        let mut tail = self.tail.lock()?;
        if let Some(current) = tail.as_mut() {
            current.writer.flush()?;
        }
        self.flushed_address
            .store(self.high_address(), Ordering::SeqCst);
        Ok(())
    }

    /// Flushes and fsyncs the tail file and the directory.
    pub fn sync(&self) -> Result<()> {
        {
            let mut tail = self.tail.lock()?;
            if let Some(current) = tail.as_mut() {
                current.writer.flush()?;
                current.writer.get_ref().sync_all()?;
            }
            self.flushed_address
                .store(self.high_address(), Ordering::SeqCst);
        }
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Physically removes a file. The tail file can't be removed.
    pub fn remove_file(&self, file_address: Address, how: RemoveBlockType) -> Result<()> {
        let name = address::file_name(file_address)?;
        if let Some(current) = self.tail.lock()?.as_ref() {
            if current.address == file_address {
                return Err(Error::InvalidState(format!(
                    "Can't remove the tail file {}",
                    name
                )));
            }
        }

        let file = self.files.write()?.remove(&file_address).ok_or_else(|| {
            Error::InvalidAddress(format!("No log file at address {}", file_address))
        })?;
        let path = file.path.clone();
        drop(file);

        let result = match how {
            RemoveBlockType::Delete => fs::remove_file(&path),
            RemoveBlockType::Rename => {
                let mut renamed = path.clone().into_os_string();
                renamed.push(address::DELETED_FILE_EXTENSION);
                fs::rename(&path, renamed)
            }
        };
        if let Err(e) = result {
            // put the file back so that a later sweep can retry
            if let Ok(file) = LogFile::open(file_address, path) {
                self.files.write()?.insert(file_address, Arc::new(file));
            }
            return Err(Error::ResourceBusy(format!("Failed to remove {}: {}", name, e)));
        }
        Ok(())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "Failed to flush log on close");
        }
    }
}
