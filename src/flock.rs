use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::Result;
use crate::Error;

/// Name of the lock file inside an environment directory.
pub const LOCK_FILE: &str = "ashlog.lck";

/// Exclusive advisory lock keeping a second process off an environment
/// directory. Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file if needed and locks it. The file holds the
    /// process ID for debugging purposes.
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file).map_err(Error::Locked)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // no advisory locking, a second process is not detected
        Ok(())
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);

        let lock = FileLock::lock(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_double_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);

        let first = FileLock::lock(&path).unwrap();
        assert!(matches!(FileLock::lock(&path), Err(Error::Locked(_))));

        // the failed attempt must not clobber the holder's pid
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
        drop(first);
    }

    #[test]
    fn test_auto_unlock_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);

        {
            let _lock = FileLock::lock(&path).unwrap();
        }
        assert!(FileLock::lock(&path).is_ok());
    }
}
