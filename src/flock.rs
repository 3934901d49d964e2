use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive advisory lock on the database directory's sentinel file.
///
/// Holding a `FileLock` means this process owns the directory. The lock is
/// released when the value is dropped; the sentinel file itself is left in
/// place so concurrent openers race on the lock, not on file creation.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the sentinel file if needed and try-locks it. Fails with an
    /// `io::Error` (`WouldBlock` on unix) if another process holds the lock.
    /// The process id is written into the file for debugging.
    pub fn try_lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::acquire(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn acquire(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn acquire(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let result = unsafe {
            LockFileEx(
                file.as_raw_handle() as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                std::ptr::null_mut(),
            )
        };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn acquire(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; exclusive open is unenforced.
        Ok(())
    }

    /// Path of the sentinel file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("FLOCK");

        let lock = FileLock::try_lock(&path).expect("first lock should succeed");
        assert!(FileLock::try_lock(&path).is_err(), "second lock must fail");

        drop(lock);
        let _relock = FileLock::try_lock(&path).expect("lock should be free after drop");
    }

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("FLOCK");

        let lock = FileLock::try_lock(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&std::process::id().to_string()));
    }
}
