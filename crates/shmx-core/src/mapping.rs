//! Name-keyed shared memory mappings.
//!
//! The transport never cares how its bytes got mapped; this module is the
//! one place that talks to the OS. A name resolves to a file under
//! `$SHMX_DIR` if set, else `/dev/shm` when present, else the system temp
//! directory, and the file is mapped shared with `mmap`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// A mapped shared-memory segment, keyed by name.
pub struct Mapping {
    base: *mut u8,
    len: usize,
    _file: File,
}

// SAFETY: the mapping itself is just an address range; all concurrent access
// to its contents is synchronized by the structures placed inside it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

fn base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SHMX_DIR") {
        return PathBuf::from(dir);
    }
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() {
        return dev_shm;
    }
    std::env::temp_dir()
}

fn path_for(name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidArgument("segment name must be a plain token"));
    }
    Ok(base_dir().join(name))
}

fn map_fd(file: &File, len: usize, prot: libc::c_int) -> Result<*mut u8> {
    // SAFETY: mapping a file we own for its full length; failure is checked.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Error::MappingFailed(io::Error::last_os_error()));
    }
    Ok(addr as *mut u8)
}

impl Mapping {
    /// Create a fresh zero-filled segment of `size` bytes under `name`.
    ///
    /// Any stale file with the same name is replaced, so late readers of a
    /// previous incarnation keep their (unlinked) mapping rather than seeing
    /// this one.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("segment size must be non-zero"));
        }
        let path = path_for(name)?;
        let _ = std::fs::remove_file(&path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(size as u64)?;
        let base = map_fd(&file, size, libc::PROT_READ | libc::PROT_WRITE)?;
        tracing::debug!(name, size, "created shm segment");
        Ok(Self {
            base,
            len: size,
            _file: file,
        })
    }

    /// Open an existing segment read-write (clients write their own reader
    /// slot and control ring).
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with_prot(name, libc::PROT_READ | libc::PROT_WRITE)
    }

    /// Open an existing segment read-only (inspectors).
    pub fn open_readonly(name: &str) -> Result<Self> {
        Self::open_with_prot(name, libc::PROT_READ)
    }

    fn open_with_prot(name: &str, prot: libc::c_int) -> Result<Self> {
        let path = path_for(name)?;
        let writable = prot & libc::PROT_WRITE != 0;
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::MappingFailed(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "segment file is empty",
            )));
        }
        let base = map_fd(&file, len, prot)?;
        tracing::debug!(name, len, writable, "opened shm segment");
        Ok(Self {
            base,
            len,
            _file: file,
        })
    }

    /// Remove the name from the namespace. Existing mappings stay valid.
    pub fn unlink(name: &str) -> Result<()> {
        let path = path_for(name)?;
        std::fs::remove_file(&path)?;
        Ok(())
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty (it never is once constructed).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len came from a successful mmap of exactly this range.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "shmx-test-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn create_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SHMX_DIR", dir.path());
        let name = unique_name("map");

        let created = Mapping::create(&name, 4096).unwrap();
        assert_eq!(created.len(), 4096);
        // SAFETY: fresh private test mapping.
        unsafe { *created.base() = 0x5A };

        let opened = Mapping::open(&name).unwrap();
        assert_eq!(opened.len(), 4096);
        // SAFETY: both mappings view the same file.
        assert_eq!(unsafe { *opened.base() }, 0x5A);

        Mapping::unlink(&name).unwrap();
        assert!(Mapping::open(&name).is_err());
    }

    #[test]
    fn rejects_bad_names() {
        assert!(matches!(
            Mapping::create("", 64),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Mapping::create("a/b", 64),
            Err(Error::InvalidArgument(_))
        ));
    }
}
