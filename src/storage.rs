use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::config::LoggerConfig;
use crate::error::{LoggerError, LoggerResult};
use crate::record::RECORD_SIZE;

/// Removable storage volume. Every call happens under the storage lock.
///
/// A failed `write` may leave part of the buffer in the file; the session
/// store cuts it back with `truncate`.
pub trait Storage: Send + 'static {
    type Handle: Send;

    fn mount(&mut self) -> io::Result<()>;
    fn exists(&mut self, name: &str) -> io::Result<bool>;
    fn open_for_append(&mut self, name: &str) -> io::Result<Self::Handle>;
    /// Current length of the open file.
    fn len(&mut self, handle: &mut Self::Handle) -> io::Result<u64>;
    fn write(&mut self, handle: &mut Self::Handle, bytes: &[u8]) -> io::Result<()>;
    fn truncate(&mut self, handle: &mut Self::Handle, len: u64) -> io::Result<()>;
    fn flush(&mut self, handle: &mut Self::Handle) -> io::Result<()>;
    fn close(&mut self, handle: Self::Handle) -> io::Result<()>;
    fn unmount(&mut self) -> io::Result<()>;
}

/// Sequential session file names: `log000.bin`, `log001.bin`, ...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNaming {
    pub prefix: String,
    pub extension: String,
    /// Indices below this are probed; this index is the fallback.
    pub max_index: u32,
}

impl FileNaming {
    pub fn from_config(config: &LoggerConfig) -> Self {
        Self {
            prefix: config.file_prefix.clone(),
            extension: config.file_extension.clone(),
            max_index: config.max_file_index,
        }
    }

    pub fn candidate(&self, index: u32) -> String {
        format!("{}{:03}.{}", self.prefix, index, self.extension)
    }

    pub fn fallback(&self) -> String {
        self.candidate(self.max_index)
    }

    /// First candidate that does not exist yet, else the fallback (which
    /// is then appended to).
    pub fn choose<S: Storage>(&self, storage: &mut S) -> io::Result<String> {
        for index in 0..self.max_index {
            let name = self.candidate(index);
            if !storage.exists(&name)? {
                return Ok(name);
            }
        }
        let fallback = self.fallback();
        warn!("all {} log names in use, appending to {}", self.max_index, fallback);
        Ok(fallback)
    }
}

impl Default for FileNaming {
    fn default() -> Self {
        Self::from_config(&LoggerConfig::default())
    }
}

struct OpenFile<H> {
    name: String,
    handle: H,
}

/// Everything behind the storage lock: the volume, its mount state and the
/// open session file.
pub struct SessionStore<S: Storage> {
    storage: S,
    mounted: bool,
    file: Option<OpenFile<S::Handle>>,
    name: Option<String>,
    bytes: u64,
    /// File length covered by successful writes.
    committed: u64,
}

/// The storage lock.
pub type StorageLock<S> = Arc<Mutex<SessionStore<S>>>;

impl<S: Storage> SessionStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            mounted: false,
            file: None,
            name: None,
            bytes: 0,
            committed: 0,
        }
    }

    pub fn into_lock(self) -> StorageLock<S> {
        Arc::new(Mutex::new(self))
    }

    /// Mount, pick an unused name and open it for append.
    pub fn open_session(&mut self, naming: &FileNaming) -> LoggerResult<String> {
        self.storage.mount().map_err(LoggerError::Mount)?;
        self.mounted = true;

        let name = naming.choose(&mut self.storage).map_err(LoggerError::Mount)?;
        let open_error = |source: io::Error| LoggerError::Open {
            name: name.clone(),
            source,
        };
        let mut handle = self.storage.open_for_append(&name).map_err(open_error)?;
        let existing = self.storage.len(&mut handle).map_err(open_error)?;
        if existing > 0 {
            warn!("{} already holds {} bytes, appending", name, existing);
        }

        info!("logging to {}", name);
        self.file = Some(OpenFile {
            name: name.clone(),
            handle,
        });
        self.name = Some(name.clone());
        self.bytes = 0;
        self.committed = existing;
        Ok(name)
    }

    /// Append whole records. Either all of `bytes` lands in the file or, on
    /// error, the file is cut back to its length before the call.
    pub fn write_records(&mut self, bytes: &[u8]) -> LoggerResult<()> {
        debug_assert_eq!(bytes.len() % RECORD_SIZE, 0, "partial record handed to storage");
        let file = self.file.as_mut().ok_or(LoggerError::SessionClosed)?;
        if let Err(e) = self.storage.write(&mut file.handle, bytes) {
            if let Err(rollback) = self.storage.truncate(&mut file.handle, self.committed) {
                warn!("failed to cut back partial write in {}: {}", file.name, rollback);
            }
            return Err(e.into());
        }
        self.bytes += bytes.len() as u64;
        self.committed += bytes.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> LoggerResult<()> {
        let file = self.file.as_mut().ok_or(LoggerError::SessionClosed)?;
        self.storage.flush(&mut file.handle)?;
        Ok(())
    }

    /// Flush and close the session file. A no-op once closed.
    pub fn close_session(&mut self) -> LoggerResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let flushed = self.storage.flush(&mut file.handle);
        let closed = self.storage.close(file.handle);
        info!("closed {} ({} bytes)", file.name, self.bytes);
        flushed?;
        closed?;
        Ok(())
    }

    /// A no-op once unmounted.
    pub fn unmount(&mut self) -> LoggerResult<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        self.storage.unmount()?;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Name of the session file, kept after it is closed.
    pub fn file_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Bytes appended this session.
    pub fn file_bytes(&self) -> u64 {
        self.bytes
    }
}

/// Storage backed by a directory on the host filesystem.
pub struct FsStorage {
    root: PathBuf,
    mounted: bool,
}

pub struct FsHandle {
    file: File,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: false,
        }
    }

    fn require_mounted(&self) -> io::Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "storage is not mounted"))
        }
    }
}

impl Storage for FsStorage {
    type Handle = FsHandle;

    fn mount(&mut self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        self.mounted = true;
        Ok(())
    }

    fn exists(&mut self, name: &str) -> io::Result<bool> {
        self.require_mounted()?;
        self.root.join(name).try_exists()
    }

    fn open_for_append(&mut self, name: &str) -> io::Result<FsHandle> {
        self.require_mounted()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(name))?;
        Ok(FsHandle { file })
    }

    fn len(&mut self, handle: &mut FsHandle) -> io::Result<u64> {
        Ok(handle.file.metadata()?.len())
    }

    fn write(&mut self, handle: &mut FsHandle, bytes: &[u8]) -> io::Result<()> {
        handle.file.write_all(bytes)
    }

    fn truncate(&mut self, handle: &mut FsHandle, len: u64) -> io::Result<()> {
        handle.file.set_len(len)
    }

    fn flush(&mut self, handle: &mut FsHandle) -> io::Result<()> {
        handle.file.flush()?;
        handle.file.sync_data()
    }

    fn close(&mut self, handle: FsHandle) -> io::Result<()> {
        handle.file.sync_all()
    }

    fn unmount(&mut self) -> io::Result<()> {
        self.mounted = false;
        Ok(())
    }
}
