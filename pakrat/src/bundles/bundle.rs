use bytes::Bytes;
use pakrat_format::PakArchive;
use pakrat_format::PakratError;
use pakrat_format::PakratResult;
use std::fmt::Formatter;
use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::LoadMode;
use crate::LoadState;

// Opens a container file and positions it past the application header bytes.
// Absence is a NotFound, everything else an IoError.
fn open_at(
    path: &Path,
    offset: u64,
) -> PakratResult<(File, u64)> {
    let mut file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PakratError::NotFound(format!("container file {:?} does not exist", path))
        } else {
            PakratError::from(e)
        }
    })?;

    let len = file.metadata()?.len();
    let remaining = len.checked_sub(offset).ok_or_else(|| {
        PakratError::Configuration(format!(
            "configured offset {} is past the {} byte file {:?}",
            offset, len, path
        ))
    })?;

    if offset != 0 {
        file.seek(SeekFrom::Start(offset))?;
    }
    Ok((file, remaining))
}

/// One blocking read of a whole container file, minus the leading `offset`
/// bytes.
pub(crate) fn read_all_at(
    path: &Path,
    offset: u64,
) -> PakratResult<Bytes> {
    let (file, total) = open_at(path, offset)?;
    let mut buf = Vec::with_capacity(total as usize);
    file.take(total).read_to_end(&mut buf)?;
    if buf.len() as u64 != total {
        return Err(PakratError::Configuration(format!(
            "container file {:?} truncated mid-read: got {} of {} bytes",
            path,
            buf.len(),
            total
        )));
    }
    Ok(Bytes::from(buf))
}

/// An incremental read of a container file, advanced by at most one chunk per
/// `update` tick so a large bundle never stalls a frame.
pub(crate) struct PendingRead {
    file: File,
    buf: Vec<u8>,
    total: u64,
    chunk_size: usize,
}

impl PendingRead {
    pub fn begin(
        path: &Path,
        offset: u64,
        chunk_size: usize,
    ) -> PakratResult<PendingRead> {
        let (file, total) = open_at(path, offset)?;
        Ok(PendingRead {
            file,
            buf: Vec::with_capacity(total as usize),
            total,
            chunk_size,
        })
    }

    fn remaining(&self) -> u64 {
        self.total - self.buf.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Advances by up to one chunk. True once the whole file is buffered.
    pub fn poll(&mut self) -> PakratResult<bool> {
        if self.is_complete() {
            return Ok(true);
        }

        let want = (self.chunk_size as u64).min(self.remaining());
        let before = self.buf.len();
        (&mut self.file).take(want).read_to_end(&mut self.buf)?;
        if self.buf.len() == before {
            // the file shrank after the read began
            return Err(PakratError::Configuration(format!(
                "container file truncated mid-read: got {} of {} bytes",
                self.buf.len(),
                self.total
            )));
        }
        Ok(self.is_complete())
    }

    /// Reads whatever is left in one blocking call and yields the contents.
    /// This is the tail end of the async-to-sync upgrade.
    pub fn finish(mut self) -> PakratResult<Bytes> {
        let remaining = self.remaining();
        (&mut self.file).take(remaining).read_to_end(&mut self.buf)?;
        if !self.is_complete() {
            return Err(PakratError::Configuration(format!(
                "container file truncated mid-read: got {} of {} bytes",
                self.buf.len(),
                self.total
            )));
        }
        Ok(Bytes::from(self.buf))
    }
}

pub(crate) struct BundleInner {
    pub url: Arc<str>,
    pub state: LoadState,
    pub mode: LoadMode,
    pub archive: Option<PakArchive>,
    pub pending: Option<PendingRead>,
    pub dependencies: Vec<BundleHandle>,
    pub reference_count: u32,
    pub epoch: u64,
    pub destroy_at_ms: Option<u64>,
}

/// Shared view of one container cache entry. The [`BundleManager`] index owns
/// the record; every load of the same id yields a clone observing the same
/// state.
///
/// [`BundleManager`]: super::BundleManager
#[derive(Clone)]
pub struct BundleHandle {
    inner: Arc<Mutex<BundleInner>>,
}

impl BundleHandle {
    pub(crate) fn new(
        url: Arc<str>,
        mode: LoadMode,
    ) -> BundleHandle {
        BundleHandle {
            inner: Arc::new(Mutex::new(BundleInner {
                url,
                state: LoadState::Unloaded,
                mode,
                archive: None,
                pending: None,
                dependencies: Vec::new(),
                reference_count: 0,
                epoch: 0,
                destroy_at_ms: None,
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<BundleInner> {
        self.inner.lock().unwrap()
    }

    pub fn url(&self) -> Arc<str> {
        self.lock().url.clone()
    }

    pub fn load_state(&self) -> LoadState {
        self.lock().state
    }

    /// True once the archive is parsed and every dependency container is
    /// loaded.
    pub fn is_done(&self) -> bool {
        self.lock().state == LoadState::Loaded
    }

    pub fn reference_count(&self) -> u32 {
        self.lock().reference_count
    }

    /// Zero-copy bytes of one named entry, or None while not loaded or for an
    /// unknown name.
    pub fn extract(
        &self,
        name: &str,
    ) -> Option<Bytes> {
        self.lock().archive.as_ref().and_then(|a| a.entry(name))
    }

    /// The parsed archive, if loaded.
    pub fn archive(&self) -> Option<PakArchive> {
        self.lock().archive.clone()
    }

    /// True when both handles observe the same cache record.
    pub fn ptr_eq(
        &self,
        other: &BundleHandle,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn dependencies(&self) -> Vec<BundleHandle> {
        self.lock().dependencies.clone()
    }
}

impl std::fmt::Debug for BundleHandle {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("BundleHandle")
            .field("url", &inner.url)
            .field("state", &inner.state)
            .field("reference_count", &inner.reference_count)
            .finish()
    }
}
