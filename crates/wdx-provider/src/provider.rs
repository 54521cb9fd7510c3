//! One storage location behind the upload/download state machine.

use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};
use wdx_chunks::{ChunkAccountant, ChunkError};
use wdx_core::{ServiceError, ServiceResult, StatusCode};
use wdx_fileio::{FileIoError, FileStore, Owner, sys};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum ProviderState {
    Prepared,
    Created,
    Completed,
    Readonly,
}

#[derive(Clone, Copy, Debug)]
enum ModeSpec {
    /// Adopt mode and ownership from the file being replaced.
    Auto,
    Explicit(u32),
}

struct Inner {
    state: ProviderState,
    store: Option<FileStore>,
    chunks: Option<ChunkAccountant>,
}

/// A file provider: one storage location plus the upload state machine.
///
/// All operations serialize on one internal mutex, so state transitions are
/// linearizable.
pub struct FileProvider {
    path: PathBuf,
    size_limit: u64,
    no_empty_file_on_disk: bool,
    mode: ModeSpec,
    owner: String,
    inner: Mutex<Inner>,
}

impl FileProvider {
    /// Provider over a published file, for read access only.
    pub fn for_read(
        path: impl Into<PathBuf>,
        no_empty_file_on_disk: bool,
        keep_file_open: bool,
    ) -> Self {
        let path = path.into();
        let store = FileStore::open_read(&path, no_empty_file_on_disk, keep_file_open);
        Self {
            path,
            size_limit: 0,
            no_empty_file_on_disk,
            mode: ModeSpec::Explicit(0),
            owner: String::new(),
            inner: Mutex::new(Inner {
                state: ProviderState::Readonly,
                store: Some(store),
                chunks: None,
            }),
        }
    }

    /// Writable provider replacing an existing file; mode and ownership of
    /// the replaced file are adopted at [`FileProvider::create`] time.
    pub fn for_replacement(path: impl Into<PathBuf>, file_size_limit: u64) -> Self {
        Self {
            path: path.into(),
            size_limit: file_size_limit,
            no_empty_file_on_disk: false,
            mode: ModeSpec::Auto,
            owner: String::new(),
            inner: Mutex::new(Inner {
                state: ProviderState::Prepared,
                store: None,
                chunks: None,
            }),
        }
    }

    /// Writable provider for a new file with explicit mode and owner.
    pub fn for_new_file(
        path: impl Into<PathBuf>,
        file_size_limit: u64,
        no_empty_file_on_disk: bool,
        file_mode: u32,
        file_owner: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            size_limit: file_size_limit,
            no_empty_file_on_disk,
            mode: ModeSpec::Explicit(file_mode),
            owner: file_owner.into(),
            inner: Mutex::new(Inner {
                state: ProviderState::Prepared,
                store: None,
                chunks: None,
            }),
        }
    }

    /// The storage location this provider serves.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the temp file for an upload of `capacity` bytes.
    ///
    /// Transitions `prepared → created`, or straight to `completed` when the
    /// capacity is zero.
    pub fn create(&self, capacity: u64) -> ServiceResult<()> {
        let mut inner = self.lock();
        if inner.state == ProviderState::Readonly {
            return Err(ServiceError::logic("file is readonly"));
        }
        if capacity > self.size_limit {
            return Err(ServiceError::new(
                StatusCode::FileSizeExceeded,
                format!("capacity {capacity} exceeds the limit of {}", self.size_limit),
            ));
        }

        let (mode, owner) = match self.mode {
            ModeSpec::Auto => {
                let (mode, uid, gid) = sys::file_permissions(&self.path).map_err(|source| {
                    ServiceError::file_not_accessible(
                        &format!(
                            "failed to determine file permissions for \"{}\"",
                            self.path.display()
                        ),
                        &source,
                    )
                })?;
                debug!(mode = format!("{mode:o}"), "determined mode for new writable file");
                (mode, Owner::Ids(uid, gid))
            }
            ModeSpec::Explicit(mode) if self.owner.is_empty() => (mode, Owner::Unchanged),
            ModeSpec::Explicit(mode) => (mode, Owner::Name(self.owner.clone())),
        };

        let store = FileStore::create_write(
            &self.path,
            self.no_empty_file_on_disk,
            capacity,
            mode,
            &owner,
        )
        .map_err(|source| {
            error!(path = %self.path.display(), error = %source, "failed to create new writable file");
            ServiceError::new(StatusCode::FileNotAccessible, source.to_string())
        })?;

        inner.store = Some(store);
        inner.chunks = Some(ChunkAccountant::new(capacity));
        inner.state = if capacity == 0 {
            ProviderState::Completed
        } else {
            ProviderState::Created
        };
        debug!(path = %self.path.display(), capacity, "created new writable file");
        Ok(())
    }

    /// Writes one chunk and records it in the accountant.
    pub fn write(&self, offset: u64, data: &[u8]) -> ServiceResult<()> {
        let mut inner = self.lock();
        if inner.state == ProviderState::Readonly {
            return Err(ServiceError::logic("file is readonly"));
        }
        if inner.state < ProviderState::Created {
            return Err(ServiceError::logic("no file created previously"));
        }

        let store = inner
            .store
            .as_mut()
            .ok_or_else(|| ServiceError::logic("no file created previously"))?;
        store.write(offset, data).map_err(map_store_error)?;

        let chunks = inner
            .chunks
            .as_mut()
            .ok_or_else(|| ServiceError::logic("no file created previously"))?;
        chunks
            .add_chunk(offset, data.len() as u64)
            .map_err(|error| match error {
                ChunkError::RangeOverflow => {
                    ServiceError::new(StatusCode::FileSizeExceeded, error.to_string())
                }
                ChunkError::CannotOptimize => ServiceError::internal(error.to_string()),
            })?;
        debug!(path = %self.path.display(), length = data.len(), "wrote chunk data");
        Ok(())
    }

    /// Reads up to `length` bytes; from the temp file before publication and
    /// from the final file afterwards.
    pub fn read(&self, offset: u64, length: usize) -> ServiceResult<Vec<u8>> {
        let mut inner = self.lock();
        if inner.state < ProviderState::Created {
            return Err(ServiceError::logic("no file created previously"));
        }
        let readonly = inner.state == ProviderState::Readonly;
        let store = inner
            .store
            .as_mut()
            .ok_or_else(|| ServiceError::logic("no file created previously"))?;
        let result = if readonly {
            store.read(offset, length)
        } else {
            store.read_temp(offset, length)
        };
        result.map_err(map_store_error)
    }

    /// Current size: final file when readonly, temp file while uploading, 0
    /// before `create`.
    pub fn file_info(&self) -> ServiceResult<u64> {
        let inner = self.lock();
        let size = match &inner.store {
            // write provider without a create call yet
            None => 0,
            Some(store) if inner.state != ProviderState::Readonly => {
                store.temp_size().map_err(map_store_error)?
            }
            Some(store) => store.final_size().map_err(map_store_error)?,
        };
        Ok(size)
    }

    /// True when the accountant proves full coverage; latches `completed`.
    pub fn is_complete(&self) -> ServiceResult<bool> {
        let mut inner = self.lock();
        Self::is_complete_locked(&mut inner)
    }

    /// Runs the validator over a read-only stream of the uploaded bytes.
    ///
    /// Requires completeness. Readonly providers and empty uploads under the
    /// no-empty-file policy short-circuit to OK. A `false` verdict maps to
    /// `invalid_value`; validator errors are surfaced.
    pub fn validate<F>(&self, validator: F) -> ServiceResult<()>
    where
        F: FnOnce(&mut dyn Read) -> io::Result<bool>,
    {
        let mut inner = self.lock();
        if inner.state < ProviderState::Created {
            return Err(ServiceError::logic("no file created previously"));
        }
        if !Self::is_complete_locked(&mut inner)? {
            return Err(ServiceError::logic("file incomplete"));
        }
        if inner.state == ProviderState::Readonly {
            debug!(path = %self.path.display(), "skip validation of readonly file");
            return Ok(());
        }
        let capacity = inner.chunks.as_ref().map_or(0, ChunkAccountant::capacity);
        if self.no_empty_file_on_disk && capacity == 0 {
            debug!(path = %self.path.display(), "skip validation of zero data (no empty file on disk)");
            return Ok(());
        }

        let store = inner
            .store
            .as_mut()
            .ok_or_else(|| ServiceError::logic("no file created previously"))?;
        let file = store.rewind_temp().map_err(map_store_error)?;
        let mut reader = BufReader::new(file);
        match validator(&mut reader) {
            Ok(true) => {
                debug!(path = %self.path.display(), "data successfully validated");
                Ok(())
            }
            Ok(false) => Err(ServiceError::invalid_value("validation failed")),
            Err(error) => Err(ServiceError::invalid_value(format!(
                "validator failed: {error}"
            ))),
        }
    }

    /// Publishes the upload and latches `readonly`.
    ///
    /// Requires a complete upload; the final path stays untouched otherwise.
    pub fn finish(&self) -> ServiceResult<()> {
        let mut inner = self.lock();
        if inner.state == ProviderState::Readonly {
            return Err(ServiceError::logic("file is readonly"));
        }
        if inner.state < ProviderState::Created {
            return Err(ServiceError::logic("no file created previously"));
        }
        if !Self::is_complete_locked(&mut inner)? {
            return Err(ServiceError::invalid_value("written data is not complete"));
        }

        let store = inner
            .store
            .as_mut()
            .ok_or_else(|| ServiceError::logic("no file created previously"))?;
        store.store().map_err(map_store_error)?;
        inner.state = ProviderState::Readonly;
        debug!(path = %self.path.display(), "temporary data moved to final destination");
        Ok(())
    }

    fn is_complete_locked(inner: &mut MutexGuard<'_, Inner>) -> ServiceResult<bool> {
        if inner.state < ProviderState::Created {
            return Err(ServiceError::logic("no file created previously"));
        }
        if inner.state >= ProviderState::Completed {
            return Ok(true);
        }
        let complete = inner
            .chunks
            .as_ref()
            .is_some_and(ChunkAccountant::file_completed);
        if complete {
            inner.state = ProviderState::Completed;
        }
        Ok(complete)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn map_store_error(error: FileIoError) -> ServiceError {
    match error {
        FileIoError::Readonly => ServiceError::logic(error.to_string()),
        FileIoError::OutOfRange => ServiceError::new(StatusCode::FileSizeExceeded, error.to_string()),
        other => ServiceError::new(StatusCode::FileNotAccessible, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = 1 << 20;

    fn new_file_provider(path: &Path) -> FileProvider {
        FileProvider::for_new_file(path, LIMIT, false, 0, "")
    }

    #[test]
    fn out_of_order_upload_reaches_the_final_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware.bin");
        let provider = new_file_provider(&path);

        provider.create(1000).unwrap();
        let payload = vec![0xA5_u8; 250];
        provider.write(500, &payload).unwrap();
        provider.write(0, &payload).unwrap();
        provider.write(750, &payload).unwrap();
        provider.write(250, &payload).unwrap();

        assert!(provider.is_complete().unwrap());
        provider
            .validate(|reader| {
                let mut buffer = Vec::new();
                reader.read_to_end(&mut buffer)?;
                Ok(buffer.len() == 1000)
            })
            .unwrap();
        provider.finish().unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1000);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn over_capacity_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provider = new_file_provider(&dir.path().join("small.bin"));
        provider.create(10).unwrap();
        let error = provider.write(5, &[0_u8; 10]).unwrap_err();
        assert_eq!(error.status, StatusCode::FileSizeExceeded);
    }

    #[test]
    fn incomplete_finish_leaves_the_final_path_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"previous content").unwrap();

        let provider = FileProvider::for_replacement(&path, LIMIT);
        provider.create(100).unwrap();
        provider.write(0, &[1_u8; 50]).unwrap();
        let error = provider.finish().unwrap_err();
        assert_eq!(error.status, StatusCode::InvalidValue);
        assert_eq!(std::fs::read(&path).unwrap(), b"previous content");
    }

    #[test]
    fn create_rejects_capacity_above_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileProvider::for_new_file(dir.path().join("big.bin"), 16, false, 0, "");
        let error = provider.create(17).unwrap_err();
        assert_eq!(error.status, StatusCode::FileSizeExceeded);
    }

    #[test]
    fn readonly_provider_rejects_create_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("published.bin");
        std::fs::write(&path, b"data").unwrap();

        let provider = FileProvider::for_read(&path, false, false);
        assert_eq!(provider.create(4).unwrap_err().status, StatusCode::LogicError);
        assert_eq!(
            provider.write(0, b"x").unwrap_err().status,
            StatusCode::LogicError
        );
    }

    #[test]
    fn write_before_create_is_a_logic_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = new_file_provider(&dir.path().join("early.bin"));
        assert_eq!(
            provider.write(0, b"x").unwrap_err().status,
            StatusCode::LogicError
        );
    }

    #[test]
    fn rejected_validation_maps_to_invalid_value() {
        let dir = tempfile::tempdir().unwrap();
        let provider = new_file_provider(&dir.path().join("bad.bin"));
        provider.create(4).unwrap();
        provider.write(0, b"data").unwrap();
        let error = provider.validate(|_| Ok(false)).unwrap_err();
        assert_eq!(error.status, StatusCode::InvalidValue);
    }

    #[test]
    fn zero_capacity_upload_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"to be deleted").unwrap();

        let provider = FileProvider::for_new_file(&path, LIMIT, true, 0, "");
        provider.create(0).unwrap();
        assert!(provider.is_complete().unwrap());
        provider.validate(|_| Ok(false)).unwrap();
        provider.finish().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn replacement_adopts_mode_of_the_replaced_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.bin");
        std::fs::write(&path, b"old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();

        let provider = FileProvider::for_replacement(&path, LIMIT);
        provider.create(3).unwrap();
        provider.write(0, b"new").unwrap();
        provider.finish().unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn file_info_tracks_the_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let provider = new_file_provider(&dir.path().join("sized.bin"));
        assert_eq!(provider.file_info().unwrap(), 0);
        provider.create(6).unwrap();
        provider.write(0, b"abcdef").unwrap();
        assert_eq!(provider.file_info().unwrap(), 6);
        provider.finish().unwrap();
        assert_eq!(provider.file_info().unwrap(), 6);
    }

    #[test]
    fn read_serves_temp_data_before_and_final_data_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let provider = new_file_provider(&dir.path().join("readable.bin"));
        provider.create(4).unwrap();
        provider.write(0, b"abcd").unwrap();
        assert_eq!(provider.read(1, 2).unwrap(), b"bc");
        provider.finish().unwrap();
        assert_eq!(provider.read(0, 4).unwrap(), b"abcd");
    }
}
