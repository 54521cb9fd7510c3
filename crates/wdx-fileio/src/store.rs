//! Capacity-bounded write-to-temp storage with atomic publish.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::IntoRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::sys;

/// Ownership applied to a freshly created temp file.
#[derive(Debug, Clone)]
pub enum Owner {
    /// Leave the creating process's ownership in place.
    Unchanged,
    /// Owner by user name; uid and primary gid of that user.
    Name(String),
    /// Explicit uid and gid, passed to `fchown` verbatim.
    Ids(libc::uid_t, libc::gid_t),
}

/// Errors of the file store.
#[derive(Debug, Error)]
pub enum FileIoError {
    /// Write-side operation on an already published (or read-only) store.
    #[error("file is readonly")]
    Readonly,
    /// `offset + length` overflows or exceeds the relevant file range.
    #[error("offset plus length is out of the file range")]
    OutOfRange,
    /// The target filesystem cannot hold the declared capacity.
    #[error("not enough space available in \"{}\"", .0.display())]
    InsufficientSpace(PathBuf),
    /// Underlying system error with its triggering context.
    #[error("{context}: {source}")]
    Io {
        /// What the store was doing.
        context: String,
        /// The failing syscall's error.
        #[source]
        source: io::Error,
    },
}

impl FileIoError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// One storage location, either published (read side) or in upload (write
/// side).
///
/// A writable store puts all data into a `<final>-XXXXXX.tmp` file in the
/// destination directory and only moves it over the final path in
/// [`FileStore::store`]. Dropping an unpublished writable store removes the
/// temp file.
#[derive(Debug)]
pub struct FileStore {
    final_path: PathBuf,
    directory: PathBuf,
    temp_path: Option<PathBuf>,
    file: Option<File>,
    capacity: u64,
    no_empty_file_on_disk: bool,
    keep_open: bool,
    readonly: bool,
}

impl FileStore {
    /// Opens a published file for read access.
    ///
    /// No filesystem access happens here; the file is opened on the first
    /// read (and kept open when `keep_open` is set).
    pub fn open_read(
        final_path: impl Into<PathBuf>,
        no_empty_file_on_disk: bool,
        keep_open: bool,
    ) -> Self {
        let final_path = final_path.into();
        let directory = sys::parent_directory(&final_path).to_path_buf();
        Self {
            final_path,
            directory,
            temp_path: None,
            file: None,
            capacity: 0,
            no_empty_file_on_disk,
            keep_open,
            readonly: true,
        }
    }

    /// Creates the temp file for an upload of `capacity` bytes.
    ///
    /// Checks free space first, removes stale temp files of earlier aborted
    /// uploads, and applies mode and ownership to the fresh descriptor. With
    /// the empty-file-not-on-disk policy and capacity 0, no temp file is
    /// created at all; the later [`FileStore::store`] call removes the final
    /// path instead.
    pub fn create_write(
        final_path: impl Into<PathBuf>,
        no_empty_file_on_disk: bool,
        capacity: u64,
        mode: u32,
        owner: &Owner,
    ) -> Result<Self, FileIoError> {
        let final_path = final_path.into();
        let directory = sys::parent_directory(&final_path).to_path_buf();
        let mut store = Self {
            final_path,
            directory,
            temp_path: None,
            file: None,
            capacity,
            no_empty_file_on_disk,
            keep_open: true,
            readonly: false,
        };

        if !store.no_empty_file_on_disk || capacity > 0 {
            let free = sys::free_space(&store.directory).map_err(|source| {
                FileIoError::io(
                    "failed to check file system space for write operations",
                    source,
                )
            })?;
            if free < capacity {
                return Err(FileIoError::InsufficientSpace(store.directory.clone()));
            }

            sys::remove_stale_temp_files(&store.final_path);
            let (temp_path, file) = sys::create_temp_file(&store.final_path).map_err(|source| {
                FileIoError::io(
                    "failed to create temporary file for write operations",
                    source,
                )
            })?;
            info!(path = %temp_path.display(), "opened file for write operations");
            store.temp_path = Some(temp_path);
            store.file = Some(file);

            if let Some(file) = &store.file {
                if mode > 0 {
                    sys::fchmod(file, mode).map_err(|source| {
                        FileIoError::io("failed to change file mode for temporary file", source)
                    })?;
                    debug!(mode = format!("{mode:o}"), "changed temporary file mode");
                }
                match owner {
                    Owner::Unchanged => {}
                    Owner::Name(name) if name.is_empty() => {}
                    Owner::Name(name) => {
                        let (uid, gid) = sys::lookup_user(name).map_err(|source| {
                            FileIoError::io(
                                format!("unable to determine user ID for user \"{name}\""),
                                source,
                            )
                        })?;
                        sys::fchown(file, uid, gid).map_err(|source| {
                            FileIoError::io(
                                "failed to change file owner for temporary write file",
                                source,
                            )
                        })?;
                    }
                    Owner::Ids(uid, gid) => {
                        sys::fchown(file, *uid, *gid).map_err(|source| {
                            FileIoError::io(
                                "failed to change file owner for temporary write file",
                                source,
                            )
                        })?;
                    }
                }
            }
        }

        Ok(store)
    }

    /// The final destination path.
    #[must_use]
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// True once the store is published (or was created for read access).
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Writes `data` at `offset` into the temp file.
    ///
    /// A zero-length write is a no-op; partial writes are retried until all
    /// bytes hit the descriptor.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), FileIoError> {
        if self.readonly {
            return Err(FileIoError::Readonly);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FileIoError::OutOfRange)?;
        if end > self.capacity {
            return Err(FileIoError::OutOfRange);
        }
        if data.is_empty() {
            debug!("skip file write for write length of 0");
            return Ok(());
        }

        let file = self.file.as_mut().ok_or_else(|| {
            FileIoError::io(
                "no open temporary data file",
                io::Error::from_raw_os_error(libc::EBADF),
            )
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|source| FileIoError::io("failed to seek file for write operation", source))?;
        file.write_all(data)
            .map_err(|source| FileIoError::io("failed to write data to file", source))
    }

    /// Reads up to `length` bytes at `offset` from the published file.
    ///
    /// A short read is legitimate and returned as-is. With the
    /// empty-file-not-on-disk policy a missing file reads as empty at offset
    /// 0 and as out-of-range beyond it.
    pub fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, FileIoError> {
        if !self.readonly {
            return Err(FileIoError::Readonly);
        }

        if self.keep_open {
            if self.file.is_none() {
                match File::open(&self.final_path) {
                    Ok(file) => {
                        info!(path = %self.final_path.display(), "opened file for read operations");
                        self.file = Some(file);
                    }
                    Err(source)
                        if source.kind() == io::ErrorKind::NotFound
                            && self.no_empty_file_on_disk =>
                    {
                        if offset == 0 {
                            return Ok(Vec::new());
                        }
                        return Err(FileIoError::OutOfRange);
                    }
                    Err(source) => {
                        return Err(FileIoError::io(
                            "failed to open file for read operations",
                            source,
                        ));
                    }
                }
            }
            let size = sys::file_size_or_zero(&self.final_path)
                .map_err(|source| FileIoError::io("failed to determine file stats", source))?;
            let file = self.file.as_mut().ok_or_else(|| {
                FileIoError::io(
                    "no open data file",
                    io::Error::from_raw_os_error(libc::EBADF),
                )
            })?;
            read_at(file, size, offset, length)
        } else {
            match File::open(&self.final_path) {
                Ok(mut file) => {
                    let size = sys::file_size_or_zero(&self.final_path).map_err(|source| {
                        FileIoError::io("failed to determine file stats", source)
                    })?;
                    read_at(&mut file, size, offset, length)
                }
                Err(source)
                    if source.kind() == io::ErrorKind::NotFound && self.no_empty_file_on_disk =>
                {
                    Ok(Vec::new())
                }
                Err(source) => Err(FileIoError::io(
                    "failed to open file for read operations",
                    source,
                )),
            }
        }
    }

    /// Reads back data written so far (from the temp file).
    pub fn read_temp(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, FileIoError> {
        if self.readonly {
            return Err(FileIoError::Readonly);
        }
        if self.no_empty_file_on_disk && self.capacity == 0 {
            return Ok(Vec::new());
        }
        let size = match &self.temp_path {
            Some(path) => sys::file_size_or_zero(path)
                .map_err(|source| FileIoError::io("failed to determine file stats", source))?,
            None => 0,
        };
        let file = self.file.as_mut().ok_or_else(|| {
            FileIoError::io(
                "no open temporary data file",
                io::Error::from_raw_os_error(libc::EBADF),
            )
        })?;
        read_at(file, size, offset, length)
    }

    /// Size of the temp file; 0 under the empty-file policy with capacity 0.
    pub fn temp_size(&self) -> Result<u64, FileIoError> {
        if self.readonly {
            return Err(FileIoError::Readonly);
        }
        if self.no_empty_file_on_disk && self.capacity == 0 {
            return Ok(0);
        }
        match &self.temp_path {
            Some(path) => sys::file_size_or_zero(path)
                .map_err(|source| FileIoError::io("failed to determine file stats", source)),
            None => Ok(0),
        }
    }

    /// Size of the published file.
    pub fn final_size(&self) -> Result<u64, FileIoError> {
        match sys::file_size(&self.final_path) {
            Ok(size) => Ok(size),
            Err(source)
                if source.kind() == io::ErrorKind::NotFound && self.no_empty_file_on_disk =>
            {
                Ok(0)
            }
            Err(source) => Err(FileIoError::io("failed to determine file stats", source)),
        }
    }

    /// Rewinds the temp descriptor to offset 0 for sequential validation
    /// reads.
    pub fn rewind_temp(&mut self) -> Result<&mut File, FileIoError> {
        if self.readonly {
            return Err(FileIoError::Readonly);
        }
        let file = self.file.as_mut().ok_or_else(|| {
            FileIoError::io(
                "no open temporary data file",
                io::Error::from_raw_os_error(libc::EBADF),
            )
        })?;
        file.seek(SeekFrom::Start(0))
            .map_err(|source| FileIoError::io("failed to seek file for read operation", source))?;
        Ok(file)
    }

    /// Publishes the written data: fsync, close, atomic rename, directory
    /// fsync.
    ///
    /// With the empty-file-not-on-disk policy and capacity 0 the final path
    /// is unlinked instead — an empty upload encodes "delete this parameter
    /// file". After a successful call the store is readonly.
    pub fn store(&mut self) -> Result<(), FileIoError> {
        if self.readonly {
            return Err(FileIoError::Readonly);
        }

        if self.no_empty_file_on_disk && self.capacity == 0 {
            match std::fs::remove_file(&self.final_path) {
                Ok(()) => info!(path = %self.final_path.display(), "removed file"),
                Err(source) if source.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    error!(path = %self.final_path.display(), error = %source, "failed to remove file");
                }
            }
        } else {
            let file = self.file.take().ok_or_else(|| {
                FileIoError::io(
                    "no open temporary data file",
                    io::Error::from_raw_os_error(libc::EBADF),
                )
            })?;
            if let Err(source) = file.sync_all() {
                self.file = Some(file);
                return Err(FileIoError::io(
                    "failed to synchronize written file data",
                    source,
                ));
            }
            // the close invalidates the descriptor even when it reports an error
            let fd = file.into_raw_fd();
            if unsafe { libc::close(fd) } != 0 {
                return Err(FileIoError::io(
                    "failed to close written file, data may be lost",
                    io::Error::last_os_error(),
                ));
            }
            let temp_path = self.temp_path.clone().ok_or_else(|| {
                FileIoError::io(
                    "no temporary file to publish",
                    io::Error::from_raw_os_error(libc::ENOENT),
                )
            })?;
            std::fs::rename(&temp_path, &self.final_path).map_err(|source| {
                FileIoError::io("failed to move written file to final destination", source)
            })?;
        }

        self.temp_path = None;
        self.keep_open = false;
        self.readonly = true;

        if let Err(error) = sys::fsync_directory(&self.directory) {
            warn!(
                directory = %self.directory.display(),
                %error,
                "failed to synchronize directory of written file"
            );
        }
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            debug!(path = %self.final_path.display(), "closed file");
        }
        if let Some(temp_path) = self.temp_path.take() {
            match std::fs::remove_file(&temp_path) {
                Ok(()) => info!(path = %temp_path.display(), "cleaned temporary file"),
                Err(error) => {
                    error!(path = %temp_path.display(), %error, "failed to cleanup temporary file");
                }
            }
        }
    }
}

fn read_at(
    file: &mut File,
    size: u64,
    offset: u64,
    length: usize,
) -> Result<Vec<u8>, FileIoError> {
    let end = offset
        .checked_add(length as u64)
        .ok_or(FileIoError::OutOfRange)?;
    if end > size {
        return Err(FileIoError::OutOfRange);
    }
    if length == 0 {
        return Ok(Vec::new());
    }

    file.seek(SeekFrom::Start(offset))
        .map_err(|source| FileIoError::io("failed to seek file for read operation", source))?;
    let mut buffer = vec![0_u8; length];
    let read = file
        .read(&mut buffer)
        .map_err(|source| FileIoError::io("failed to read data from file", source))?;
    buffer.truncate(read);
    if read < length {
        info!("read was interrupted before all requested data was read, returning less data");
    }
    Ok(buffer)
}
