//! Thin libc layer for the file store.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::ptr;

use tracing::{info, warn};

const TEMP_SEGMENT_LEN: usize = 6;
const TEMP_SUFFIX: &str = ".tmp";
const TEMP_NAME_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Directory containing `path`, or `.` for bare file names.
#[must_use]
pub fn parent_directory(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Free space of the filesystem holding `directory`, in bytes.
pub fn free_space(directory: &Path) -> io::Result<u64> {
    let cpath = cstring_from_path(directory)?;
    let mut stats: libc::statvfs = unsafe { mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &raw mut stats) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stats.f_bsize as u64 * stats.f_bfree as u64)
}

/// Resolves a user name to its uid and primary gid.
pub fn lookup_user(name: &str) -> io::Result<(libc::uid_t, libc::gid_t)> {
    let cname = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL"))?;
    let mut pwd: libc::passwd = unsafe { mem::zeroed() };
    // 16k as also used in the getpwnam_r manual example
    let mut buffer = vec![0_u8; 16384];
    let mut result: *mut libc::passwd = ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(
            cname.as_ptr(),
            &raw mut pwd,
            buffer.as_mut_ptr().cast(),
            buffer.len(),
            &raw mut result,
        )
    };
    if result.is_null() {
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no user named \"{name}\""),
        ));
    }
    Ok((pwd.pw_uid, pwd.pw_gid))
}

/// Resolves a group name to its gid.
pub fn lookup_group(name: &str) -> io::Result<libc::gid_t> {
    let cname = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "group name contains NUL"))?;
    let mut group: libc::group = unsafe { mem::zeroed() };
    let mut buffer = vec![0_u8; 16384];
    let mut result: *mut libc::group = ptr::null_mut();
    let rc = unsafe {
        libc::getgrnam_r(
            cname.as_ptr(),
            &raw mut group,
            buffer.as_mut_ptr().cast(),
            buffer.len(),
            &raw mut result,
        )
    };
    if result.is_null() {
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no group named \"{name}\""),
        ));
    }
    Ok(group.gr_gid)
}

/// Changes owner and group of an open descriptor.
pub fn fchown(file: &File, uid: libc::uid_t, gid: libc::gid_t) -> io::Result<()> {
    if unsafe { libc::fchown(file.as_raw_fd(), uid, gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Changes the mode of an open descriptor.
pub fn fchmod(file: &File, mode: u32) -> io::Result<()> {
    if unsafe { libc::fchmod(file.as_raw_fd(), mode as libc::mode_t) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Changes owner and group of a path by name.
pub fn chown_path(path: &Path, owner: &str, group: &str) -> io::Result<()> {
    let (uid, _) = lookup_user(owner)?;
    let gid = lookup_group(group)?;
    let cpath = cstring_from_path(path)?;
    if unsafe { libc::chown(cpath.as_ptr(), uid, gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fsyncs the directory entry table for metadata durability.
pub fn fsync_directory(directory: &Path) -> io::Result<()> {
    File::open(directory)?.sync_all()
}

/// Size of the file at `path`.
pub fn file_size(path: &Path) -> io::Result<u64> {
    fs::metadata(path).map(|meta| meta.len())
}

/// Size of the file at `path`, treating a missing file as empty.
pub fn file_size_or_zero(path: &Path) -> io::Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(error) => Err(error),
    }
}

/// Mode bits, uid and gid of the file at `path`.
pub fn file_permissions(path: &Path) -> io::Result<(u32, libc::uid_t, libc::gid_t)> {
    let meta = fs::metadata(path)?;
    Ok((meta.mode() & 0o7777, meta.uid(), meta.gid()))
}

/// True when `candidate` has the `<final_name>-XXXXXX.tmp` shape.
fn is_stale_temp_name(candidate: &str, final_name: &str) -> bool {
    candidate.len() == final_name.len() + 1 + TEMP_SEGMENT_LEN + TEMP_SUFFIX.len()
        && candidate.starts_with(final_name)
        && candidate.as_bytes()[final_name.len()] == b'-'
        && candidate.ends_with(TEMP_SUFFIX)
}

/// Removes leftover temp files of earlier, aborted uploads next to
/// `final_path`. Best-effort; failures are logged.
pub fn remove_stale_temp_files(final_path: &Path) {
    let Some(final_name) = final_path.file_name().and_then(|name| name.to_str()) else {
        return;
    };
    let Ok(entries) = fs::read_dir(parent_directory(final_path)) else {
        return;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(candidate) = file_name.to_str() else {
            continue;
        };
        if is_stale_temp_name(candidate, final_name) {
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed stale temp file"),
                Err(error) => {
                    warn!(path = %path.display(), %error, "failed to remove stale temp file");
                }
            }
        }
    }
}

/// Creates and opens a fresh `<final_path>-XXXXXX.tmp` next to the final
/// destination.
pub fn create_temp_file(final_path: &Path) -> io::Result<(PathBuf, File)> {
    let final_name = final_path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "final path has no file name"))?
        .to_os_string();

    for _ in 0..32 {
        let mut raw = [0_u8; TEMP_SEGMENT_LEN];
        getrandom::fill(&mut raw)
            .map_err(|error| io::Error::other(format!("no random material: {error}")))?;
        let segment: String = raw
            .iter()
            .map(|byte| TEMP_NAME_CHARSET[*byte as usize % TEMP_NAME_CHARSET.len()] as char)
            .collect();
        let mut name = final_name.clone();
        name.push("-");
        name.push(&segment);
        name.push(TEMP_SUFFIX);
        let path = parent_directory(final_path).join(name);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(file) => return Ok((path, file)),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "failed to create a unique temp file",
    ))
}

fn cstring_from_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}
