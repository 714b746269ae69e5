// src/files.rs
//
// Static file lookup: resolve a request target under the document root,
// classify failures into response codes, and map the file read-only for
// zero-copy transmission alongside the header buffer.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use libc::c_void;

/// Why a target could not be served. The connection maps these onto the
/// 400/404/500 responses.
#[derive(Debug)]
pub enum FileError {
    /// Target escapes the document root or is not an absolute-path target.
    BadPath,
    /// Target names a directory or a file the server may not read.
    Forbidden,
    /// No such file under the document root.
    NotFound,
    /// stat/open/mmap failed for some other reason.
    Io(io::Error),
}

/// A successfully resolved target, ready to transmit.
pub struct ServedFile {
    /// File size, used for Content-Length even when no body is sent (HEAD).
    pub len: usize,
    pub mime: &'static str,
    /// Read-only mapping of the file contents; `None` for HEAD requests
    /// and zero-length files.
    pub body: Option<MappedFile>,
}

/// Resolve `target` (a request path like `/a/b.html?q=1`) to a filesystem
/// path under `root`. The query string is stripped, `/` maps to
/// `/index.html`, and any `..` segment rejects the request outright.
pub fn resolve(root: &Path, target: &str) -> Result<PathBuf, FileError> {
    let path = target.split('?').next().unwrap_or(target);
    if !path.starts_with('/') {
        return Err(FileError::BadPath);
    }
    let path = if path == "/" { "/index.html" } else { path };

    if path.split('/').any(|seg| seg == "..") {
        return Err(FileError::BadPath);
    }

    let mut resolved = root.to_path_buf();
    resolved.push(&path[1..]);
    Ok(resolved)
}

/// Look up `target` under `root`. With `want_body` false (HEAD) the file is
/// stat'ed but never opened or mapped.
pub fn lookup(root: &Path, target: &str, want_body: bool) -> Result<ServedFile, FileError> {
    let path = resolve(root, target)?;

    let meta = std::fs::metadata(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => FileError::NotFound,
        io::ErrorKind::PermissionDenied => FileError::Forbidden,
        _ => FileError::Io(e),
    })?;

    if meta.is_dir() {
        return Err(FileError::Forbidden);
    }

    let len = meta.len() as usize;
    let mime = mime_for(&path);

    if !want_body || len == 0 {
        return Ok(ServedFile {
            len,
            mime,
            body: None,
        });
    }

    let file = File::open(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => FileError::NotFound,
        io::ErrorKind::PermissionDenied => FileError::Forbidden,
        _ => FileError::Io(e),
    })?;

    let body = MappedFile::from_file(&file, len).map_err(FileError::Io)?;
    Ok(ServedFile {
        len,
        mime,
        body: Some(body),
    })
}

/// Content-Type from the file extension; unknown extensions fall back to
/// application/octet-stream.
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Read-only, private mapping of a file. Unmapped exactly once, on drop;
/// the connection drops it during teardown or keep-alive reset.
pub struct MappedFile {
    ptr: *mut c_void,
    len: usize,
}

// The mapping is immutable for its whole lifetime, so moving it to a
// worker thread is sound.
unsafe impl Send for MappedFile {}

impl MappedFile {
    fn from_file(file: &File, len: usize) -> io::Result<Self> {
        debug_assert!(len > 0);
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { ptr, len })
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}
