//! Static file handlers backed by `mmap`.
//!
//! A served file is memory-mapped read-only and spliced into the response
//! body as a foreign buffer segment whose release callback is `munmap` — the
//! file contents are never copied into server memory. This is what the
//! segmented outbound buffer exists for.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Component, Path, PathBuf};

use protocol_http::{Request, header};

use crate::writer::ResponseWriter;

/// Handler serving one fixed file.
pub fn file_handler(path: PathBuf) -> impl Fn(&mut ResponseWriter, &Request) + Send + Sync {
    move |writer, _request| serve_file(writer, &path)
}

/// Handler serving files under `root`. The request target's remainder after
/// `prefix` selects the file; a bare directory falls back to `index.html`.
pub fn directory_handler(
    prefix: String,
    root: PathBuf,
) -> impl Fn(&mut ResponseWriter, &Request) + Send + Sync {
    move |writer, request| {
        let target = request.uri();
        let path = target.split('?').next().unwrap_or(target);
        let Some(rest) = path.strip_prefix(prefix.as_str()) else {
            not_found(writer);
            return;
        };
        // The remainder must stay a plain relative path: an absolute one
        // would replace `root` in `join`, and `..` (or any other special
        // component) could climb out of it.
        let rest = Path::new(rest);
        if rest
            .components()
            .any(|part| !matches!(part, Component::Normal(_)))
        {
            writer.set_status(403);
            writer.write("forbidden");
            return;
        }
        let mut full = root.join(rest);
        if rest.as_os_str().is_empty() || full.is_dir() {
            full = full.join("index.html");
        }
        serve_file(writer, &full);
    }
}

/// Map `path` into the response body. Missing or unreadable files become a
/// 404; an empty file is a valid empty body.
pub fn serve_file(writer: &mut ResponseWriter, path: &Path) {
    match map_file(path) {
        Ok(mapping) => {
            writer.set_header(header::CONTENT_TYPE, content_type(path));
            if let Some((ptr, len)) = mapping {
                unsafe {
                    writer.adopt(
                        ptr,
                        len,
                        Box::new(move |p, n| {
                            libc::munmap(p as *mut libc::c_void, n);
                        }),
                        true,
                    );
                }
            }
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "file not served");
            not_found(writer);
        }
    }
}

fn not_found(writer: &mut ResponseWriter) {
    writer.set_status(404);
    writer.write("not found");
}

/// mmap a file read-only. `None` for an empty file (zero-length mappings are
/// invalid).
fn map_file(path: &Path) -> io::Result<Option<(*mut u8, usize)>> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a file"));
    }
    let len = metadata.len() as usize;
    if len == 0 {
        return Ok(None);
    }
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(Some((ptr as *mut u8, len)))
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match ext {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}
