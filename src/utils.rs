//! Utility functions for file operations and path manipulation

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

/// Maximum number of rename attempts when resolving file collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Characters that may not appear in a directory name derived from a channel title
const FORBIDDEN_NAME_CHARS: &[char] = &[
    '/', '\0', '\\', ':', '*', '?', '\'', '"', '<', '>', '|', '&', '\r', '\n',
];

/// Reserve a free file name based on `path`
///
/// If `path` is taken, tries `stem (1).ext`, `stem (2).ext`, ... The chosen
/// file is created empty so nobody else can claim it before it is written.
///
/// # Examples
///
/// ```no_run
/// use download_coordinator::utils::next_free_filename;
/// use std::path::Path;
///
/// let reserved = next_free_filename(Path::new("/movies/show.mp4")).unwrap();
/// // If /movies/show.mp4 exists, /movies/show (1).mp4 now exists (empty)
/// ```
pub fn next_free_filename(path: &Path) -> Result<PathBuf> {
    for candidate in candidates(path)? {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free file name for {}", path.display()),
    )))
}

/// Find a directory name based on `path` that does not exist yet
///
/// Uses the same `name (n)` scheme as [`next_free_filename`] but does not
/// create the directory.
pub fn next_free_directory(path: &Path) -> Result<PathBuf> {
    candidates(path)?
        .find(|candidate| !candidate.exists())
        .ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("no free directory name for {}", path.display()),
            ))
        })
}

fn candidates(path: &Path) -> Result<impl Iterator<Item = PathBuf>> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Other(format!("cannot extract file stem of {}", path.display())))?
        .to_string();
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_string);
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let original = path.to_path_buf();

    let renamed = (1..=MAX_RENAME_ATTEMPTS).map(move |i| {
        let name = match &extension {
            Some(ext) => format!("{} ({}).{}", stem, i, ext),
            None => format!("{} ({})", stem, i),
        };
        parent.join(name)
    });
    Ok(std::iter::once(original).chain(renamed))
}

/// Turn a channel title into something usable as a directory name
///
/// Path separators and shell-hostile characters become `_`; leading and
/// trailing dots and whitespace are dropped.
pub fn filter_directory_name(name: &str) -> String {
    name.chars()
        .map(|c| if FORBIDDEN_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect::<String>()
        .trim_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string()
}

/// Whether `url` is a BitTorrent magnet link
pub fn is_magnet_uri(url: &str) -> bool {
    url.get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("magnet:"))
}

/// Local path named by a `file://` URL
pub fn file_url_path(url: &str) -> Result<PathBuf> {
    let parsed = url::Url::parse(url).map_err(|e| Error::UnsupportedUrl(format!("{url}: {e}")))?;
    if parsed.scheme() != "file" {
        return Err(Error::UnsupportedUrl(url.to_string()));
    }
    parsed
        .to_file_path()
        .map_err(|_| Error::UnsupportedUrl(url.to_string()))
}

/// Whether the file at `path` looks like bencoded torrent metadata
///
/// Only read errors are reported as `Err`; a readable file that is not a
/// torrent is `Ok(false)`.
pub fn is_torrent_file(path: &Path) -> io::Result<bool> {
    let data = std::fs::read(path)?;
    Ok(data.first() == Some(&b'd') && data.windows(6).any(|w| w == b"4:info"))
}

/// Short human readable duration ("45 secs", "3 mins", "2 hrs", "1 day")
pub fn time_string(secs: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    let (value, unit) = if secs < MINUTE {
        (secs, "sec")
    } else if secs < HOUR {
        (secs / MINUTE, "min")
    } else if secs < DAY {
        (secs / HOUR, "hr")
    } else {
        (secs / DAY, "day")
    };
    if value == 1 {
        format!("{value} {unit}")
    } else {
        format!("{value} {unit}s")
    }
}

/// Delete a file, or a directory with everything in it
pub fn remove_path(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Move `source` to `dest`, copying when a rename is not possible (other filesystem)
///
/// An existing file at `dest` is replaced.
pub fn move_path(source: &Path, dest: &Path) -> io::Result<()> {
    match std::fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) if source.is_file() => {
            tracing::debug!(error = %e, source = %source.display(), "rename failed, copying instead");
            std::fs::copy(source, dest)?;
            std::fs::remove_file(source)
        }
        Err(e) => Err(e),
    }
}
