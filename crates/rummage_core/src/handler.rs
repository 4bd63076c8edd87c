//! Recursive archive and binary decoding ahead of the detector pool.
//!
//! Every artifact a source produces passes through [`expand`] before being
//! windowed into chunks. Archives are decompressed recursively up to a
//! depth and size budget; recognised-but-undecodable formats and binary
//! executables are dropped with a warning recorded on the owning unit.

use std::io::{Cursor, Read};
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use tracing::debug;

use crate::binary::is_executable;
use crate::error::HandlerError;

const DEFAULT_MAX_DEPTH: usize = 5;
const DEFAULT_MAX_SIZE: u64 = 250 * 1024 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Budgets and feature toggles for artifact expansion.
#[derive(Debug, Clone)]
pub struct HandlerLimits {
    /// Maximum archive nesting depth.
    pub max_depth: usize,
    /// Maximum decompressed bytes per nesting level.
    pub max_size: u64,
    /// Wall-clock budget for expanding one artifact.
    pub timeout: Duration,
    /// Drop archives instead of expanding them.
    pub skip_archives: bool,
    /// Drop binary executables instead of scanning them.
    pub skip_binaries: bool,
}

impl Default for HandlerLimits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_size: DEFAULT_MAX_SIZE,
            timeout: DEFAULT_TIMEOUT,
            skip_archives: false,
            skip_binaries: false,
        }
    }
}

/// A scannable leaf produced by expansion.
#[derive(Debug)]
pub struct Leaf {
    /// Member path relative to the root artifact (`None` for the root
    /// itself). Nested members join with `/`.
    pub member: Option<String>,
    /// Decoded bytes.
    pub data: Vec<u8>,
    /// Name of the decoder that produced this leaf, if any.
    pub decoder: Option<&'static str>,
}

/// The result of expanding one artifact.
#[derive(Debug, Default)]
pub struct Expansion {
    /// Scannable leaves, in archive order.
    pub leaves: Vec<Leaf>,
    /// Non-fatal problems encountered along the way.
    pub warnings: Vec<HandlerError>,
}

/// What the magic bytes at the head of an artifact say it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniff {
    Zip,
    Gzip,
    Tar,
    Unsupported(&'static str),
    Plain,
}

fn sniff(data: &[u8]) -> Sniff {
    if data.starts_with(b"PK\x03\x04") {
        Sniff::Zip
    } else if data.starts_with(b"\x1f\x8b") {
        Sniff::Gzip
    } else if data.len() > 262 && &data[257..262] == b"ustar" {
        Sniff::Tar
    } else if data.starts_with(b"BZh") {
        Sniff::Unsupported("bzip2")
    } else if data.starts_with(b"\xfd7zXZ\x00") {
        Sniff::Unsupported("xz")
    } else if data.starts_with(b"7z\xbc\xaf\x27\x1c") {
        Sniff::Unsupported("7z")
    } else if data.starts_with(b"!<arch>") {
        Sniff::Unsupported("ar")
    } else if data.starts_with(b"\xed\xab\xee\xdb") {
        Sniff::Unsupported("rpm")
    } else {
        Sniff::Plain
    }
}

/// Expands an artifact into scannable leaves.
///
/// Purely CPU/memory bound; callers enforce [`HandlerLimits::timeout`]
/// around this function (it is typically run on a blocking thread).
#[must_use]
pub fn expand(name: &str, data: Vec<u8>, limits: &HandlerLimits) -> Expansion {
    let mut expansion = Expansion::default();
    walk(name, None, data, 0, None, limits, &mut expansion);
    expansion
}

#[expect(clippy::too_many_arguments, reason = "internal recursion carries full leaf context")]
fn walk(
    name: &str,
    member: Option<String>,
    data: Vec<u8>,
    depth: usize,
    decoder: Option<&'static str>,
    limits: &HandlerLimits,
    out: &mut Expansion,
) {
    if limits.skip_binaries && is_executable(&data) {
        debug!(artifact = name, "dropping binary executable");
        return;
    }

    let kind = sniff(&data);

    if kind == Sniff::Plain {
        out.leaves.push(Leaf { member, data, decoder });
        return;
    }

    if limits.skip_archives {
        debug!(artifact = name, "dropping archive");
        return;
    }

    if depth >= limits.max_depth {
        out.warnings.push(HandlerError::DepthExceeded(limits.max_depth));
        return;
    }

    match kind {
        Sniff::Gzip => expand_gzip(name, member, &data, depth, limits, out),
        Sniff::Zip => expand_zip(name, member.as_deref(), &data, depth, limits, out),
        Sniff::Tar => expand_tar(name, member.as_deref(), &data, depth, limits, out),
        Sniff::Unsupported(format) => {
            out.warnings.push(HandlerError::UnsupportedFormat(format));
        }
        Sniff::Plain => unreachable!("plain content is emitted above"),
    }
}

/// Reads at most `limit` bytes, failing when the stream holds more.
fn read_capped<R: Read>(reader: R, entry: &str, limit: u64) -> Result<Vec<u8>, HandlerError> {
    let mut data = Vec::new();
    let mut capped = reader.take(limit + 1);
    capped
        .read_to_end(&mut data)
        .map_err(|e| HandlerError::Decode {
            format: "stream",
            message: e.to_string(),
        })?;

    if data.len() as u64 > limit {
        return Err(HandlerError::EntryTooLarge {
            name: entry.to_string(),
            limit,
        });
    }
    Ok(data)
}

fn expand_gzip(
    name: &str,
    member: Option<String>,
    data: &[u8],
    depth: usize,
    limits: &HandlerLimits,
    out: &mut Expansion,
) {
    match read_capped(MultiGzDecoder::new(data), name, limits.max_size) {
        Ok(decoded) => walk(name, member, decoded, depth + 1, Some("gzip"), limits, out),
        Err(e) => out.warnings.push(e),
    }
}

fn expand_zip(
    name: &str,
    member: Option<&str>,
    data: &[u8],
    depth: usize,
    limits: &HandlerLimits,
    out: &mut Expansion,
) {
    let mut archive = match zip::ZipArchive::new(Cursor::new(data)) {
        Ok(archive) => archive,
        Err(e) => {
            out.warnings.push(HandlerError::Decode {
                format: "zip",
                message: e.to_string(),
            });
            return;
        }
    };

    for index in 0..archive.len() {
        let entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(e) => {
                out.warnings.push(HandlerError::Decode {
                    format: "zip",
                    message: e.to_string(),
                });
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }

        let entry_name = entry.name().to_string();
        match read_capped(entry, &entry_name, limits.max_size) {
            Ok(decoded) => {
                let child = join_member(member, &entry_name);
                walk(name, Some(child), decoded, depth + 1, Some("zip"), limits, out);
            }
            Err(e) => out.warnings.push(e),
        }
    }
}

fn expand_tar(
    name: &str,
    member: Option<&str>,
    data: &[u8],
    depth: usize,
    limits: &HandlerLimits,
    out: &mut Expansion,
) {
    let mut archive = tar::Archive::new(Cursor::new(data));
    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => {
            out.warnings.push(HandlerError::Decode {
                format: "tar",
                message: e.to_string(),
            });
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                out.warnings.push(HandlerError::Decode {
                    format: "tar",
                    message: e.to_string(),
                });
                continue;
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let entry_name = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| format!("entry-{}", out.leaves.len()));
        match read_capped(entry, &entry_name, limits.max_size) {
            Ok(decoded) => {
                let child = join_member(member, &entry_name);
                walk(name, Some(child), decoded, depth + 1, Some("tar"), limits, out);
            }
            Err(e) => out.warnings.push(e),
        }
    }
}

fn join_member(parent: Option<&str>, child: &str) -> String {
    match parent {
        Some(parent) => format!("{parent}/{child}"),
        None => child.to_string(),
    }
}
