//! Tar archives for cache payloads and workspace snapshots.

use kiln_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression algorithm.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zstd,
    Gzip,
}

impl Compression {
    /// Detect the compression of an archive from its leading bytes.
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else if data.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

fn archive_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Internal(format!("{context}: {e}"))
}

/// Reject paths that would escape the archive root.
fn relative_entry(path: &str) -> Result<PathBuf> {
    let p = Path::new(path);
    if p.is_absolute() || p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::InvalidPipeline(format!(
            "path '{path}' must be relative to the job workspace"
        )));
    }
    Ok(p.to_path_buf())
}

fn append_paths<W: Write>(builder: &mut tar::Builder<W>, paths: &[String], base_dir: &Path) -> Result<usize> {
    builder.follow_symlinks(false);
    let mut appended = 0;
    for path in paths {
        let rel = relative_entry(path)?;
        let abs_path = base_dir.join(&rel);
        if !abs_path.exists() {
            continue;
        }
        let is_root = rel.as_os_str().is_empty() || rel == Path::new(".");
        if abs_path.is_dir() {
            let name = if is_root { Path::new(".") } else { rel.as_path() };
            builder
                .append_dir_all(name, &abs_path)
                .map_err(|e| archive_error("Failed to pack dir", e))?;
        } else {
            builder
                .append_path_with_name(&abs_path, &rel)
                .map_err(|e| archive_error("Failed to pack file", e))?;
        }
        appended += 1;
    }
    Ok(appended)
}

/// Create an archive of `paths` (relative to `base_dir`). Missing paths are skipped.
///
/// Returns the number of paths that were packed.
pub fn create_archive<W: Write>(
    writer: W,
    paths: &[String],
    base_dir: &Path,
    compression: Compression,
) -> Result<usize> {
    match compression {
        Compression::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(writer, 3)
                .map_err(|e| archive_error("Zstd init failed", e))?;
            let appended = {
                let mut builder = tar::Builder::new(&mut encoder);
                let appended = append_paths(&mut builder, paths, base_dir)?;
                builder
                    .finish()
                    .map_err(|e| archive_error("Failed to finish tar", e))?;
                appended
            };
            encoder
                .finish()
                .map_err(|e| archive_error("Zstd finish failed", e))?;
            Ok(appended)
        }
        Compression::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(writer, flate2::Compression::default());
            let appended = {
                let mut builder = tar::Builder::new(&mut encoder);
                let appended = append_paths(&mut builder, paths, base_dir)?;
                builder
                    .finish()
                    .map_err(|e| archive_error("Failed to finish tar", e))?;
                appended
            };
            encoder
                .finish()
                .map_err(|e| archive_error("Gzip finish failed", e))?;
            Ok(appended)
        }
        Compression::None => {
            let mut builder = tar::Builder::new(writer);
            let appended = append_paths(&mut builder, paths, base_dir)?;
            builder
                .finish()
                .map_err(|e| archive_error("Failed to finish tar", e))?;
            Ok(appended)
        }
    }
}

/// Extract an archive to a destination.
pub fn extract_archive<R: Read>(reader: R, dest: &Path, compression: Compression) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    match compression {
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(reader)
                .map_err(|e| archive_error("Failed to create decoder", e))?;
            unpack(tar::Archive::new(decoder), dest)
        }
        Compression::Gzip => unpack(tar::Archive::new(flate2::read::GzDecoder::new(reader)), dest),
        Compression::None => unpack(tar::Archive::new(reader), dest),
    }
}

fn unpack<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<()> {
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .map_err(|e| archive_error("Failed to unpack archive", e))
}

/// Archive `paths` into memory.
pub fn pack_to_vec(paths: &[String], base_dir: &Path, compression: Compression) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    create_archive(&mut buffer, paths, base_dir, compression)?;
    Ok(buffer)
}

/// Extract an in-memory archive, detecting its compression.
pub fn unpack_from_slice(data: &[u8], dest: &Path) -> Result<()> {
    extract_archive(data, dest, Compression::detect(data))
}
