use crate::error::{OciError, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the decompressed layer inside its per-diffID directory.
pub const LAYER_TAR: &str = "layer.tar";

/// A downloaded (still compressed) layer blob.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    /// Position of the layer in the manifest's `layers` array.
    pub index: usize,
    /// Content-addressable digest of the compressed blob.
    pub digest: String,
    /// Media type from the manifest, used to pick a decompressor.
    pub media_type: String,
    /// Bytes written to disk.
    pub size: u64,
    /// Location of the blob inside the working directory.
    pub path: PathBuf,
}

/// Outcome of comparing a decompressed layer against its diffID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerVerification {
    Verified,
    Mismatched { actual: String },
}

impl LayerVerification {
    pub fn is_verified(&self) -> bool {
        matches!(self, LayerVerification::Verified)
    }
}

/// A layer decompressed into `<diffIDHash>/layer.tar`.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    pub index: usize,
    pub diff_id: String,
    /// Path relative to the working directory, as listed in `manifest.json`.
    pub archive_path: String,
    /// Size of the decompressed tar.
    pub size: u64,
    pub verification: LayerVerification,
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Strip the `sha256:` algorithm prefix from a digest.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Validate `diff_id` as `sha256:` followed by 64 lowercase hex digits and
/// return the hex part.  diffIDs come from the registry's config and become
/// directory names, so nothing else is accepted.
pub fn diff_id_hex(diff_id: &str) -> Result<&str> {
    match diff_id.strip_prefix("sha256:") {
        Some(hex)
            if hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) =>
        {
            Ok(hex)
        }
        _ => Err(OciError::Config(format!("invalid diffID {:?}", diff_id))),
    }
}

/// File extension for a layer blob of the given media type.
pub fn blob_extension(media_type: &str) -> &'static str {
    if media_type.contains("zstd") {
        "tar.zst"
    } else if media_type.ends_with("tar") {
        "tar"
    } else {
        "tar.gz"
    }
}

/// File name for layer `index` out of `total`: a zero-padded index (at least
/// three digits) followed by the digest with `:` replaced by `_`.
pub fn blob_file_name(index: usize, total: usize, digest: &str, media_type: &str) -> String {
    let width = total.saturating_sub(1).to_string().len().max(3);
    format!(
        "{:0width$}_{}.{}",
        index,
        digest.replace(':', "_"),
        blob_extension(media_type),
        width = width
    )
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Decompress `blob` into `<work_dir>/<diffIDHash>/layer.tar`, hashing the
/// output as it is written.  A hash that differs from `diff_id` is reported
/// through [`LayerVerification::Mismatched`], not as an error.
pub fn extract_layer(blob: &LayerBlob, diff_id: &str, work_dir: &Path) -> Result<BuiltLayer> {
    let hash = diff_id_hex(diff_id)?;
    let layer_dir = work_dir.join(hash);
    fs::create_dir_all(&layer_dir)?;

    let src = File::open(&blob.path).map_err(|e| {
        OciError::Io(io::Error::new(
            e.kind(),
            format!("open {}: {}", blob.path.display(), e),
        ))
    })?;
    let mut reader = decompressor(&blob.media_type, BufReader::new(src))?;

    let out_path = layer_dir.join(LAYER_TAR);
    let out = File::create(&out_path)?;
    let mut writer = HashingWriter::new(BufWriter::new(out));
    let size = io::copy(&mut reader, &mut writer).map_err(|e| {
        OciError::Io(io::Error::new(
            e.kind(),
            format!("decompress layer {}: {}", blob.index, e),
        ))
    })?;
    let actual = writer.finish()?;

    let verification = if actual == hash {
        info!(layer = blob.index, size, "layer verified");
        LayerVerification::Verified
    } else {
        warn!(
            layer = blob.index,
            expected = hash,
            actual = %actual,
            "layer diffID mismatch; keeping layer as downloaded",
        );
        LayerVerification::Mismatched { actual }
    };

    Ok(BuiltLayer {
        index: blob.index,
        diff_id: diff_id.to_string(),
        archive_path: format!("{}/{}", hash, LAYER_TAR),
        size,
        verification,
    })
}

/// Return a `Read`er that decompresses `reader` according to the media type.
fn decompressor<'a, R: Read + 'a>(media_type: &str, reader: R) -> Result<Box<dyn Read + 'a>> {
    if media_type.contains("gzip") {
        Ok(Box::new(GzDecoder::new(reader)))
    } else if media_type.contains("zstd") {
        let decoder = zstd::Decoder::new(reader)
            .map_err(|e| OciError::Io(io::Error::new(e.kind(), format!("zstd init: {}", e))))?;
        Ok(Box::new(decoder))
    } else if media_type.contains("tar") && !media_type.contains('+') {
        // Uncompressed tar.
        Ok(Box::new(reader))
    } else {
        warn!(media_type, "unknown compression; assuming gzip");
        Ok(Box::new(GzDecoder::new(reader)))
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Writer adapter that feeds every byte written through SHA-256.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Flush the inner writer and return the lowercase hex digest.
    pub fn finish(mut self) -> io::Result<String> {
        self.inner.flush()?;
        Ok(hex_encode(&self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compute the SHA-256 hex digest of `data`.
pub fn hex_digest(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
