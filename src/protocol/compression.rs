//! Per-file payload compression.
//!
//! Each directive entry carries its own codec byte, so a sender can skip files that
//! are already compressed while still squeezing source files.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzipCompression;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::path::Path;

use crate::protocol::error::ProtocolError;

/// Compression codec of one directive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Zstd,
}

/// Extensions whose content gains nothing from another compression pass.
const COMPRESSED_EXTENSIONS: &[&str] = &[
    "gz", "gzip", "zst", "zstd", "zip", "7z", "rar", "xz", "bz2", "lz4", "lzma", "apk", "aab",
    "jpg", "jpeg", "png", "gif", "webp", "mp3", "mp4", "mkv", "avi", "mov", "webm", "flac",
    "aac", "ogg", "ttf", "otf", "woff", "woff2", "pdf",
];

impl CompressionType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }

    pub fn wire_id(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
            Self::Zstd => 2,
        }
    }

    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn is_already_compressed(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                COMPRESSED_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
    }

    /// Codec to use for `path` when the connection is configured with `self`.
    pub fn for_path(self, path: &Path) -> Self {
        if self != Self::None && Self::is_already_compressed(path) {
            Self::None
        } else {
            self
        }
    }
}

/// Compression level (1-9, where 1 is fastest-lowest and 9 is slowest-highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(3)
    }
}

impl CompressionLevel {
    /// Clamped to 1-9.
    pub fn new(level: u8) -> Self {
        Self(level.clamp(1, 9))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

pub fn compress(data: &[u8], codec: CompressionType, level: CompressionLevel) -> io::Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), GzipCompression::new(level.value() as u32));
            encoder.write_all(data)?;
            encoder.finish()
        }
        CompressionType::Zstd => zstd::encode_all(data, level.value() as i32),
    }
}

/// Decompress at most `limit` bytes; anything larger is rejected rather than inflated.
pub fn decompress(data: &[u8], codec: CompressionType, limit: u64) -> Result<Vec<u8>, ProtocolError> {
    let mut output = Vec::new();
    let read = match codec {
        CompressionType::None => return Ok(data.to_vec()),
        CompressionType::Gzip => GzDecoder::new(data).take(limit + 1).read_to_end(&mut output),
        CompressionType::Zstd => zstd::Decoder::new(data)?.take(limit + 1).read_to_end(&mut output),
    };
    read.map_err(|e| ProtocolError::malformed(format!("{} payload: {}", codec.name(), e)))?;

    if output.len() as u64 > limit {
        return Err(ProtocolError::TooLarge {
            what: "decompressed file",
            size: output.len() as u64,
            limit,
        });
    }
    Ok(output)
}
