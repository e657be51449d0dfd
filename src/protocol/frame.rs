//! Wire framing for protocol v1.
//!
//! One connection carries one exchange: handshake in both directions, a single
//! directive from host to agent, and a single ack back. All integers are big-endian.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::compression::CompressionType;
use crate::protocol::error::{ProtocolError, ReasonCode};
use crate::protocol::hash::ContentHash;
use crate::watch::types::ReloadKind;

pub const MAGIC: &[u8; 4] = b"LSYN";
pub const VERSION: u16 = 1;

pub const MAX_PATH_LEN: usize = 4096;
pub const MAX_FILE_SIZE: u64 = 256 * 1024 * 1024;
pub const MAX_FILES: u32 = 65_536;

const ACK_OK: u8 = 0;
const ACK_ERROR: u8 = 1;

/// One file as it travels on the wire. `content` is encoded with `codec`; `hash`
/// covers the decoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFile {
    pub path: String,
    pub codec: CompressionType,
    pub content: Vec<u8>,
    pub hash: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireDirective {
    pub kind: ReloadKind,
    pub files: Vec<WireFile>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Error(ReasonCode),
}

/// A piece of an encoded directive. Content is borrowed so large files are never
/// copied into a second buffer.
#[derive(Debug)]
pub enum Segment<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a [u8]),
}

impl AsRef<[u8]> for Segment<'_> {
    fn as_ref(&self) -> &[u8] {
        match self {
            Segment::Owned(bytes) => bytes,
            Segment::Borrowed(bytes) => bytes,
        }
    }
}

pub fn kind_to_wire(kind: ReloadKind) -> u8 {
    match kind {
        ReloadKind::HotReload => 1,
        ReloadKind::FullReload => 2,
    }
}

pub fn kind_from_wire(byte: u8) -> Result<ReloadKind, ProtocolError> {
    match byte {
        1 => Ok(ReloadKind::HotReload),
        2 => Ok(ReloadKind::FullReload),
        other => Err(ProtocolError::malformed(format!("unknown directive kind {}", other))),
    }
}

pub async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W, version: u16) -> std::io::Result<()> {
    let mut buf = [0u8; 6];
    buf[..4].copy_from_slice(MAGIC);
    buf[4..].copy_from_slice(&version.to_be_bytes());
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read the peer's handshake and return the version it speaks.
pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u16, ProtocolError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if &magic != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    Ok(reader.read_u16().await?)
}

fn path_segment(path: &str) -> Result<Vec<u8>, ProtocolError> {
    if path.is_empty() {
        return Err(ProtocolError::malformed("empty path"));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(ProtocolError::TooLarge {
            what: "path",
            size: path.len() as u64,
            limit: MAX_PATH_LEN as u64,
        });
    }
    let mut buf = Vec::with_capacity(2 + path.len());
    buf.extend_from_slice(&(path.len() as u16).to_be_bytes());
    buf.extend_from_slice(path.as_bytes());
    Ok(buf)
}

impl WireDirective {
    /// Encode into segments, enforcing the same limits the receiver applies.
    pub fn segments(&self) -> Result<Vec<Segment<'_>>, ProtocolError> {
        if self.files.len() as u64 > MAX_FILES as u64 {
            return Err(ProtocolError::TooLarge {
                what: "file count",
                size: self.files.len() as u64,
                limit: MAX_FILES as u64,
            });
        }

        let mut segments = Vec::with_capacity(self.files.len() * 3 + 2);
        let mut header = vec![kind_to_wire(self.kind)];
        header.extend_from_slice(&(self.files.len() as u32).to_be_bytes());
        segments.push(Segment::Owned(header));

        for file in &self.files {
            if file.content.len() as u64 > MAX_FILE_SIZE {
                return Err(ProtocolError::TooLarge {
                    what: "file",
                    size: file.content.len() as u64,
                    limit: MAX_FILE_SIZE,
                });
            }
            let mut head = path_segment(&file.path)?;
            head.push(file.codec.wire_id());
            head.extend_from_slice(&(file.content.len() as u64).to_be_bytes());
            segments.push(Segment::Owned(head));
            segments.push(Segment::Borrowed(&file.content));
            segments.push(Segment::Borrowed(file.hash.as_bytes()));
        }

        let mut tail = (self.removed.len() as u32).to_be_bytes().to_vec();
        for path in &self.removed {
            tail.extend_from_slice(&path_segment(path)?);
        }
        segments.push(Segment::Owned(tail));

        Ok(segments)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.segments()?.iter().flat_map(|s| s.as_ref().iter().copied()).collect())
    }

    /// Total size of the uncompressed payload.
    pub fn content_len(&self) -> u64 {
        self.files.iter().map(|f| f.content.len() as u64).sum()
    }
}

pub async fn write_directive<W: AsyncWrite + Unpin>(
    writer: &mut W,
    directive: &WireDirective,
) -> Result<u64, ProtocolError> {
    let mut written = 0u64;
    for segment in directive.segments()? {
        writer.write_all(segment.as_ref()).await?;
        written += segment.as_ref().len() as u64;
    }
    writer.flush().await?;
    Ok(written)
}

async fn read_path<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ProtocolError> {
    let len = reader.read_u16().await? as usize;
    if len == 0 {
        return Err(ProtocolError::malformed("empty path"));
    }
    if len > MAX_PATH_LEN {
        return Err(ProtocolError::TooLarge {
            what: "path",
            size: len as u64,
            limit: MAX_PATH_LEN as u64,
        });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProtocolError::malformed("path is not UTF-8"))
}

pub async fn read_directive<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WireDirective, ProtocolError> {
    let kind = kind_from_wire(reader.read_u8().await?)?;

    let count = reader.read_u32().await?;
    if count > MAX_FILES {
        return Err(ProtocolError::TooLarge {
            what: "file count",
            size: count as u64,
            limit: MAX_FILES as u64,
        });
    }

    let mut files = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let path = read_path(reader).await?;
        let codec_id = reader.read_u8().await?;
        let codec = CompressionType::from_wire(codec_id)
            .ok_or_else(|| ProtocolError::malformed(format!("unknown codec {}", codec_id)))?;

        let len = reader.read_u64().await?;
        if len > MAX_FILE_SIZE {
            return Err(ProtocolError::TooLarge {
                what: "file",
                size: len,
                limit: MAX_FILE_SIZE,
            });
        }
        let mut content = Vec::new();
        (&mut *reader).take(len).read_to_end(&mut content).await?;
        if content.len() as u64 != len {
            return Err(ProtocolError::Truncated);
        }

        let mut hash = [0u8; ContentHash::LEN];
        reader.read_exact(&mut hash).await?;

        files.push(WireFile {
            path,
            codec,
            content,
            hash: ContentHash::from_bytes(hash),
        });
    }

    let removed_count = reader.read_u32().await?;
    if removed_count > MAX_FILES {
        return Err(ProtocolError::TooLarge {
            what: "removed count",
            size: removed_count as u64,
            limit: MAX_FILES as u64,
        });
    }
    let mut removed = Vec::with_capacity(removed_count.min(1024) as usize);
    for _ in 0..removed_count {
        removed.push(read_path(reader).await?);
    }

    Ok(WireDirective { kind, files, removed })
}

pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W, ack: Ack) -> std::io::Result<()> {
    match ack {
        Ack::Ok => writer.write_all(&[ACK_OK]).await?,
        Ack::Error(code) => {
            let reason = code.as_str().as_bytes();
            let mut buf = vec![ACK_ERROR, reason.len() as u8];
            buf.extend_from_slice(reason);
            writer.write_all(&buf).await?;
        }
    }
    writer.flush().await
}

pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Ack, ProtocolError> {
    match reader.read_u8().await? {
        ACK_OK => Ok(Ack::Ok),
        ACK_ERROR => {
            let len = reader.read_u8().await? as usize;
            let mut reason = vec![0u8; len];
            reader.read_exact(&mut reason).await?;
            let reason = std::str::from_utf8(&reason)
                .ok()
                .and_then(ReasonCode::parse)
                .ok_or_else(|| ProtocolError::malformed("unknown reason code in ack"))?;
            Ok(Ack::Error(reason))
        }
        status => Err(ProtocolError::malformed(format!("unknown ack status {}", status))),
    }
}
