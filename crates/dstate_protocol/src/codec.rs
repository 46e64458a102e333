//! Binary format of a serialized operation log.
//!
//! ```text
//! header  : magic "DSOL" | version u16 LE | cycle id (16) | base count u32 LE | op count u32 LE
//! base    : { len u32 LE | CBOR (key, version) } * base count
//! records : { tag u8 | len u32 LE | CBOR operation } * op count
//! trailer : SHA-256 of everything above (32)
//! ```
//!
//! Record bodies are CBOR produced by `ciborium` from the serde model of
//! [`Operation`]; the tag byte must agree with the decoded variant.

use crate::error::{ProtocolError, ProtocolResult};
use crate::key::Key;
use crate::operation::{Operation, OperationKind};
use crate::oplog::OperationLog;
use crate::version::VersionInfo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Magic bytes opening a serialized log.
pub const LOG_MAGIC: [u8; 4] = *b"DSOL";

/// Current log format version.
pub const LOG_FORMAT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + 16 + 4 + 4;
const DIGEST_SIZE: usize = 32;

/// Decoded log header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    /// Format version.
    pub version: u16,
    /// Cycle that produced the log.
    pub cycle_id: Uuid,
    /// Number of base version entries.
    pub base_count: u32,
    /// Number of operation records.
    pub operation_count: u32,
}

/// One decoded operation record with its position in the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    /// Byte offset of the record's tag.
    pub offset: usize,
    /// Length of the CBOR body.
    pub body_len: usize,
    /// The decoded operation.
    pub operation: Operation,
}

/// Every part of a serialized log, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLog {
    /// The header.
    pub header: LogHeader,
    /// Base versions in stream order.
    pub base_versions: Vec<(Key, VersionInfo)>,
    /// Operation records in stream order.
    pub frames: Vec<LogFrame>,
}

/// Encodes `log` into the portable binary format.
///
/// # Errors
///
/// Fails if the log has open checkpoints or a body cannot be encoded.
pub fn encode_log(log: &OperationLog) -> ProtocolResult<Vec<u8>> {
    if log.open_checkpoints() > 0 {
        return Err(ProtocolError::OpenCheckpoints {
            count: log.open_checkpoints(),
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + log.len() * 32 + DIGEST_SIZE);
    buf.extend_from_slice(&LOG_MAGIC);
    buf.extend_from_slice(&LOG_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(log.cycle_id().as_bytes());
    buf.extend_from_slice(&count_u32(log.base_versions().len())?.to_le_bytes());
    buf.extend_from_slice(&count_u32(log.len())?.to_le_bytes());

    for entry in log.base_versions() {
        let body = to_cbor(&entry)?;
        buf.extend_from_slice(&count_u32(body.len())?.to_le_bytes());
        buf.extend_from_slice(&body);
    }

    for op in log.operations() {
        let body = to_cbor(op)?;
        buf.push(op.kind().to_code());
        buf.extend_from_slice(&count_u32(body.len())?.to_le_bytes());
        buf.extend_from_slice(&body);
    }

    let digest = Sha256::digest(&buf);
    buf.extend_from_slice(digest.as_slice());
    Ok(buf)
}

/// Decodes a serialized log into an [`OperationLog`].
///
/// # Errors
///
/// Fails if the bytes are not an intact log of a supported version.
pub fn decode_log(bytes: &[u8]) -> ProtocolResult<OperationLog> {
    let decoded = decode_frames(bytes)?;
    let base_versions: BTreeMap<Key, VersionInfo> = decoded.base_versions.into_iter().collect();
    let entries = decoded.frames.into_iter().map(|f| f.operation).collect();
    Ok(OperationLog::from_parts(
        decoded.header.cycle_id,
        base_versions,
        entries,
    ))
}

/// Decodes a serialized log, keeping record offsets for inspection.
///
/// # Errors
///
/// Fails if the bytes are not an intact log of a supported version.
pub fn decode_frames(bytes: &[u8]) -> ProtocolResult<DecodedLog> {
    if bytes.len() < HEADER_SIZE + DIGEST_SIZE {
        return Err(ProtocolError::invalid_format("log is shorter than its header"));
    }
    let (content, digest) = bytes.split_at(bytes.len() - DIGEST_SIZE);
    if Sha256::digest(content).as_slice() != digest {
        return Err(ProtocolError::DigestMismatch);
    }

    let mut reader = Reader::new(content);
    if reader.take(4)? != LOG_MAGIC {
        return Err(ProtocolError::invalid_format("bad magic"));
    }
    let version = reader.u16()?;
    if version != LOG_FORMAT_VERSION {
        return Err(ProtocolError::UnsupportedVersion { found: version });
    }
    let cycle_bytes: [u8; 16] = reader
        .take(16)?
        .try_into()
        .map_err(|_| ProtocolError::invalid_format("cycle id must be 16 bytes"))?;
    let header = LogHeader {
        version,
        cycle_id: Uuid::from_bytes(cycle_bytes),
        base_count: reader.u32()?,
        operation_count: reader.u32()?,
    };

    let mut base_versions = Vec::new();
    for _ in 0..header.base_count {
        let len = reader.u32()? as usize;
        base_versions.push(from_cbor(reader.take(len)?)?);
    }

    let mut frames = Vec::new();
    for _ in 0..header.operation_count {
        let offset = reader.pos;
        let tag = reader.u8()?;
        let kind = OperationKind::from_code(tag).ok_or(ProtocolError::UnknownTag(tag))?;
        let body_len = reader.u32()? as usize;
        let operation: Operation = from_cbor(reader.take(body_len)?)?;
        if operation.kind() != kind {
            return Err(ProtocolError::invalid_format(format!(
                "record at offset {offset} is tagged {} but holds {}",
                kind.label(),
                operation.kind().label()
            )));
        }
        frames.push(LogFrame {
            offset,
            body_len,
            operation,
        });
    }

    if !reader.is_empty() {
        return Err(ProtocolError::invalid_format(format!(
            "{} trailing bytes after last record",
            reader.remaining()
        )));
    }

    Ok(DecodedLog {
        header,
        base_versions,
        frames,
    })
}

fn count_u32(n: usize) -> ProtocolResult<u32> {
    u32::try_from(n).map_err(|_| ProtocolError::encoding_failed(format!("{n} exceeds u32")))
}

fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(value, &mut body)
        .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
    Ok(body)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> ProtocolResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::invalid_format(format!(
                "unexpected end of log at offset {}",
                self.pos
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> ProtocolResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> ProtocolResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
