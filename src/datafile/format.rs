//! On-disk record framing for data files and spill runs.
//!
//! Layout:
//!
//! ```text
//! [magic (4)] [version (4)]
//! [crc32 (4)] [key_len (4)] [value_len (4)] [sequence (8)] [kind (1)] [key] [value]
//! ...
//! ```
//!
//! The CRC covers the frame after the checksum field. A clean EOF at a frame
//! boundary ends the stream; a truncated frame or checksum mismatch is a
//! `CorruptFile` error.

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{KeyValue, ValueKind};
use crate::{Error, Result};

/// Magic number at the start of every data file.
pub const FILE_MAGIC: u32 = 0x5453_4446; // "TSDF"

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed size of the per-record header, excluding key and value.
pub const RECORD_HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 1;

/// Write the file header.
pub fn write_header<W: Write>(writer: &mut W) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&FILE_MAGIC.to_be_bytes());
    buf[4..].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    writer.write_all(&buf)?;
    Ok(())
}

/// Read and validate the file header.
pub fn read_header<R: Read>(reader: &mut R) -> Result<()> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::corrupt_file("missing file header"))?;

    let magic = u32::from_be_bytes(buf[..4].try_into().unwrap());
    if magic != FILE_MAGIC {
        return Err(Error::corrupt_file(format!(
            "bad magic number: {:#x}",
            magic
        )));
    }

    let version = u32::from_be_bytes(buf[4..].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::corrupt_file(format!(
            "unsupported format version: {}",
            version
        )));
    }

    Ok(())
}

/// Encoded size of a record on disk.
pub fn encoded_len(kv: &KeyValue) -> u64 {
    (4 + RECORD_HEADER_SIZE + kv.key().len() + kv.value().len()) as u64
}

/// Write one record frame.
pub fn write_record<W: Write>(writer: &mut W, kv: &KeyValue) -> Result<()> {
    let mut frame = BytesMut::with_capacity(RECORD_HEADER_SIZE + kv.key().len() + kv.value().len());
    frame.put_u32(kv.key().len() as u32);
    frame.put_u32(kv.value().len() as u32);
    frame.put_u64(kv.sequence());
    frame.put_u8(kv.kind().to_byte());
    frame.put_slice(kv.key());
    frame.put_slice(kv.value());

    let crc = crc32fast::hash(&frame);
    writer.write_all(&crc.to_be_bytes())?;
    writer.write_all(&frame)?;
    Ok(())
}

/// Read one record frame.
///
/// Returns `Ok(None)` on a clean end of stream.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<KeyValue>> {
    let mut crc_buf = [0u8; 4];
    match reader.read_exact(&mut crc_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let expected_crc = u32::from_be_bytes(crc_buf);

    let mut header = [0u8; RECORD_HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .map_err(|_| Error::corrupt_file("truncated record header"))?;

    let mut cursor = &header[..];
    let key_len = cursor.get_u32() as usize;
    let value_len = cursor.get_u32() as usize;
    let sequence = cursor.get_u64();
    let kind_byte = cursor.get_u8();

    let mut payload = vec![0u8; key_len + value_len];
    reader
        .read_exact(&mut payload)
        .map_err(|_| Error::corrupt_file("truncated record payload"))?;

    let mut frame = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
    frame.put_slice(&header);
    frame.put_slice(&payload);
    let actual_crc = crc32fast::hash(&frame);
    if actual_crc != expected_crc {
        return Err(Error::corrupt_file(format!(
            "checksum mismatch: expected {:#x}, got {:#x}",
            expected_crc, actual_crc
        )));
    }

    let kind = ValueKind::from_byte(kind_byte)
        .ok_or_else(|| Error::corrupt_file(format!("invalid value kind: {}", kind_byte)))?;

    let payload = Bytes::from(payload);
    let key = payload.slice(..key_len);
    let value = payload.slice(key_len..);

    Ok(Some(KeyValue::new(key, sequence, kind, value)))
}
