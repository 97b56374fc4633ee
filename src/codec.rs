//! Bit-exact serialization of segments and index records.
//!
//! All multi-byte integers are little-endian; every record trails a
//! CRC-32 (IEEE) over all preceding bytes of that record. The codec
//! frames and verifies value payloads but never interprets them:
//! a decoded segment's value is still pipeline-encoded.

use std::fs::File;
use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{Error, Result};
use crate::store::index::{inode_num, Inode};
use crate::store::segment::Segment;
use crate::types::Kind;

/// First four bytes of every data, snapshot and checkpoint file.
pub const DATA_FILE_MAGIC: [u8; 4] = [0xDB, 0x00, 0x01, 0x01];

/// Fixed segment header: tombstone, kind, expired_at, created_at,
/// key_size, value_size.
pub const SEGMENT_HEADER_SIZE: usize = 26;

/// Trailing CRC-32.
pub const SEGMENT_TRAILER_SIZE: usize = 4;

/// One fixed-width index record:
/// `| inum:8 | region_id:8 | position:8 | length:4 | expired_at:8 | created_at:8 | type:1 | crc32:4 |`
pub const INDEX_RECORD_SIZE: usize = 49;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Serialize a segment: header fields in order, key, value, then the
/// CRC over everything before it.
pub fn encode_segment(seg: &Segment) -> Result<Vec<u8>> {
    let total =
        SEGMENT_HEADER_SIZE + seg.key.len() + seg.value.len() + SEGMENT_TRAILER_SIZE;
    let mut buf = Vec::with_capacity(total);

    buf.write_u8(seg.tombstone as u8)?;
    buf.write_u8(seg.kind as u8)?;
    buf.write_i64::<LittleEndian>(seg.expired_at)?;
    buf.write_i64::<LittleEndian>(seg.created_at)?;
    buf.write_u32::<LittleEndian>(seg.key.len() as u32)?;
    buf.write_u32::<LittleEndian>(seg.value.len() as u32)?;
    buf.extend_from_slice(&seg.key);
    buf.extend_from_slice(&seg.value);

    let checksum = CRC32.checksum(&buf);
    buf.write_u32::<LittleEndian>(checksum)?;

    Ok(buf)
}

/// Read and verify one segment at `offset`. Returns the inode number of
/// the raw key bytes along with the segment; the value is left
/// pipeline-encoded.
pub fn decode_segment(file: &File, offset: i64) -> Result<(u64, Segment)> {
    let file_len = file.metadata()?.len() as i64;
    let offset = offset as u64;

    if (offset as i64) + (SEGMENT_HEADER_SIZE as i64) > file_len {
        return Err(Error::Truncated(format!(
            "segment header at {offset} runs past end of file ({file_len})"
        )));
    }

    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    read_exact_at(file, &mut header, offset)?;

    let mut rdr = &header[..];
    let tombstone = match rdr.read_u8()? {
        0 => false,
        1 => true,
        other => {
            return Err(Error::Codec(format!("invalid tombstone byte: {other}")));
        }
    };
    let kind = Kind::from_u8(rdr.read_u8()?)?;
    let expired_at = rdr.read_i64::<LittleEndian>()?;
    let created_at = rdr.read_i64::<LittleEndian>()?;
    let key_size = rdr.read_u32::<LittleEndian>()? as usize;
    let value_size = rdr.read_u32::<LittleEndian>()? as usize;

    let body_end = offset as i64
        + (SEGMENT_HEADER_SIZE + key_size + value_size + SEGMENT_TRAILER_SIZE) as i64;
    if body_end > file_len {
        return Err(Error::Truncated(format!(
            "segment at {offset} claims {key_size}+{value_size} bytes past end of file"
        )));
    }

    let mut key = vec![0u8; key_size];
    read_exact_at(file, &mut key, offset + SEGMENT_HEADER_SIZE as u64)?;

    let mut value = vec![0u8; value_size];
    read_exact_at(
        file,
        &mut value,
        offset + (SEGMENT_HEADER_SIZE + key_size) as u64,
    )?;

    let mut trailer = [0u8; SEGMENT_TRAILER_SIZE];
    read_exact_at(
        file,
        &mut trailer,
        offset + (SEGMENT_HEADER_SIZE + key_size + value_size) as u64,
    )?;
    let stored = u32::from_le_bytes(trailer);

    let mut digest = CRC32.digest();
    digest.update(&header);
    digest.update(&key);
    digest.update(&value);
    let computed = digest.finalize();

    if stored != computed {
        return Err(Error::Checksum(format!(
            "segment at {offset}: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }

    let inum = inode_num(&key);
    Ok((
        inum,
        Segment {
            tombstone,
            kind,
            expired_at,
            created_at,
            key,
            value,
        },
    ))
}

/// Serialize one index record for a snapshot or checkpoint file.
/// The mvcc counter is runtime state and is not persisted.
pub fn encode_index_record(inum: u64, inode: &Inode) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(INDEX_RECORD_SIZE);

    buf.write_u64::<LittleEndian>(inum)?;
    buf.write_i64::<LittleEndian>(inode.region_id)?;
    buf.write_i64::<LittleEndian>(inode.position)?;
    buf.write_u32::<LittleEndian>(inode.length)?;
    buf.write_i64::<LittleEndian>(inode.expired_at)?;
    buf.write_i64::<LittleEndian>(inode.created_at)?;
    buf.write_u8(inode.kind as u8)?;

    let checksum = CRC32.checksum(&buf);
    buf.write_u32::<LittleEndian>(checksum)?;

    Ok(buf)
}

/// Decode and verify one fixed-width index record.
pub fn decode_index_record(buf: &[u8]) -> Result<(u64, Inode)> {
    if buf.len() != INDEX_RECORD_SIZE {
        return Err(Error::Truncated(format!(
            "index record is {} bytes, want {INDEX_RECORD_SIZE}",
            buf.len()
        )));
    }

    let (body, trailer) = buf.split_at(INDEX_RECORD_SIZE - 4);
    let stored = u32::from_le_bytes(trailer.try_into().unwrap());
    let computed = CRC32.checksum(body);
    if stored != computed {
        return Err(Error::Checksum(format!(
            "index record: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }

    let mut rdr = body;
    let inum = rdr.read_u64::<LittleEndian>()?;
    let region_id = rdr.read_i64::<LittleEndian>()?;
    let position = rdr.read_i64::<LittleEndian>()?;
    let length = rdr.read_u32::<LittleEndian>()?;
    let expired_at = rdr.read_i64::<LittleEndian>()?;
    let created_at = rdr.read_i64::<LittleEndian>()?;
    let kind = Kind::from_u8(rdr.read_u8()?)?;

    Ok((
        inum,
        Inode {
            region_id,
            position,
            length,
            expired_at,
            created_at,
            kind,
            mvcc: 0,
        },
    ))
}

/// Positional read that leaves the file cursor alone, so concurrent
/// readers need no synchronization.
#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}
