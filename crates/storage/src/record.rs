//! On-disk entry format.
//!
//! Each entry is a fixed 21-byte header followed by the key and value
//! bytes, with no padding or framing beyond the CRC:
//!
//! ```text
//! [crc32 u32][timestamp i64][key_len u32][value_len u32][deleted u8] key value
//! ```
//!
//! All integers are big-endian. The CRC (IEEE polynomial) covers the
//! header after the CRC field plus the key and value. Tombstones have
//! value length zero and the deleted flag set.

use crc32fast::Hasher;
use keel_common::Record;
use std::io::{self, Read};

/// Size of the fixed entry header.
pub const HEADER_LEN: usize = 21;

/// Outcome of decoding one entry from a reader.
#[derive(Debug)]
pub enum DecodedEntry {
    /// A valid entry and the total number of bytes it occupied.
    Entry(Record, usize),
    /// Clean end of file at an entry boundary.
    Eof,
    /// A torn or corrupt entry; the log is not readable past this point.
    Corrupt,
}

/// Encode an entry into its on-disk representation.
pub fn encode_entry(key: &[u8], value: &[u8], timestamp: i64, is_deleted: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + key.len() + value.len());
    buf.extend_from_slice(&[0u8; 4]); // CRC placeholder
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.push(u8::from(is_deleted));
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);

    let mut hasher = Hasher::new();
    hasher.update(&buf[4..]);
    let crc = hasher.finalize();
    buf[0..4].copy_from_slice(&crc.to_be_bytes());
    buf
}

/// Total on-disk size of an entry with the given key and value lengths.
pub fn entry_len(key_len: usize, value_len: usize) -> usize {
    HEADER_LEN + key_len + value_len
}

/// Decode a single entry from `reader`.
///
/// EOF at an entry boundary is a clean end; EOF inside an entry or a CRC
/// mismatch yields [`DecodedEntry::Corrupt`]. I/O errors other than EOF
/// propagate.
pub fn read_entry<R: Read>(reader: &mut R) -> Result<DecodedEntry, io::Error> {
    let mut header = [0u8; HEADER_LEN];
    match read_full(reader, &mut header) {
        ReadFull::Done => {}
        ReadFull::Empty => return Ok(DecodedEntry::Eof),
        ReadFull::Short => return Ok(DecodedEntry::Corrupt),
        ReadFull::Err(e) => return Err(e),
    }

    let stored_crc = u32::from_be_bytes(header[0..4].try_into().expect("4-byte slice"));
    let timestamp = i64::from_be_bytes(header[4..12].try_into().expect("8-byte slice"));
    let key_len = u32::from_be_bytes(header[12..16].try_into().expect("4-byte slice")) as usize;
    let value_len = u32::from_be_bytes(header[16..20].try_into().expect("4-byte slice")) as usize;
    let is_deleted = header[20] == 1;

    let mut key = vec![0u8; key_len];
    match read_full(reader, &mut key) {
        ReadFull::Done => {}
        ReadFull::Empty | ReadFull::Short => return Ok(DecodedEntry::Corrupt),
        ReadFull::Err(e) => return Err(e),
    }

    let mut value = vec![0u8; value_len];
    match read_full(reader, &mut value) {
        ReadFull::Done => {}
        ReadFull::Empty | ReadFull::Short => return Ok(DecodedEntry::Corrupt),
        ReadFull::Err(e) => return Err(e),
    }

    let mut hasher = Hasher::new();
    hasher.update(&header[4..]);
    hasher.update(&key);
    hasher.update(&value);
    if hasher.finalize() != stored_crc {
        return Ok(DecodedEntry::Corrupt);
    }

    let record = Record {
        key,
        value,
        timestamp,
        is_deleted,
    };
    Ok(DecodedEntry::Entry(record, entry_len(key_len, value_len)))
}

enum ReadFull {
    /// The buffer was filled.
    Done,
    /// Zero bytes were available (only possible for non-empty buffers).
    Empty,
    /// Some but not all bytes were available.
    Short,
    Err(io::Error),
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> ReadFull {
    if buf.is_empty() {
        return ReadFull::Done;
    }
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ReadFull::Empty
                } else {
                    ReadFull::Short
                };
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadFull::Err(e),
        }
    }
    ReadFull::Done
}
