//! Fixed-width binary layout of a [`LeaderInfo`] record
//!
//! The record occupies the first [`RECORD_LEN`] bytes of a namespace's lock file:
//!
//! | offset | width | field                                         |
//! |--------|-------|-----------------------------------------------|
//! | 0      | 36    | leader id, UTF-8, NUL padded                  |
//! | 36     | 8     | heartbeat interval, big-endian `i64`, millis  |
//! | 44     | 8     | heartbeat timestamp, big-endian `i64`, millis |
//!
//! There are no delimiters, so a plain `read`/`write` at offset 0 works over any
//! filesystem. A record shorter than [`RECORD_LEN`] is what a reader sees right after
//! the file is created or while a writer is midway through, and decodes as absent.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::leader_info::{LeaderInfo, LEADER_ID_LEN};

/// Size of an encoded record in bytes
pub const RECORD_LEN: usize = LEADER_ID_LEN + 8 + 8;

const INTERVAL_OFFSET: usize = LEADER_ID_LEN;
const HEARTBEAT_OFFSET: usize = LEADER_ID_LEN + 8;

/// Encode a record into its fixed-width layout
pub fn encode(info: &LeaderInfo) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    let id = info.id().as_bytes();
    // LeaderInfo::new guarantees the id fits
    buf[..id.len()].copy_from_slice(id);
    buf[INTERVAL_OFFSET..HEARTBEAT_OFFSET]
        .copy_from_slice(&info.heartbeat_interval_millis().to_be_bytes());
    buf[HEARTBEAT_OFFSET..RECORD_LEN].copy_from_slice(&info.heartbeat_millis().to_be_bytes());
    buf
}

/// Decode a record, returning `None` for short or corrupt input
///
/// Bytes beyond [`RECORD_LEN`] are ignored.
pub fn decode(bytes: &[u8]) -> Option<LeaderInfo> {
    if bytes.len() < RECORD_LEN {
        return None;
    }

    let id_field = &bytes[..LEADER_ID_LEN];
    let id_len = id_field
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |last| last + 1);
    let id = std::str::from_utf8(&id_field[..id_len]).ok()?;

    let interval = i64::from_be_bytes(bytes[INTERVAL_OFFSET..HEARTBEAT_OFFSET].try_into().ok()?);
    let heartbeat = i64::from_be_bytes(bytes[HEARTBEAT_OFFSET..RECORD_LEN].try_into().ok()?);

    match LeaderInfo::new(id, interval, heartbeat) {
        Ok(info) => Some(info),
        Err(e) => {
            tracing::trace!("Ignoring corrupt leader record: {}", e);
            None
        }
    }
}

/// Read a record from the start of `reader`
///
/// Reads until [`RECORD_LEN`] bytes are collected or the reader is exhausted.
pub fn read_leader_info<R: Read + Seek>(reader: &mut R) -> io::Result<Option<LeaderInfo>> {
    reader.seek(SeekFrom::Start(0))?;

    let mut buf = [0u8; RECORD_LEN];
    let mut filled = 0;
    while filled < RECORD_LEN {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(decode(&buf[..filled]))
}

/// Read the record stored at `path`; a missing file reads as absent
pub fn read_leader_info_from_path(path: &Path) -> io::Result<Option<LeaderInfo>> {
    match File::open(path) {
        Ok(mut file) => read_leader_info(&mut file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a record at the start of `writer`
pub fn write_leader_info<W: Write + Seek>(writer: &mut W, info: &LeaderInfo) -> io::Result<()> {
    writer.seek(SeekFrom::Start(0))?;
    writer.write_all(&encode(info))?;
    writer.flush()
}

/// Write a record into an open lock file
///
/// With `force_metadata` the file is truncated to exactly one record and both data
/// and metadata are synced to stable storage before returning.
pub fn write_leader_info_to_file(
    file: &File,
    info: &LeaderInfo,
    force_metadata: bool,
) -> io::Result<()> {
    let mut handle = file;
    write_leader_info(&mut handle, info)?;
    if force_metadata {
        file.set_len(RECORD_LEN as u64)?;
        file.sync_all()?;
    }
    Ok(())
}
