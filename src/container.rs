//! Segment container (C3): a single on-disk file per segment holding typed
//! sub-segments plus a trailing cross-reference (xref) table, so any
//! sub-segment can be read at random without scanning the whole file.
//!
//! Layout:
//! ```text
//! [ body: sub-segments in write order ]
//! [ xref table: repeat { u32 type_len | type_bytes | u32 offset | u32 length } ]
//! [ literal "startxref" ]
//! [ i64 big-endian xref_start_offset ]
//! ```
//! Each sub-segment is `u32 type_len | type_bytes | u32 data_len | u32 crc32 | data_bytes`.
//! All integers are big-endian. `offset` in the xref points at the start of
//! the sub-segment record (the `type_len` field), so
//! `offset + 4 + type_len + 4 + 4 + length <= xref_start` always holds.

use crate::error::{MeshError, MeshResult};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const STARTXREF_LITERAL: &[u8] = b"startxref";
const MAX_TYPE_LEN: usize = 100;

/// Recognized sub-segment type names (§4.3).
pub mod types {
    pub const FILEID: &str = "FILEID";
    pub const P2PKHSCRIPT: &str = "P2PKHSCRIPT";
    pub const P2PKSCRIPT: &str = "P2PKSCRIPT";
    pub const SLICETABLE: &str = "SLICETABLE";
    pub const SEGMENTINDEX: &str = "SEGMENTINDEX";
    pub const SEGMENTID: &str = "SEGMENTID";
    pub const CRC32CHECKSUM: &str = "CRC32CHECKSUM";
    pub const SEGMENTCONTENT: &str = "SEGMENTCONTENT";
    pub const ENCRYPTIONKEY: &str = "ENCRYPTIONKEY";
    pub const SIGNATURE: &str = "SIGNATURE";
    pub const SHARED: &str = "SHARED";
    pub const VERSION: &str = "VERSION";
}

#[derive(Debug, Clone)]
struct XrefEntry {
    type_name: String,
    offset: u64,
    length: u32,
}

/// A segment container, either freshly built in memory or opened from disk.
/// Holds the body sub-segments in write order plus a parsed xref for
/// random access.
pub struct Container {
    path: PathBuf,
    body: Vec<(String, Vec<u8>)>,
    xref: Vec<XrefEntry>,
}

impl Container {
    /// Build and persist a new container atomically (write-to-temp,
    /// fsync, rename), given the sub-segments in the order they should be
    /// written.
    pub fn write_new(path: &Path, entries: &[(&str, &[u8])]) -> MeshResult<Container> {
        for (type_name, _) in entries {
            if type_name.len() > MAX_TYPE_LEN {
                return Err(MeshError::Corrupt(format!(
                    "sub-segment type name {:?} exceeds {} bytes",
                    type_name, MAX_TYPE_LEN
                )));
            }
        }

        let body: Vec<(String, Vec<u8>)> = entries
            .iter()
            .map(|(t, d)| (t.to_string(), d.to_vec()))
            .collect();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = tmp_path_for(path);
        let mut file = File::create(&tmp_path)?;
        let xref = write_body_and_trailer(&mut file, &body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;

        Ok(Container {
            path: path.to_path_buf(),
            body,
            xref,
        })
    }

    /// Open an existing container, parsing its xref table via `load_xref`.
    pub fn open(path: &Path) -> MeshResult<Container> {
        let mut file = File::open(path)?;
        let xref = load_xref(&mut file)?;
        let mut body = Vec::with_capacity(xref.len());
        for entry in &xref {
            let (_, data) = read_entry(&mut file, entry)?;
            body.push((entry.type_name.clone(), data));
        }
        Ok(Container {
            path: path.to_path_buf(),
            body,
            xref,
        })
    }

    /// Read a set of sub-segments by type, re-checking each one's CRC.
    /// Fails with `ErrCorrupt` on the first mismatch.
    pub fn read_sub_segments(&self, wanted: &[&str]) -> MeshResult<HashMap<String, Vec<u8>>> {
        let mut file = File::open(&self.path)?;
        let mut out = HashMap::new();
        for type_name in wanted {
            let entry = self
                .xref
                .iter()
                .rev()
                .find(|e| e.type_name == *type_name)
                .ok_or_else(|| {
                    MeshError::NotFound(format!("sub-segment {:?} not present", type_name))
                })?;
            let (_, data) = read_entry(&mut file, entry)?;
            out.insert(type_name.to_string(), data);
        }
        Ok(out)
    }

    /// Convenience accessor reading the in-memory copy without touching
    /// disk again (valid as long as nothing else has mutated the file).
    pub fn get(&self, type_name: &str) -> Option<&[u8]> {
        self.body
            .iter()
            .rev()
            .find(|(t, _)| t == type_name)
            .map(|(_, d)| d.as_slice())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a new sub-segment at EOF-of-body and rewrite the xref +
    /// trailer. On a duplicate type the xref entry is overwritten so the
    /// latest write wins; the container is rewritten atomically as a whole,
    /// which keeps the on-disk file always a valid container even if the
    /// process dies mid-write.
    pub fn write_sub_segment(&mut self, type_name: &str, data: &[u8]) -> MeshResult<()> {
        if type_name.len() > MAX_TYPE_LEN {
            return Err(MeshError::Corrupt(format!(
                "sub-segment type name {:?} exceeds {} bytes",
                type_name, MAX_TYPE_LEN
            )));
        }
        self.body.push((type_name.to_string(), data.to_vec()));

        let tmp_path = tmp_path_for(&self.path);
        let mut file = File::create(&tmp_path)?;
        let xref = write_body_and_trailer(&mut file, &self.body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &self.path)?;
        self.xref = xref;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes the body sub-segments, then the xref table, then the trailer.
/// Returns the xref entries (offsets relative to the start of the file).
fn write_body_and_trailer(
    file: &mut File,
    body: &[(String, Vec<u8>)],
) -> MeshResult<Vec<XrefEntry>> {
    let mut xref = Vec::with_capacity(body.len());
    let mut offset: u64 = 0;
    for (type_name, data) in body {
        let type_bytes = type_name.as_bytes();
        file.write_all(&(type_bytes.len() as u32).to_be_bytes())?;
        file.write_all(type_bytes)?;
        file.write_all(&(data.len() as u32).to_be_bytes())?;
        file.write_all(&crate::hashcodec::crc32_ieee(data).to_be_bytes())?;
        file.write_all(data)?;

        xref.push(XrefEntry {
            type_name: type_name.clone(),
            offset,
            length: data.len() as u32,
        });
        offset += 4 + type_bytes.len() as u64 + 4 + 4 + data.len() as u64;
    }

    let xref_start = offset;
    for entry in &xref {
        let type_bytes = entry.type_name.as_bytes();
        file.write_all(&(type_bytes.len() as u32).to_be_bytes())?;
        file.write_all(type_bytes)?;
        file.write_all(&(entry.offset as u32).to_be_bytes())?;
        file.write_all(&entry.length.to_be_bytes())?;
    }

    file.write_all(STARTXREF_LITERAL)?;
    file.write_all(&(xref_start as i64).to_be_bytes())?;

    Ok(xref)
}

/// Seek to EOF, search backward in fixed-size windows for the literal
/// `startxref`, read the trailing i64 offset, then parse the xref entries.
fn load_xref(file: &mut File) -> MeshResult<Vec<XrefEntry>> {
    let file_len = file.seek(SeekFrom::End(0))?;
    let trailer_pos = find_startxref_backward(file, file_len)?;

    file.seek(SeekFrom::Start(trailer_pos + STARTXREF_LITERAL.len() as u64))?;
    let mut offset_buf = [0u8; 8];
    file.read_exact(&mut offset_buf)?;
    let xref_start = i64::from_be_bytes(offset_buf) as u64;

    file.seek(SeekFrom::Start(xref_start))?;
    let mut entries = Vec::new();
    let mut pos = xref_start;
    while pos < trailer_pos {
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let type_len = u32::from_be_bytes(len_buf) as usize;
        if type_len > MAX_TYPE_LEN {
            return Err(MeshError::Corrupt(
                "xref entry type_len exceeds maximum".to_string(),
            ));
        }
        let mut type_bytes = vec![0u8; type_len];
        file.read_exact(&mut type_bytes)?;
        let type_name = String::from_utf8(type_bytes)
            .map_err(|_| MeshError::Corrupt("xref entry type is not valid utf8".to_string()))?;

        let mut off_buf = [0u8; 4];
        file.read_exact(&mut off_buf)?;
        let entry_offset = u32::from_be_bytes(off_buf) as u64;

        let mut len_buf2 = [0u8; 4];
        file.read_exact(&mut len_buf2)?;
        let length = u32::from_be_bytes(len_buf2);

        entries.push(XrefEntry {
            type_name,
            offset: entry_offset,
            length,
        });
        pos += 4 + type_len as u64 + 4 + 4;
    }
    Ok(entries)
}

fn find_startxref_backward(file: &mut File, file_len: u64) -> MeshResult<u64> {
    const WINDOW: u64 = 4096;
    let trailer_min_len = STARTXREF_LITERAL.len() as u64 + 8;
    if file_len < trailer_min_len {
        return Err(MeshError::Corrupt(
            "container too short to contain a trailer".to_string(),
        ));
    }

    let mut search_end = file_len;
    loop {
        let search_start = search_end.saturating_sub(WINDOW);
        let read_len = (search_end - search_start) as usize;
        file.seek(SeekFrom::Start(search_start))?;
        let mut buf = vec![0u8; read_len];
        file.read_exact(&mut buf)?;

        if let Some(rel_pos) = find_last_subslice(&buf, STARTXREF_LITERAL) {
            return Ok(search_start + rel_pos as u64);
        }

        if search_start == 0 {
            return Err(MeshError::Corrupt(
                "startxref literal not found in container".to_string(),
            ));
        }
        // Overlap by the literal's length so a match straddling the window
        // boundary is not missed.
        search_end = search_start + STARTXREF_LITERAL.len() as u64;
    }
}

fn find_last_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

fn read_entry(file: &mut File, entry: &XrefEntry) -> MeshResult<(String, Vec<u8>)> {
    file.seek(SeekFrom::Start(entry.offset))?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let type_len = u32::from_be_bytes(len_buf) as usize;
    let mut type_bytes = vec![0u8; type_len];
    file.read_exact(&mut type_bytes)?;
    let type_name = String::from_utf8(type_bytes)
        .map_err(|_| MeshError::Corrupt("sub-segment type is not valid utf8".to_string()))?;
    if type_name != entry.type_name {
        return Err(MeshError::Corrupt(format!(
            "xref type mismatch: expected {:?}, found {:?}",
            entry.type_name, type_name
        )));
    }

    let mut data_len_buf = [0u8; 4];
    file.read_exact(&mut data_len_buf)?;
    let data_len = u32::from_be_bytes(data_len_buf) as usize;

    let mut crc_buf = [0u8; 4];
    file.read_exact(&mut crc_buf)?;
    let stored_crc = u32::from_be_bytes(crc_buf);

    let mut data = vec![0u8; data_len];
    file.read_exact(&mut data)?;

    let actual_crc = crate::hashcodec::crc32_ieee(&data);
    if actual_crc != stored_crc {
        return Err(MeshError::Corrupt(format!(
            "CRC mismatch for sub-segment {:?}: stored {:x}, computed {:x}",
            type_name, stored_crc, actual_crc
        )));
    }

    Ok((type_name, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips_every_type() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment-0");
        let entries: Vec<(&str, &[u8])> = vec![
            (types::FILEID, b"file-id-bytes"),
            (types::SEGMENTINDEX, b"\x00\x00\x00\x00"),
            (types::SEGMENTCONTENT, b"ciphertext goes here"),
            (types::ENCRYPTIONKEY, b"0123456789abcdef0123456789abcdef"),
            (types::SIGNATURE, b"signature bytes"),
            (types::SHARED, b"\x00"),
        ];
        let container = Container::write_new(&path, &entries).unwrap();
        let read = container
            .read_sub_segments(&[types::FILEID, types::SEGMENTCONTENT, types::SHARED])
            .unwrap();
        assert_eq!(read[types::FILEID], b"file-id-bytes");
        assert_eq!(read[types::SEGMENTCONTENT], b"ciphertext goes here");
        assert_eq!(read[types::SHARED], b"\x00");
    }

    #[test]
    fn opening_from_disk_matches_in_memory_copy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment-1");
        let entries: Vec<(&str, &[u8])> = vec![(types::FILEID, b"abc"), (types::VERSION, b"1")];
        Container::write_new(&path, &entries).unwrap();

        let reopened = Container::open(&path).unwrap();
        let read = reopened
            .read_sub_segments(&[types::FILEID, types::VERSION])
            .unwrap();
        assert_eq!(read[types::FILEID], b"abc");
        assert_eq!(read[types::VERSION], b"1");
    }

    #[test]
    fn write_sub_segment_overwrites_duplicate_type() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment-2");
        let entries: Vec<(&str, &[u8])> = vec![(types::SHARED, b"\x00")];
        let mut container = Container::write_new(&path, &entries).unwrap();

        container.write_sub_segment(types::SHARED, b"\x01").unwrap();
        let read = container.read_sub_segments(&[types::SHARED]).unwrap();
        assert_eq!(read[types::SHARED], b"\x01");

        let reopened = Container::open(&path).unwrap();
        let read2 = reopened.read_sub_segments(&[types::SHARED]).unwrap();
        assert_eq!(read2[types::SHARED], b"\x01");
    }

    #[test]
    fn corrupted_byte_is_detected_on_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment-3");
        let type_name = types::SEGMENTCONTENT;
        let data = b"clean content";
        Container::write_new(&path, &[(type_name, data.as_slice())]).unwrap();

        // data begins right after the sub-segment's type_len/type/data_len/crc32 header
        let data_start = 4 + type_name.len() + 4 + 4;
        let mut bytes = fs::read(&path).unwrap();
        bytes[data_start] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let reopened = Container::open(&path);
        assert!(reopened.is_err());
    }
}
