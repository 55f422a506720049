// PAKR container archive
//
// File Format (all integers little-endian, strings u16-length-prefixed UTF-8)
// [4]  magic number "PAKR"
// [4]  version encoded as u32 (currently 1)
// [2]  entry count encoded as u16
// per entry:
//   [2+n] entry name (string)
//   [8]   offset of the entry's bytes, relative to the start of the data region
//   [8]   length of the entry's bytes
// [x]  data region (entries laid out back to back)
//
// A container file may sit behind an application-defined header; callers slice
// the archive out at whatever offset they configured before parsing. Readers
// keep the whole archive as `Bytes`, so entry lookups are zero-copy slices.

use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};
use std::sync::Arc;

use crate::reader::ByteReader;
use crate::{PakratError, PakratResult};

pub const ARCHIVE_MAGIC: [u8; 4] = *b"PAKR";
pub const ARCHIVE_VERSION: u32 = 1;

#[derive(Clone)]
struct EntrySpan {
    offset: usize,
    len: usize,
}

/// A parsed container archive. Cheap to clone.
#[derive(Clone)]
pub struct PakArchive {
    data: Bytes,
    entries: FnvHashMap<Arc<str>, EntrySpan>,
    // table order, for stable iteration
    names: Vec<Arc<str>>,
}

impl PakArchive {
    pub fn parse(data: Bytes) -> PakratResult<PakArchive> {
        let mut reader = ByteReader::new(&data, "archive header");

        let magic = reader.read_bytes(4)?;
        if magic != ARCHIVE_MAGIC {
            return Err(PakratError::Configuration(format!(
                "bad archive magic {:02x?}",
                magic
            )));
        }

        let version = reader.read_u32()?;
        if version != ARCHIVE_VERSION {
            return Err(PakratError::Configuration(format!(
                "unsupported archive version {}",
                version
            )));
        }

        let entry_count = reader.read_u16()?;
        let mut raw = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let name = reader.read_str()?;
            let offset = reader.read_u64()?;
            let len = reader.read_u64()?;
            raw.push((name, offset, len));
        }

        let data_start = reader.position();
        let region_len = (data.len() - data_start) as u64;

        let mut entries = FnvHashMap::default();
        let mut names = Vec::with_capacity(raw.len());
        for (name, offset, len) in raw {
            let end = offset.checked_add(len).unwrap_or(u64::MAX);
            if end > region_len {
                return Err(PakratError::Configuration(format!(
                    "archive entry {:?} spans {}..{} outside the {} byte data region",
                    name, offset, end, region_len
                )));
            }

            let name: Arc<str> = Arc::from(name);
            let span = EntrySpan {
                offset: data_start + offset as usize,
                len: len as usize,
            };
            if entries.insert(name.clone(), span).is_some() {
                return Err(PakratError::Configuration(format!(
                    "duplicate archive entry {:?}",
                    name
                )));
            }
            names.push(name);
        }

        Ok(PakArchive {
            data,
            entries,
            names,
        })
    }

    /// Zero-copy slice of the named entry's bytes.
    pub fn entry(
        &self,
        name: &str,
    ) -> Option<Bytes> {
        self.entries
            .get(name)
            .map(|span| self.data.slice(span.offset..span.offset + span.len))
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|name| &**name)
    }

    pub fn entry_count(&self) -> usize {
        self.names.len()
    }

    /// Total size of the backing buffer, header included.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Builds archives for tools, tests, and the demo. The runtime only reads.
#[derive(Default)]
pub struct ArchiveWriter {
    entries: Vec<(String, Vec<u8>)>,
}

impl ArchiveWriter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_entry(
        &mut self,
        name: &str,
        data: Vec<u8>,
    ) {
        self.entries.push((name.to_string(), data));
    }

    pub fn into_bytes(self) -> PakratResult<Vec<u8>> {
        if self.entries.len() > u16::MAX as usize {
            return Err(PakratError::Configuration(format!(
                "{} entries do not fit a u16 entry count",
                self.entries.len()
            )));
        }

        let mut seen = FnvHashSet::default();
        for (name, _) in &self.entries {
            if !seen.insert(name.as_str()) {
                return Err(PakratError::Configuration(format!(
                    "duplicate archive entry {:?}",
                    name
                )));
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(&ARCHIVE_MAGIC);
        out.extend_from_slice(&ARCHIVE_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());

        let mut offset = 0u64;
        for (name, data) in &self.entries {
            write_str(&mut out, name)?;
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            offset += data.len() as u64;
        }

        for (_, data) in &self.entries {
            out.extend_from_slice(data);
        }

        Ok(out)
    }
}

pub(crate) fn write_str(
    out: &mut Vec<u8>,
    value: &str,
) -> PakratResult<()> {
    if value.len() > u16::MAX as usize {
        return Err(PakratError::Configuration(format!(
            "string of {} bytes does not fit a u16 length prefix",
            value.len()
        )));
    }

    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_entry_archive() -> Vec<u8> {
        let mut writer = ArchiveWriter::new();
        writer.add_entry("meshes/hero.mesh", b"hero bytes".to_vec());
        writer.add_entry("textures/hero.tex", b"tex".to_vec());
        writer.into_bytes().unwrap()
    }

    #[test]
    fn round_trips_entries() {
        let archive = PakArchive::parse(Bytes::from(two_entry_archive())).unwrap();
        assert_eq!(archive.entry_count(), 2);
        assert_eq!(
            archive.entry("meshes/hero.mesh").unwrap().as_ref(),
            b"hero bytes"
        );
        assert_eq!(archive.entry("textures/hero.tex").unwrap().as_ref(), b"tex");
        assert!(archive.entry("missing").is_none());

        let names: Vec<&str> = archive.entry_names().collect();
        assert_eq!(names, vec!["meshes/hero.mesh", "textures/hero.tex"]);
    }

    #[test]
    fn entries_share_the_backing_buffer() {
        let bytes = Bytes::from(two_entry_archive());
        let archive = PakArchive::parse(bytes.clone()).unwrap();
        let entry = archive.entry("textures/hero.tex").unwrap();

        // A slice of the parsed buffer, not a copy.
        let offset = entry.as_ptr() as usize - bytes.as_ptr() as usize;
        assert_eq!(&bytes[offset..offset + entry.len()], entry.as_ref());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = two_entry_archive();
        bytes[0] = b'X';
        assert!(matches!(
            PakArchive::parse(Bytes::from(bytes)),
            Err(PakratError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_entry_span() {
        let mut writer = ArchiveWriter::new();
        writer.add_entry("a", vec![1, 2, 3]);
        let mut bytes = writer.into_bytes().unwrap();
        // Grow the recorded length past the data region. The length field is
        // the last 8 bytes of the entry table.
        let data_start = bytes.len() - 3;
        bytes[data_start - 8] = 0xff;
        assert!(matches!(
            PakArchive::parse(Bytes::from(bytes)),
            Err(PakratError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_duplicate_entries() {
        let mut writer = ArchiveWriter::new();
        writer.add_entry("a", vec![1]);
        writer.add_entry("a", vec![2]);
        assert!(matches!(
            writer.into_bytes(),
            Err(PakratError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_truncated_header() {
        let bytes = two_entry_archive();
        assert!(matches!(
            PakArchive::parse(Bytes::from(bytes[..9].to_vec())),
            Err(PakratError::Configuration(_))
        ));
    }
}
