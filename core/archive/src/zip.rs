//! Store-only streaming zip writer.
//!
//! Entry sizes are unknown when an entry starts (sources are streams), so
//! every local header sets general-purpose bit 3 and the real CRC-32 and
//! sizes follow the entry data in a data descriptor. Readers that only
//! consult the central directory see final values either way.
//!
//! Zip64 is not emitted: entries or offsets past 4 GiB, and archives with
//! more than 65535 entries, are rejected rather than silently truncated.

use crc32fast::Hasher;
use std::io::Write;

use vaultdrop_common::{Error, Result};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_DIR_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;

/// Bit 3 (sizes in data descriptor) and bit 11 (UTF-8 names).
const ENTRY_FLAGS: u16 = 0x0808;
/// Minimum zip version able to read store-only entries.
const VERSION_NEEDED: u16 = 20;

const LOCAL_HEADER_LEN: u64 = 30;
const DESCRIPTOR_LEN: u64 = 16;
const CENTRAL_ENTRY_LEN: u64 = 46;
const EOCD_LEN: u64 = 22;

/// Predict the final archive size for a set of `(name, size)` entries.
///
/// Exact for this writer as long as no entry is truncated; callers use it as
/// a Content-Length hint, never for correctness.
pub fn estimate_archive_size<'a>(entries: impl IntoIterator<Item = (&'a str, u64)>) -> u64 {
    let mut total = EOCD_LEN;
    for (name, size) in entries {
        let name_len = name.len() as u64;
        total += size + LOCAL_HEADER_LEN + DESCRIPTOR_LEN + CENTRAL_ENTRY_LEN + 2 * name_len;
    }
    total
}

struct EntryRecord {
    name: String,
    crc: u32,
    size: u64,
    header_offset: u64,
    time: u16,
    date: u16,
}

struct OpenEntry {
    name: String,
    hasher: Hasher,
    size: u64,
    header_offset: u64,
    time: u16,
    date: u16,
}

/// Streaming zip writer over any [`Write`] sink.
///
/// Usage is strictly `begin_entry` / `write_chunk`* / `end_entry` per file,
/// then one `finish`. The assembler drives a `Vec<u8>` sink and drains it
/// between writes; the CLI writes to a file directly.
pub struct ZipWriter<W: Write> {
    sink: W,
    offset: u64,
    entries: Vec<EntryRecord>,
    current: Option<OpenEntry>,
}

impl<W: Write> ZipWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            offset: 0,
            entries: Vec::new(),
            current: None,
        }
    }

    /// Total bytes emitted so far.
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    /// True while an entry is open.
    pub fn entry_open(&self) -> bool {
        self.current.is_some()
    }

    /// The sink, for draining buffered output.
    pub fn sink_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    fn emit(&mut self, data: &[u8]) -> Result<()> {
        self.sink.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Start a new entry.
    ///
    /// # Preconditions
    /// - No other entry is open
    /// - `name` is non-empty
    pub fn begin_entry(&mut self, name: &str) -> Result<()> {
        if self.current.is_some() {
            return Err(Error::InvalidInput(
                "Previous entry is still open".to_string(),
            ));
        }
        if name.is_empty() {
            return Err(Error::InvalidInput("Entry name is empty".to_string()));
        }

        let (time, date) = dos_datetime();
        let header_offset = self.offset;

        let mut header = Vec::with_capacity(LOCAL_HEADER_LEN as usize + name.len());
        push_u32(&mut header, LOCAL_HEADER_SIG);
        push_u16(&mut header, VERSION_NEEDED);
        push_u16(&mut header, ENTRY_FLAGS);
        push_u16(&mut header, 0); // method: store
        push_u16(&mut header, time);
        push_u16(&mut header, date);
        push_u32(&mut header, 0); // crc, in descriptor
        push_u32(&mut header, 0); // compressed size, in descriptor
        push_u32(&mut header, 0); // uncompressed size, in descriptor
        push_u16(&mut header, name.len() as u16);
        push_u16(&mut header, 0); // extra field length
        header.extend_from_slice(name.as_bytes());
        self.emit(&header)?;

        self.current = Some(OpenEntry {
            name: name.to_string(),
            hasher: Hasher::new(),
            size: 0,
            header_offset,
            time,
            date,
        });
        Ok(())
    }

    /// Append bytes to the open entry.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let entry = self
            .current
            .as_mut()
            .ok_or_else(|| Error::InvalidInput("No entry open".to_string()))?;
        entry.hasher.update(data);
        entry.size += data.len() as u64;
        self.emit(data)
    }

    /// Close the open entry, writing its data descriptor.
    ///
    /// An entry whose source failed mid-stream is closed the same way; the
    /// descriptor then covers the truncated bytes and the zip stays readable.
    pub fn end_entry(&mut self) -> Result<()> {
        let entry = self
            .current
            .take()
            .ok_or_else(|| Error::InvalidInput("No entry open".to_string()))?;
        let crc = entry.hasher.finalize();
        let size = fit_u32(entry.size, "Entry size")?;

        let mut descriptor = Vec::with_capacity(DESCRIPTOR_LEN as usize);
        push_u32(&mut descriptor, DATA_DESCRIPTOR_SIG);
        push_u32(&mut descriptor, crc);
        push_u32(&mut descriptor, size);
        push_u32(&mut descriptor, size);
        self.emit(&descriptor)?;

        self.entries.push(EntryRecord {
            name: entry.name,
            crc,
            size: entry.size,
            header_offset: entry.header_offset,
            time: entry.time,
            date: entry.date,
        });
        Ok(())
    }

    /// Write the central directory and end-of-directory record.
    ///
    /// # Preconditions
    /// - No entry is open
    pub fn finish(mut self) -> Result<W> {
        if self.current.is_some() {
            return Err(Error::InvalidInput(
                "Cannot finish with an open entry".to_string(),
            ));
        }

        let dir_offset = self.offset;
        let records = std::mem::take(&mut self.entries);
        if records.len() > u16::MAX as usize {
            return Err(Error::InvalidInput(format!(
                "Too many entries for a zip directory: {}",
                records.len()
            )));
        }
        for record in &records {
            let size = fit_u32(record.size, "Entry size")?;
            let header_offset = fit_u32(record.header_offset, "Entry offset")?;
            let mut entry = Vec::with_capacity(CENTRAL_ENTRY_LEN as usize + record.name.len());
            push_u32(&mut entry, CENTRAL_DIR_SIG);
            push_u16(&mut entry, VERSION_NEEDED); // version made by
            push_u16(&mut entry, VERSION_NEEDED);
            push_u16(&mut entry, ENTRY_FLAGS);
            push_u16(&mut entry, 0); // method: store
            push_u16(&mut entry, record.time);
            push_u16(&mut entry, record.date);
            push_u32(&mut entry, record.crc);
            push_u32(&mut entry, size);
            push_u32(&mut entry, size);
            push_u16(&mut entry, record.name.len() as u16);
            push_u16(&mut entry, 0); // extra field length
            push_u16(&mut entry, 0); // comment length
            push_u16(&mut entry, 0); // disk number
            push_u16(&mut entry, 0); // internal attributes
            push_u32(&mut entry, 0); // external attributes
            push_u32(&mut entry, header_offset);
            entry.extend_from_slice(record.name.as_bytes());
            self.emit(&entry)?;
        }
        let dir_size = self.offset - dir_offset;

        let mut eocd = Vec::with_capacity(EOCD_LEN as usize);
        push_u32(&mut eocd, EOCD_SIG);
        push_u16(&mut eocd, 0); // this disk
        push_u16(&mut eocd, 0); // directory disk
        push_u16(&mut eocd, records.len() as u16);
        push_u16(&mut eocd, records.len() as u16);
        push_u32(&mut eocd, fit_u32(dir_size, "Directory size")?);
        push_u32(&mut eocd, fit_u32(dir_offset, "Directory offset")?);
        push_u16(&mut eocd, 0); // comment length
        self.emit(&eocd)?;

        Ok(self.sink)
    }
}

/// Reject values the non-zip64 fields cannot hold.
fn fit_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::InvalidInput(format!("{} exceeds the 4 GiB zip limit", what)))
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Current UTC time in MS-DOS format (2-second resolution, epoch 1980).
fn dos_datetime() -> (u16, u16) {
    use chrono::{Datelike, Timelike, Utc};
    let now = Utc::now();
    let time =
        ((now.hour() as u16) << 11) | ((now.minute() as u16) << 5) | (now.second() as u16 / 2);
    let year = (now.year().clamp(1980, 2107) - 1980) as u16;
    let date = (year << 9) | ((now.month() as u16) << 5) | (now.day() as u16);
    (time, date)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn crc_of(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    #[test]
    fn test_entries_roundtrip_through_central_directory() {
        let mut writer = ZipWriter::new(Vec::new());
        writer.begin_entry("a.txt").unwrap();
        writer.write_chunk(b"hello ").unwrap();
        writer.write_chunk(b"world").unwrap();
        writer.end_entry().unwrap();
        writer.begin_entry("dir/b.bin").unwrap();
        writer.write_chunk(&[0u8; 1000]).unwrap();
        writer.end_entry().unwrap();
        let data = writer.finish().unwrap();

        let entries = reader::parse(&data);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 11);
        assert_eq!(entries[0].crc, crc_of(b"hello world"));
        assert_eq!(entries[1].name, "dir/b.bin");
        assert_eq!(entries[1].size, 1000);
    }

    #[test]
    fn test_empty_archive_is_bare_eocd() {
        let data = ZipWriter::new(Vec::new()).finish().unwrap();
        assert_eq!(data.len(), 22);
        assert!(reader::parse(&data).is_empty());
    }

    #[test]
    fn test_estimate_matches_actual_size() {
        let files = [("a.txt", 11u64), ("dir/b.bin", 1000u64)];
        let estimate = estimate_archive_size(files.iter().map(|(n, s)| (*n, *s)));

        let mut writer = ZipWriter::new(Vec::new());
        for (name, size) in files {
            writer.begin_entry(name).unwrap();
            writer.write_chunk(&vec![7u8; size as usize]).unwrap();
            writer.end_entry().unwrap();
        }
        let data = writer.finish().unwrap();
        assert_eq!(data.len() as u64, estimate);
    }

    #[test]
    fn test_nested_begin_rejected() {
        let mut writer = ZipWriter::new(Vec::new());
        writer.begin_entry("a").unwrap();
        assert!(writer.begin_entry("b").is_err());
    }

    #[test]
    fn test_finish_with_open_entry_rejected() {
        let mut writer = ZipWriter::new(Vec::new());
        writer.begin_entry("a").unwrap();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_write_without_entry_rejected() {
        let mut writer = ZipWriter::new(Vec::new());
        assert!(writer.write_chunk(b"x").is_err());
        assert!(writer.end_entry().is_err());
    }

    #[test]
    fn test_entry_over_4gib_rejected() {
        let mut writer = ZipWriter::new(std::io::sink());
        writer.begin_entry("big.bin").unwrap();
        // Fake the accumulated size; actually writing 4 GiB is pointless.
        writer.current.as_mut().unwrap().size = u64::from(u32::MAX) + 1;
        assert!(matches!(
            writer.end_entry(),
            Err(Error::InvalidInput(msg)) if msg.contains("4 GiB")
        ));
    }

    #[test]
    fn test_directory_offset_over_4gib_rejected() {
        let mut writer = ZipWriter::new(std::io::sink());
        writer.begin_entry("a.txt").unwrap();
        writer.write_chunk(b"x").unwrap();
        writer.end_entry().unwrap();
        writer.offset = u64::from(u32::MAX) + 1;
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_too_many_entries_rejected() {
        let mut writer = ZipWriter::new(std::io::sink());
        for i in 0..=u16::MAX as u32 + 1 {
            writer.entries.push(EntryRecord {
                name: i.to_string(),
                crc: 0,
                size: 0,
                header_offset: 0,
                time: 0,
                date: 0,
            });
        }
        assert!(writer.finish().is_err());
    }
}
