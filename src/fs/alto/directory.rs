//! SysDir is an ordinary file whose contents are a packed sequence of
//! variable length entries, each tying a filename to the file's leader
//! page.  This module holds the entry structure, the (de)serializer for
//! the packed byte stream, and the pure lookups over the in-memory entry
//! vector.  Mutations and the write-back path live with the disk object.

use log::{debug,warn};
use num_traits::FromPrimitive;
use super::types::*;

/// bytes of an entry ahead of the filename: the type/length word plus the file pointer
pub const ENTRY_FIXED_BYTES: usize = 12;

/// One directory entry.  Deleted entries stay in place with their type
/// set to `Deleted`; iteration ends at the first zero-length filename.
#[derive(Clone)]
pub struct DirEntry {
    pub etype: u8,
    /// record length in words, name padding included
    pub length: u8,
    pub fileptr: FilePointer,
    pub filename: [u8;FNLEN]
}

impl DirEntry {
    pub fn new(name: &str, fileptr: FilePointer) -> Self {
        let filename = string_to_filename(name);
        let fnlen = filename[0] as usize;
        Self {
            etype: EntryType::Allocated as u8,
            length: ((ENTRY_FIXED_BYTES + (fnlen | 1) + 1) / 2) as u8,
            fileptr,
            filename
        }
    }
    pub fn name(&self) -> String {
        filename_to_string(&self.filename)
    }
    pub fn is_allocated(&self) -> bool {
        EntryType::from_u8(self.etype) == Some(EntryType::Allocated)
    }
    /// bytes this entry occupies in the packed stream; the filename is
    /// stored with its length byte and padded to a word boundary
    pub fn record_size(&self) -> usize {
        let fnlen = self.filename[0] as usize;
        ENTRY_FIXED_BYTES + (fnlen | 1) + 1
    }
}

/// Scan the packed directory stream into entries.  The scan stops at the
/// first zero-length filename, or at anything structurally impossible.
pub fn parse(buf: &[u8]) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + ENTRY_FIXED_BYTES < buf.len() {
        let word0 = u16::from_be_bytes([buf[offset], buf[offset+1]]);
        let etype = (word0 >> 8) as u8;
        let length = (word0 & 0xff) as u8;
        let fnlen = buf[offset + ENTRY_FIXED_BYTES] as usize;
        if fnlen == 0 || fnlen > FNLEN {
            break;
        }
        let fp_words = crate::img::words_from_bytes(&buf[offset+2..offset+ENTRY_FIXED_BYTES]);
        let mut filename = [0u8;FNLEN];
        let name_bytes = std::cmp::min(FNLEN, buf.len() - offset - ENTRY_FIXED_BYTES);
        filename[0..name_bytes].copy_from_slice(&buf[offset+ENTRY_FIXED_BYTES..offset+ENTRY_FIXED_BYTES+name_bytes]);
        let entry = DirEntry {
            etype,
            length,
            fileptr: FilePointer::from_words(&fp_words),
            filename
        };
        debug!("entry at {}: type {} leader {} '{}'", offset, etype, entry.fileptr.leader_vda, entry.name());
        offset += entry.record_size();
        entries.push(entry);
    }
    entries
}

/// Pack the entries back into the directory stream, one after another,
/// each padded to a word boundary, with a zero terminator word at the end.
pub fn serialize(entries: &[DirEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for entry in entries {
        let word0 = ((entry.etype as u16) << 8) | entry.length as u16;
        buf.extend_from_slice(&u16::to_be_bytes(word0));
        buf.append(&mut crate::img::bytes_from_words(&entry.fileptr.to_words()));
        let nsize = entry.record_size() - ENTRY_FIXED_BYTES;
        if nsize > FNLEN {
            warn!("entry '{}' has an oversized name, clipping", entry.name());
        }
        buf.extend_from_slice(&entry.filename[0..std::cmp::min(nsize, FNLEN)]);
    }
    buf.extend_from_slice(&[0, 0]);
    buf
}

/// Find the allocated entry carrying `name`.
pub fn find(entries: &[DirEntry], name: &str) -> Option<usize> {
    for (idx, entry) in entries.iter().enumerate() {
        if entry.is_allocated() && entry.name() == name {
            return Some(idx);
        }
    }
    None
}

/// Where a new entry for `name` belongs.  Returns the index and whether a
/// deleted entry with the identical name sits there to be reused.
pub fn insert_position(entries: &[DirEntry], name: &str) -> (usize, bool) {
    for (idx, entry) in entries.iter().enumerate() {
        let fname = entry.name();
        if fname == name && !entry.is_allocated() {
            return (idx, true);
        }
        if fname.as_str() > name {
            return (idx, false);
        }
    }
    (entries.len(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, leader_vda: u16, serialno: u16) -> DirEntry {
        DirEntry::new(name, FilePointer {
            fid_dir: 0,
            serialno,
            version: 1,
            blank: 0,
            leader_vda
        })
    }

    #[test]
    fn record_sizes_are_word_aligned() {
        // "FOO.TXT." is 8 name bytes plus the length byte, padded to 10
        assert_eq!(sample("FOO.TXT", 10, 1).record_size(), 22);
        // even-length names gain a padding byte
        assert_eq!(sample("AB", 10, 1).record_size(), 16);
        assert_eq!(sample("DiskDescriptor", 10, 1).record_size(), 28);
    }

    #[test]
    fn stream_roundtrip() {
        let entries = vec![
            sample("DiskDescriptor", 3, 3),
            sample("SysDir", 1, 2),
        ];
        let buf = serialize(&entries);
        let copy = parse(&buf);
        assert_eq!(copy.len(), 2);
        assert_eq!(copy[0].name(), "DiskDescriptor");
        assert_eq!(copy[1].name(), "SysDir");
        assert_eq!(copy[0].fileptr.leader_vda, 3);
        assert_eq!(copy[1].fileptr.leader_vda, 1);
        assert!(copy[0].is_allocated());
    }

    #[test]
    fn parse_stops_at_terminator() {
        let mut buf = serialize(&vec![sample("A", 5, 9)]);
        // stale bytes past the terminator must not turn into entries
        buf.extend_from_slice(&[4, 10, 0, 0, 0, 7, 0, 1, 0, 0, 0, 5, 2, 0x41, 0x2e, 0]);
        let copy = parse(&buf);
        assert_eq!(copy.len(), 1);
        assert_eq!(copy[0].name(), "A");
    }

    #[test]
    fn deleted_entry_reuse() {
        let mut entries = vec![
            sample("APPLE", 5, 1),
            sample("PEAR", 6, 2),
        ];
        entries[0].etype = EntryType::Deleted as u8;
        assert_eq!(find(&entries, "APPLE"), None);
        assert_eq!(find(&entries, "PEAR"), Some(1));
        assert_eq!(insert_position(&entries, "APPLE"), (0, true));
        assert_eq!(insert_position(&entries, "BANANA"), (1, false));
        assert_eq!(insert_position(&entries, "ZEBRA"), (2, false));
    }
}
