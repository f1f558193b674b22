//! # Disk Image Module
//!
//! This module owns the raw storage for the file system module: one or two
//! Diablo disk packs held in memory as an array of 16-bit words.  The file
//! system layer never touches bytes directly; it goes through the word and
//! byte accessors defined here, so the Alto's byte order is decided in
//! exactly one place.
//!
//! ## Pages and addresses
//!
//! A disk page is 266 words: a 2-word header identifying the physical
//! sector, an 8-word label carrying the file chain bookkeeping, and 256
//! words (512 bytes) of data.  Pages are referred to by *virtual disk
//! address* (VDA), a zero-based index covering one or two drives.  On disk
//! every link is a *raw disk address* (RDA) packing drive, head, cylinder
//! and sector bits; `rda_to_vda` and `vda_to_rda` are exact inverses.
//!
//! ## Byte order
//!
//! Words are stored big-endian in the image file.  Within a word the high
//! byte comes first in the Alto's byte stream, so byte `i` of a page's
//! data lives in the high half of word `i/2` when `i` is even and the low
//! half when it is odd.

use std::process::Command;
use log::{debug,info,error};
use crate::{DYNERR,STDRESULT};

/// cylinders on a Diablo pack
pub const NCYLS: usize = 203;
/// heads on a Diablo pack
pub const NHEADS: usize = 2;
/// sectors per track
pub const NSECS: usize = 12;
/// pages on one drive
pub const NPAGES: usize = NCYLS * NHEADS * NSECS;

pub const PAGE_HEADER_WORDS: usize = 2;
pub const PAGE_LABEL_WORDS: usize = 8;
pub const PAGE_DATA_WORDS: usize = 256;
/// words in a full page record (header + label + data)
pub const PAGE_WORDS: usize = PAGE_HEADER_WORDS + PAGE_LABEL_WORDS + PAGE_DATA_WORDS;
/// bytes in one drive's image file
pub const DRIVE_BYTES: usize = NPAGES * PAGE_WORDS * 2;

/// Enumerates image layer errors.  The `Display` trait will print the equivalent long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("image size did not match the Diablo geometry")]
    ImageSizeMismatch,
    #[error("could not run the external decompressor")]
    DecompressionFailed,
    #[error("too many images for a dual drive system")]
    TooManyDrives
}

/// Convert a raw disk address to a virtual disk address.
/// The RDA packs drive, head, cylinder and sector bit fields.
pub fn rda_to_vda(rda: u16) -> usize {
    let dp1flag = ((rda >> 1) & 1) as usize;
    let head = ((rda >> 2) & 1) as usize;
    let cylinder = ((rda >> 3) & 0x1ff) as usize;
    let sector = ((rda >> 12) & 0xf) as usize;
    dp1flag * NPAGES + cylinder * NHEADS * NSECS + head * NSECS + sector
}

/// Convert a virtual disk address to a raw disk address.
pub fn vda_to_rda(vda: usize) -> u16 {
    let page = vda % NPAGES;
    let dp1flag: u16 = if vda == page { 0 } else { 1 };
    let cylinder = ((page / (NHEADS * NSECS)) & 0x1ff) as u16;
    let head = ((page / NSECS) & 1) as u16;
    let sector = (page % NSECS) as u16;
    (dp1flag << 1) | (head << 2) | (cylinder << 3) | (sector << 12)
}

/// Decode a big-endian byte stream into words.  Panics on odd length.
pub fn words_from_bytes(buf: &[u8]) -> Vec<u16> {
    assert!(buf.len() % 2 == 0, "byte stream has odd length {}", buf.len());
    buf.chunks_exact(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]])).collect()
}

/// Encode words into a big-endian byte stream.
pub fn bytes_from_words(words: &[u16]) -> Vec<u8> {
    let mut ans = Vec::with_capacity(words.len() * 2);
    for w in words {
        ans.extend_from_slice(&u16::to_be_bytes(*w));
    }
    ans
}

/// Swap the two bytes of every word in the buffer.  Panics on odd length.
pub fn swab(buf: &mut [u8]) {
    assert!(buf.len() % 2 == 0, "byte stream has odd length {}", buf.len());
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

fn backup_path(name: &str) -> String {
    // saves are always uncompressed, so the .Z suffix is dropped
    let stem = match name.strip_suffix(".Z") {
        Some(s) => s,
        None => name
    };
    [stem, "~"].concat()
}

/// In-memory image of one or two Diablo packs.  A dual drive system is
/// given as two paths separated by a comma, and its pages are addressed
/// as one flat space of `2*NPAGES` VDAs.
pub struct DiabloImage {
    words: Vec<u16>,
    drives: usize,
    paths: Vec<String>
}

impl DiabloImage {
    /// Create a zero-filled image with no backing files.
    pub fn blank(drives: usize) -> Self {
        assert!(drives == 1 || drives == 2, "a system has one or two drives");
        Self {
            words: vec![0; drives * NPAGES * PAGE_WORDS],
            drives,
            paths: Vec::new()
        }
    }
    /// Interpret a byte stream as one or two drives worth of pages.
    pub fn from_bytes(dat: &[u8]) -> Result<Self,Error> {
        let drives = match dat.len() {
            l if l == DRIVE_BYTES => 1,
            l if l == 2 * DRIVE_BYTES => 2,
            l => {
                info!("image size was {}", l);
                return Err(Error::ImageSizeMismatch);
            }
        };
        Ok(Self {
            words: words_from_bytes(dat),
            drives,
            paths: Vec::new()
        })
    }
    /// Load the image file(s), two paths separated by a comma for a dual
    /// drive system.  A path ending in `.Z` is piped through `zcat`.
    /// Size mismatches and short reads are fatal.
    pub fn open(name: &str) -> Result<Self,DYNERR> {
        let paths: Vec<String> = name.split(',').map(|s| s.to_string()).collect();
        if paths.len() > 2 {
            return Err(Box::new(Error::TooManyDrives));
        }
        let mut words: Vec<u16> = Vec::with_capacity(paths.len() * NPAGES * PAGE_WORDS);
        for path in &paths {
            info!("reading disk image '{}'", path);
            let dat = match path.ends_with(".Z") {
                true => {
                    let output = Command::new("zcat").arg(path).output()?;
                    if !output.status.success() {
                        error!("zcat failed on '{}'", path);
                        return Err(Box::new(Error::DecompressionFailed));
                    }
                    output.stdout
                },
                false => std::fs::read(path)?
            };
            if dat.len() != DRIVE_BYTES {
                error!("'{}' is {} bytes, expected {}", path, dat.len(), DRIVE_BYTES);
                return Err(Box::new(Error::ImageSizeMismatch));
            }
            words.append(&mut words_from_bytes(&dat));
        }
        Ok(Self {
            words,
            drives: paths.len(),
            paths
        })
    }
    /// Save every drive to its backup path (`<original>~`, with any `.Z`
    /// suffix stripped).  The original files are never overwritten.
    pub fn save(&self) -> STDRESULT {
        for drive in 0..self.drives {
            let path = match self.paths.get(drive) {
                Some(p) => backup_path(p),
                None => {
                    log::warn!("drive {} has no backing file, not saved", drive);
                    continue;
                }
            };
            info!("writing disk image '{}'", path);
            std::fs::write(&path, self.drive_bytes(drive))?;
        }
        Ok(())
    }
    pub fn drives(&self) -> usize {
        self.drives
    }
    pub fn page_count(&self) -> usize {
        self.drives * NPAGES
    }
    /// Byte stream of one drive, as it would be stored in an image file.
    pub fn drive_bytes(&self, drive: usize) -> Vec<u8> {
        let beg = drive * NPAGES * PAGE_WORDS;
        bytes_from_words(&self.words[beg..beg + NPAGES * PAGE_WORDS])
    }
    /// Byte stream of the whole system (drive 0 then drive 1).
    pub fn to_bytes(&self) -> Vec<u8> {
        bytes_from_words(&self.words)
    }
    fn base(&self, vda: usize) -> usize {
        assert!(vda < self.page_count(), "page {} is outside the disk", vda);
        vda * PAGE_WORDS
    }
    pub fn header_words(&self, vda: usize) -> [u16;2] {
        let base = self.base(vda);
        [self.words[base], self.words[base+1]]
    }
    pub fn set_header_words(&mut self, vda: usize, header: &[u16;2]) {
        let base = self.base(vda);
        self.words[base..base+2].copy_from_slice(header);
    }
    pub fn label_words(&self, vda: usize) -> [u16;PAGE_LABEL_WORDS] {
        let beg = self.base(vda) + PAGE_HEADER_WORDS;
        let mut ans = [0; PAGE_LABEL_WORDS];
        ans.copy_from_slice(&self.words[beg..beg+PAGE_LABEL_WORDS]);
        ans
    }
    pub fn set_label_words(&mut self, vda: usize, label: &[u16;PAGE_LABEL_WORDS]) {
        let beg = self.base(vda) + PAGE_HEADER_WORDS;
        self.words[beg..beg+PAGE_LABEL_WORDS].copy_from_slice(label);
    }
    pub fn data_words(&self, vda: usize) -> &[u16] {
        let beg = self.base(vda) + PAGE_HEADER_WORDS + PAGE_LABEL_WORDS;
        &self.words[beg..beg+PAGE_DATA_WORDS]
    }
    pub fn set_data_words(&mut self, vda: usize, data: &[u16]) {
        assert!(data.len() == PAGE_DATA_WORDS, "page data must be {} words", PAGE_DATA_WORDS);
        let beg = self.base(vda) + PAGE_HEADER_WORDS + PAGE_LABEL_WORDS;
        self.words[beg..beg+PAGE_DATA_WORDS].copy_from_slice(data);
    }
    pub fn data_word(&self, vda: usize, idx: usize) -> u16 {
        assert!(idx < PAGE_DATA_WORDS, "word {} is outside the page", idx);
        self.words[self.base(vda) + PAGE_HEADER_WORDS + PAGE_LABEL_WORDS + idx]
    }
    pub fn set_data_word(&mut self, vda: usize, idx: usize, word: u16) {
        assert!(idx < PAGE_DATA_WORDS, "word {} is outside the page", idx);
        let beg = self.base(vda) + PAGE_HEADER_WORDS + PAGE_LABEL_WORDS;
        self.words[beg + idx] = word;
    }
    /// Read `buf.len()` bytes of the page's data area starting at byte
    /// `offset`, in the Alto's byte order.
    pub fn read_data(&self, vda: usize, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= 2 * PAGE_DATA_WORDS, "byte read runs off the page");
        let beg = self.base(vda) + PAGE_HEADER_WORDS + PAGE_LABEL_WORDS;
        for (i, b) in buf.iter_mut().enumerate() {
            let pos = offset + i;
            let w = self.words[beg + (pos >> 1)];
            *b = match pos & 1 {
                0 => (w >> 8) as u8,
                _ => (w & 0xff) as u8
            };
        }
    }
    /// Write bytes into the page's data area starting at byte `offset`,
    /// in the Alto's byte order.  Bytes outside the range are unaffected.
    pub fn write_data(&mut self, vda: usize, offset: usize, dat: &[u8]) {
        assert!(offset + dat.len() <= 2 * PAGE_DATA_WORDS, "byte write runs off the page");
        let beg = self.base(vda) + PAGE_HEADER_WORDS + PAGE_LABEL_WORDS;
        for (i, b) in dat.iter().enumerate() {
            let pos = offset + i;
            let w = &mut self.words[beg + (pos >> 1)];
            *w = match pos & 1 {
                0 => (*w & 0x00ff) | ((*b as u16) << 8),
                _ => (*w & 0xff00) | (*b as u16)
            };
        }
    }
    pub fn zero_data(&mut self, vda: usize) {
        let beg = self.base(vda) + PAGE_HEADER_WORDS + PAGE_LABEL_WORDS;
        for w in &mut self.words[beg..beg+PAGE_DATA_WORDS] {
            *w = 0;
        }
    }
    /// Make sure every page header refers to the page itself.
    pub fn verify_headers(&self) -> bool {
        let mut ok = true;
        for vda in 0..self.page_count() {
            let header = self.header_words(vda);
            if rda_to_vda(header[1]) != vda {
                debug!("page {} header {:04x} {:04x} does not match", vda, header[0], header[1]);
                ok = false;
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrip() {
        // the translators must be exact inverses over both drives
        for vda in 0..2*NPAGES {
            assert_eq!(rda_to_vda(vda_to_rda(vda)), vda, "vda {}", vda);
        }
    }

    #[test]
    fn address_fields() {
        assert_eq!(vda_to_rda(0), 0);
        // drive 1 sets the dp1 flag
        assert_eq!(vda_to_rda(NPAGES) & 2, 2);
        // sector lives in the high nibble
        assert_eq!(vda_to_rda(5), 5 << 12);
        // one full track advances the head bit
        assert_eq!(vda_to_rda(NSECS), 1 << 2);
    }

    #[test]
    fn word_codec() {
        let bytes: Vec<u8> = vec![0x12, 0x34, 0xab, 0xcd];
        let words = words_from_bytes(&bytes);
        assert_eq!(words, vec![0x1234, 0xabcd]);
        assert_eq!(bytes_from_words(&words), bytes);
        let mut swapped = bytes.clone();
        swab(&mut swapped);
        assert_eq!(swapped, vec![0x34, 0x12, 0xcd, 0xab]);
    }

    #[test]
    fn byte_order_within_words() {
        let mut img = DiabloImage::blank(1);
        img.write_data(7, 0, "AB".as_bytes());
        // high byte of the first data word is the first byte of the stream
        assert_eq!(img.data_word(7, 0), 0x4142);
        let mut buf = [0u8; 1];
        img.read_data(7, 1, &mut buf);
        assert_eq!(buf[0], 0x42);
        // odd offsets touch only the low half of the word
        img.write_data(7, 1, "C".as_bytes());
        assert_eq!(img.data_word(7, 0), 0x4143);
    }
}
