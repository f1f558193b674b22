use thiserror::Error;
use num_derive::FromPrimitive;

/// bytes of data in one page
pub const PAGESZ: usize = 512;
/// bytes reserved for a filename, including length byte and closing dot
pub const FNLEN: usize = 40;
/// a page whose label carries this in all three fid fields is free
pub const FID_FREE: u16 = 0xffff;
/// `fid_file` value of any page belonging to a regular file
pub const FID_REGULAR: u16 = 1;
/// `fid_dir` value of any page belonging to the directory
pub const FID_DIRECTORY: u16 = 0x8000;
/// offset to the Unix epoch; addition relies on 32-bit wrap-around
pub const ALTOTIME_MAGIC: u32 = 0x7e368ad0;
/// words in the leader page property area
pub const LEADER_PROP_WORDS: usize = 210;
/// word offset of the property area within the leader page
pub const LEADER_PROP_BEGIN: u8 = 26;
/// bytes in the fixed descriptor header
pub const KDH_BYTES: usize = 32;
/// name of the directory file; every volume has exactly one
pub const SYSDIR: &str = "SysDir";
/// name of the file holding the descriptor header and the bit table
pub const DISK_DESCRIPTOR: &str = "DiskDescriptor";

/// Enumerates file system errors.  The `Display` trait will print the equivalent long message.
#[derive(Error,Debug)]
pub enum Error {
    #[error("file not found")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no space left on volume")]
    NoSpace,
    #[error("i/o error")]
    IoError,
    #[error("file system is corrupt")]
    Corrupt
}

/// Directory entry types, stored in the high byte of the entry's first word.
#[derive(FromPrimitive,PartialEq,Clone,Copy)]
pub enum EntryType {
    Deleted = 0,
    Allocated = 4
}

/// The 8-word trailer of every page.  `next_rda`/`prev_rda` chain the
/// pages of one file; the three fid words identify the file and read
/// 0xffff,0xffff,0xffff on a free page.
#[derive(Clone,Copy,Default,Debug,PartialEq)]
pub struct Label {
    pub next_rda: u16,
    pub prev_rda: u16,
    pub blank: u16,
    pub nbytes: u16,
    pub filepage: u16,
    pub fid_file: u16,
    pub fid_dir: u16,
    pub fid_id: u16
}

impl Label {
    pub fn from_words(w: &[u16]) -> Self {
        Self {
            next_rda: w[0],
            prev_rda: w[1],
            blank: w[2],
            nbytes: w[3],
            filepage: w[4],
            fid_file: w[5],
            fid_dir: w[6],
            fid_id: w[7]
        }
    }
    pub fn to_words(&self) -> [u16;8] {
        [self.next_rda, self.prev_rda, self.blank, self.nbytes,
            self.filepage, self.fid_file, self.fid_dir, self.fid_id]
    }
    /// a page is free when all three fid words carry the sentinel
    pub fn is_free(&self) -> bool {
        self.fid_file == FID_FREE && self.fid_dir == FID_FREE && self.fid_id == FID_FREE
    }
}

/// 5-word pointer to a file: identity triple plus the leader page VDA.
/// Appears in directory entries and in the leader's directory hint.
#[derive(Clone,Copy,Default,Debug,PartialEq)]
pub struct FilePointer {
    pub fid_dir: u16,
    pub serialno: u16,
    pub version: u16,
    pub blank: u16,
    pub leader_vda: u16
}

impl FilePointer {
    pub fn from_words(w: &[u16]) -> Self {
        Self {
            fid_dir: w[0],
            serialno: w[1],
            version: w[2],
            blank: w[3],
            leader_vda: w[4]
        }
    }
    pub fn to_words(&self) -> [u16;5] {
        [self.fid_dir, self.serialno, self.version, self.blank, self.leader_vda]
    }
}

/// 3-word position within a file: page, page number within the file,
/// character position within the page.
#[derive(Clone,Copy,Default,Debug,PartialEq)]
pub struct FileAddress {
    pub vda: u16,
    pub filepage: u16,
    pub char_pos: u16
}

impl FileAddress {
    pub fn from_words(w: &[u16]) -> Self {
        Self {
            vda: w[0],
            filepage: w[1],
            char_pos: w[2]
        }
    }
    pub fn to_words(&self) -> [u16;3] {
        [self.vda, self.filepage, self.char_pos]
    }
}

/// The leader page occupies the full data area of a file's first page and
/// carries the file's metadata: the time triplet, the filename, the
/// property area, and the two hints.
#[derive(Clone)]
pub struct Leader {
    pub created: [u16;2],
    pub written: [u16;2],
    pub read: [u16;2],
    pub filename: [u8;FNLEN],
    pub leader_props: [u16;LEADER_PROP_WORDS],
    pub spare: [u16;10],
    pub proplength: u8,
    pub propbegin: u8,
    pub change_sn: u8,
    pub consecutive: u8,
    pub dir_fp_hint: FilePointer,
    pub last_page_hint: FileAddress
}

impl Leader {
    pub fn new() -> Self {
        Self {
            created: [0;2],
            written: [0;2],
            read: [0;2],
            filename: [0;FNLEN],
            leader_props: [0;LEADER_PROP_WORDS],
            spare: [0;10],
            proplength: 0,
            propbegin: 0,
            change_sn: 0,
            consecutive: 0,
            dir_fp_hint: FilePointer::default(),
            last_page_hint: FileAddress::default()
        }
    }
    /// Decode a leader page from the 256 data words of its page.
    pub fn from_words(w: &[u16]) -> Self {
        let mut filename = [0u8;FNLEN];
        for i in 0..FNLEN {
            let word = w[6 + i/2];
            filename[i] = match i & 1 {
                0 => (word >> 8) as u8,
                _ => (word & 0xff) as u8
            };
        }
        let mut leader_props = [0u16;LEADER_PROP_WORDS];
        leader_props.copy_from_slice(&w[26..236]);
        let mut spare = [0u16;10];
        spare.copy_from_slice(&w[236..246]);
        Self {
            created: [w[0], w[1]],
            written: [w[2], w[3]],
            read: [w[4], w[5]],
            filename,
            leader_props,
            spare,
            proplength: (w[246] >> 8) as u8,
            propbegin: (w[246] & 0xff) as u8,
            change_sn: (w[247] >> 8) as u8,
            consecutive: (w[247] & 0xff) as u8,
            dir_fp_hint: FilePointer::from_words(&w[248..253]),
            last_page_hint: FileAddress::from_words(&w[253..256])
        }
    }
    /// Encode the leader back into 256 data words.
    pub fn to_words(&self) -> [u16;256] {
        let mut w = [0u16;256];
        w[0] = self.created[0];
        w[1] = self.created[1];
        w[2] = self.written[0];
        w[3] = self.written[1];
        w[4] = self.read[0];
        w[5] = self.read[1];
        for i in 0..FNLEN/2 {
            w[6 + i] = ((self.filename[2*i] as u16) << 8) | self.filename[2*i + 1] as u16;
        }
        w[26..236].copy_from_slice(&self.leader_props);
        w[236..246].copy_from_slice(&self.spare);
        w[246] = ((self.proplength as u16) << 8) | self.propbegin as u16;
        w[247] = ((self.change_sn as u16) << 8) | self.consecutive as u16;
        w[248..253].copy_from_slice(&self.dir_fp_hint.to_words());
        w[253..256].copy_from_slice(&self.last_page_hint.to_words());
        w
    }
}

/// Fixed header at the start of DiskDescriptor's first data page; the bit
/// table of `disk_bt_size` words follows it immediately.
#[derive(Clone,Copy,Default,Debug)]
pub struct DescriptorHeader {
    pub n_disks: u16,
    pub n_tracks: u16,
    pub n_heads: u16,
    pub n_sectors: u16,
    pub last_sn: [u16;2],
    pub blank: u16,
    pub disk_bt_size: u16,
    pub def_versions_kept: u16,
    pub free_pages: u16,
    pub spare: [u16;6]
}

impl DescriptorHeader {
    pub fn from_bytes(dat: &[u8]) -> Self {
        let w = crate::img::words_from_bytes(&dat[0..KDH_BYTES]);
        let mut spare = [0u16;6];
        spare.copy_from_slice(&w[10..16]);
        Self {
            n_disks: w[0],
            n_tracks: w[1],
            n_heads: w[2],
            n_sectors: w[3],
            last_sn: [w[4], w[5]],
            blank: w[6],
            disk_bt_size: w[7],
            def_versions_kept: w[8],
            free_pages: w[9],
            spare
        }
    }
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = vec![
            self.n_disks, self.n_tracks, self.n_heads, self.n_sectors,
            self.last_sn[0], self.last_sn[1], self.blank,
            self.disk_bt_size, self.def_versions_kept, self.free_pages
        ];
        w.extend_from_slice(&self.spare);
        crate::img::bytes_from_words(&w)
    }
    /// full 32-bit file serial counter
    pub fn serial(&self) -> u32 {
        ((self.last_sn[0] as u32) << 16) | self.last_sn[1] as u32
    }
    pub fn set_serial(&mut self, sn: u32) {
        self.last_sn = [(sn >> 16) as u16, (sn & 0xffff) as u16];
    }
}

/// Decode an Alto date/time pair into seconds since the Unix epoch.
/// The all-ones pair is a sentinel inherited from the format and maps to 1.
pub fn altotime_to_unix(t: [u16;2]) -> i64 {
    let raw = ((t[0] as u32) << 16) | t[1] as u32;
    match raw {
        u32::MAX => 1,
        _ => raw.wrapping_add(ALTOTIME_MAGIC) as i64
    }
}

/// Encode seconds since the Unix epoch as an Alto date/time pair.
pub fn unix_to_altotime(secs: i64) -> [u16;2] {
    let v = (secs as u32).wrapping_sub(ALTOTIME_MAGIC);
    [(v >> 16) as u16, (v & 0xffff) as u16]
}

/// Render an Alto date/time pair for display.
pub fn altotime_to_string(t: [u16;2]) -> String {
    match chrono::NaiveDateTime::from_timestamp_opt(altotime_to_unix(t), 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::from("<no date>")
    }
}

/// Copy an Alto file system filename into a host string.  The first byte
/// holds the length including the closing dot, which is removed here.
/// Non-printing characters come out as `#`.
pub fn filename_to_string(fname: &[u8]) -> String {
    let mut length = fname[0] as usize;
    if length == 0 {
        return String::new();
    }
    if length >= FNLEN {
        length = FNLEN - 1;
    }
    let mut ans = String::with_capacity(length);
    for i in 1..length {
        let c = fname[i];
        ans.push(match c {
            0x20..=0x7e => c as char,
            _ => '#'
        });
    }
    ans
}

/// Copy a host string into an Alto file system filename, appending the
/// closing dot and the leading length byte.  Over-long names are clipped.
pub fn string_to_filename(s: &str) -> [u8;FNLEN] {
    let mut ans = [0u8;FNLEN];
    let src = s.as_bytes();
    let mut length = src.len() + 1;
    if length >= FNLEN - 2 {
        length = FNLEN - 2;
    }
    ans[0] = length as u8;
    for i in 0..length-1 {
        ans[i+1] = src[i];
    }
    ans[length] = b'.';
    ans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_roundtrip() {
        let t = unix_to_altotime(1_000_000_000);
        assert_eq!(altotime_to_unix(t), 1_000_000_000);
    }

    #[test]
    fn time_sentinel() {
        assert_eq!(altotime_to_unix([0xffff, 0xffff]), 1);
    }

    #[test]
    fn filename_codec() {
        let packed = string_to_filename("FOO.TXT");
        assert_eq!(packed[0], 8);
        assert_eq!(&packed[1..9], "FOO.TXT.".as_bytes());
        assert_eq!(filename_to_string(&packed), "FOO.TXT");
    }

    #[test]
    fn filename_nonprinting() {
        let mut packed = string_to_filename("AB");
        packed[2] = 0x07;
        assert_eq!(filename_to_string(&packed), "A#");
    }

    #[test]
    fn leader_roundtrip() {
        let mut lp = Leader::new();
        lp.created = unix_to_altotime(86400);
        lp.filename = string_to_filename("SysDir");
        lp.propbegin = LEADER_PROP_BEGIN;
        lp.proplength = LEADER_PROP_WORDS as u8;
        lp.dir_fp_hint = FilePointer { fid_dir: FID_DIRECTORY, serialno: 2, version: 1, blank: 0, leader_vda: 1 };
        lp.last_page_hint = FileAddress { vda: 2, filepage: 1, char_pos: 0 };
        let copy = Leader::from_words(&lp.to_words());
        assert_eq!(copy.created, lp.created);
        assert_eq!(copy.filename, lp.filename);
        assert_eq!(copy.propbegin, lp.propbegin);
        assert_eq!(copy.proplength, lp.proplength);
        assert_eq!(copy.dir_fp_hint, lp.dir_fp_hint);
        assert_eq!(copy.last_page_hint, lp.last_page_hint);
    }

    #[test]
    fn descriptor_roundtrip() {
        let mut kdh = DescriptorHeader::default();
        kdh.n_disks = 1;
        kdh.n_tracks = 203;
        kdh.n_heads = 2;
        kdh.n_sectors = 12;
        kdh.set_serial(0x10005);
        kdh.disk_bt_size = 305;
        kdh.free_pages = 4866;
        let bytes = kdh.to_bytes();
        assert_eq!(bytes.len(), KDH_BYTES);
        let copy = DescriptorHeader::from_bytes(&bytes);
        assert_eq!(copy.serial(), 0x10005);
        assert_eq!(copy.free_pages, 4866);
        assert_eq!(copy.disk_bt_size, 305);
    }
}
