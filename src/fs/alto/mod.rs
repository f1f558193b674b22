//! # Alto file system module
//!
//! This manipulates disk images containing the file system of a Xerox
//! Alto: a flat namespace of files, each a doubly linked chain of pages,
//! with a single directory file (`SysDir`) and a free page bit table kept
//! in a second well-known file (`DiskDescriptor`).
//!
//! The `Disk` object owns the image and keeps three redundant structures
//! in step: the page labels (authoritative for chains), the bit table,
//! and the directory.  When they are found disagreeing at mount time the
//! scavenger reconciles them from the labels.
//!
//! All operations work on the in-memory image; nothing reaches the host
//! file system until `flush`, which always writes to a backup path.

pub mod types;
pub mod directory;
mod scavenger;

use std::cmp::min;
use log::{debug,info,warn,error};
use crate::img::{DiabloImage,rda_to_vda,vda_to_rda};
use crate::fs::{FileInfo,Statfs};
use crate::{DYNERR,STDRESULT};
use types::*;
use directory::DirEntry;

/// Strip the root from a path; the namespace has no other directories.
fn file_name(path: &str) -> &str {
    match path.strip_prefix('/') {
        Some(s) => s,
        None => path
    }
}

/// The primary interface for disk operations.
pub struct Disk {
    img: DiabloImage,
    kdh: DescriptorHeader,
    bit_table: Vec<u16>,
    bit_count: usize,
    descriptor_dirty: bool,
    entries: Vec<DirEntry>,
    sysdir_dirty: bool,
    files: Vec<FileInfo>
}

impl Disk {
    /// Mount the file system found on the given image.  The image is
    /// checked (page headers, descriptor location) and the descriptor is
    /// validated; an inconsistent descriptor is rebuilt before the mount
    /// completes.  The Disk takes ownership of the image.
    pub fn from_img(img: DiabloImage) -> Result<Self,DYNERR> {
        if !img.verify_headers() {
            error!("page headers do not refer to their own pages");
            return Err(Box::new(Error::Corrupt));
        }
        let mut disk = Self {
            img,
            kdh: DescriptorHeader::default(),
            bit_table: Vec::new(),
            bit_count: 0,
            descriptor_dirty: false,
            entries: Vec::new(),
            sysdir_dirty: false,
            files: Vec::new()
        };
        disk.read_disk_descriptor()?;
        if !disk.validate_disk_descriptor() {
            warn!("disk descriptor is inconsistent, running the scavenger");
            disk.fix_disk_descriptor()?;
        }
        disk.make_fileinfo();
        disk.read_sysdir()?;
        info!("mounted volume with {} files, {} free pages", disk.files.len(), disk.kdh.free_pages);
        Ok(disk)
    }

    /// Lay down an empty file system on a blank image and mount it.
    /// Page 0 is the reserved boot page; `SysDir` gets leader page 1 and
    /// one data page, and lists itself and `DiskDescriptor` from the
    /// start; the bit table follows the descriptor header across as many
    /// data pages as it needs.
    pub fn format(mut img: DiabloImage, time: Option<chrono::NaiveDateTime>) -> Result<Self,DYNERR> {
        let page_count = img.page_count();
        let now = match time {
            Some(t) => t.timestamp(),
            None => chrono::Utc::now().timestamp()
        };
        let at = unix_to_altotime(now);
        // free labels and self-referencing headers everywhere
        for page in 0..page_count {
            img.set_header_words(page, &[0, vda_to_rda(page)]);
            let mut l = Label::default();
            l.fid_file = FID_FREE;
            l.fid_dir = FID_FREE;
            l.fid_id = FID_FREE;
            img.set_label_words(page, &l.to_words());
            img.zero_data(page);
        }
        // page 0 is reserved for the bootstrap; it belongs to no chain
        img.set_label_words(0, &Label {
            next_rda: 0, prev_rda: 0, blank: 0,
            nbytes: PAGESZ as u16, filepage: 1,
            fid_file: FID_REGULAR, fid_dir: 0, fid_id: 1
        }.to_words());
        // SysDir: leader page 1, one full data page 2
        img.set_label_words(1, &Label {
            next_rda: vda_to_rda(2), prev_rda: 0, blank: 0,
            nbytes: 0, filepage: 0,
            fid_file: FID_REGULAR, fid_dir: FID_DIRECTORY, fid_id: 2
        }.to_words());
        img.set_label_words(2, &Label {
            next_rda: 0, prev_rda: vda_to_rda(1), blank: 0,
            nbytes: PAGESZ as u16, filepage: 1,
            fid_file: FID_REGULAR, fid_dir: FID_DIRECTORY, fid_id: 2
        }.to_words());
        let mut lp = Leader::new();
        lp.created = at;
        lp.written = at;
        lp.read = at;
        lp.filename = string_to_filename(SYSDIR);
        lp.propbegin = LEADER_PROP_BEGIN;
        lp.proplength = LEADER_PROP_WORDS as u8;
        lp.dir_fp_hint = FilePointer { fid_dir: FID_DIRECTORY, serialno: 2, version: 1, blank: 0, leader_vda: 1 };
        lp.last_page_hint = FileAddress { vda: 2, filepage: 1, char_pos: 0 };
        img.set_data_words(1, &lp.to_words());
        // DiskDescriptor: leader page 3, data pages from 4 on
        let bt_words = (page_count + 15) / 16;
        let content_len = KDH_BYTES + 2 * bt_words;
        let dd_pages = (content_len + PAGESZ - 1) / PAGESZ;
        let last_nbytes = content_len - (dd_pages - 1) * PAGESZ;
        img.set_label_words(3, &Label {
            next_rda: vda_to_rda(4), prev_rda: 0, blank: 0,
            nbytes: 0, filepage: 0,
            fid_file: FID_REGULAR, fid_dir: 0, fid_id: 3
        }.to_words());
        for i in 0..dd_pages {
            let vda = 4 + i;
            img.set_label_words(vda, &Label {
                next_rda: if i + 1 < dd_pages { vda_to_rda(vda + 1) } else { 0 },
                prev_rda: vda_to_rda(vda - 1),
                blank: 0,
                nbytes: if i + 1 < dd_pages { PAGESZ as u16 } else { last_nbytes as u16 },
                filepage: (i + 1) as u16,
                fid_file: FID_REGULAR, fid_dir: 0, fid_id: 3
            }.to_words());
        }
        let mut lp = Leader::new();
        lp.created = at;
        lp.written = at;
        lp.read = at;
        lp.filename = string_to_filename(DISK_DESCRIPTOR);
        lp.propbegin = LEADER_PROP_BEGIN;
        lp.proplength = LEADER_PROP_WORDS as u8;
        lp.dir_fp_hint = FilePointer { fid_dir: FID_DIRECTORY, serialno: 2, version: 1, blank: 0, leader_vda: 1 };
        lp.last_page_hint = FileAddress {
            vda: (4 + dd_pages - 1) as u16,
            filepage: dd_pages as u16,
            char_pos: if last_nbytes != PAGESZ { last_nbytes as u16 } else { 0 }
        };
        img.set_data_words(3, &lp.to_words());
        // descriptor header and bit table
        let used = 4 + dd_pages;
        let mut kdh = DescriptorHeader::default();
        kdh.n_disks = img.drives() as u16;
        kdh.n_tracks = crate::img::NCYLS as u16;
        kdh.n_heads = crate::img::NHEADS as u16;
        kdh.n_sectors = crate::img::NSECS as u16;
        kdh.set_serial(4);
        kdh.disk_bt_size = bt_words as u16;
        kdh.def_versions_kept = 0;
        kdh.free_pages = (page_count - used) as u16;
        let mut bit_table = vec![0u16; bt_words];
        for page in 0..used {
            bit_table[page / 16] |= 1 << (15 - page % 16);
        }
        for bit in page_count..bt_words * 16 {
            bit_table[bit / 16] |= 1 << (15 - bit % 16);
        }
        let mut content = kdh.to_bytes();
        content.append(&mut crate::img::bytes_from_words(&bit_table));
        let mut offset = 0;
        for i in 0..dd_pages {
            let n = min(PAGESZ, content.len() - offset);
            img.write_data(4 + i, 0, &content[offset..offset + n]);
            offset += n;
        }
        // the initial directory lists the two permanent files, in order
        let entries = vec![
            DirEntry::new(DISK_DESCRIPTOR, FilePointer { fid_dir: 0, serialno: 3, version: 1, blank: 0, leader_vda: 3 }),
            DirEntry::new(SYSDIR, FilePointer { fid_dir: FID_DIRECTORY, serialno: 2, version: 1, blank: 0, leader_vda: 1 }),
        ];
        img.write_data(2, 0, &directory::serialize(&entries));
        info!("formatted {} drive volume, {} pages free", img.drives(), page_count - used);
        Self::from_img(img)
    }

    // ---- page level accessors -------------------------------------------

    fn label(&self, vda: usize) -> Label {
        Label::from_words(&self.img.label_words(vda))
    }
    fn set_label(&mut self, vda: usize, l: &Label) {
        self.img.set_label_words(vda, &l.to_words());
    }
    fn leader(&self, vda: usize) -> Leader {
        Leader::from_words(self.img.data_words(vda))
    }
    fn set_leader(&mut self, vda: usize, lp: &Leader) {
        self.img.set_data_words(vda, &lp.to_words());
    }

    // ---- page table -----------------------------------------------------

    /// Bit table value for a page: 1 means allocated.  Page 0 is in the
    /// most significant bit of the first word.
    pub fn bitmap_bit(&self, page: usize) -> u8 {
        if page >= self.bit_count {
            warn!("bit table read out of bounds ({})", page);
            return 1;
        }
        ((self.bit_table[page / 16] >> (15 - page % 16)) & 1) as u8
    }
    fn set_bitmap_bit(&mut self, page: usize, val: u8) {
        if page >= self.bit_count {
            warn!("bit table write out of bounds ({})", page);
            return;
        }
        let offs = page / 16;
        let bit = 15 - page % 16;
        if ((self.bit_table[offs] >> bit) & 1) as u16 != val as u16 {
            self.bit_table[offs] = (self.bit_table[offs] & !(1 << bit)) | (((val & 1) as u16) << bit);
            self.descriptor_dirty = true;
        }
    }
    /// A page is free when its label carries the fid sentinel.
    pub fn is_page_free(&self, page: usize) -> bool {
        self.label(page).is_free()
    }
    pub fn free_pages(&self) -> usize {
        self.kdh.free_pages as usize
    }

    /// Allocate a page near `prev_vda`, scanning alternatingly one after,
    /// one before, two after, two before, and so on.  Pass 0 to start a
    /// new file; the page then becomes a leader with a fresh serial.
    /// Returns None when no free page exists.
    fn alloc_page(&mut self, prev_vda: usize) -> Option<usize> {
        debug!("alloc near page {}", prev_vda);
        if self.kdh.free_pages == 0 {
            info!("no free pages left on the volume");
            return None;
        }
        let maxpage = self.bit_count;
        let mut page = prev_vda;
        let mut dist = 1;
        while dist < maxpage {
            if page + dist < maxpage && self.bitmap_bit(page + dist) == 0 {
                page += dist;
                break;
            }
            if page >= dist && page - dist > 1 && self.bitmap_bit(page - dist) == 0 {
                page -= dist;
                break;
            }
            dist += 1;
        }
        if self.bitmap_bit(page) != 0 {
            info!("no free page found");
            return None;
        }
        self.kdh.free_pages -= 1;
        self.descriptor_dirty = true;
        self.set_bitmap_bit(page, 1);
        self.img.zero_data(page);
        let mut l = Label::default();
        if prev_vda != 0 {
            let mut lprev = self.label(prev_vda);
            lprev.next_rda = vda_to_rda(page);
            self.set_label(prev_vda, &lprev);
            l.prev_rda = vda_to_rda(prev_vda);
            l.filepage = lprev.filepage + 1;
            l.fid_file = lprev.fid_file;
            l.fid_dir = lprev.fid_dir;
            l.fid_id = lprev.fid_id;
        } else {
            l.filepage = 0;
            l.fid_file = FID_REGULAR;
            l.fid_dir = 0;
            l.fid_id = self.kdh.last_sn[1];
            let sn = self.kdh.serial().wrapping_add(1);
            self.kdh.set_serial(sn);
        }
        self.set_label(page, &l);
        debug!("allocated page {}", page);
        Some(page)
    }

    /// Return a page to the free pool.  The label must belong to the file
    /// identified by `id` (or carry no bytes at all); anything else means
    /// the chains are crossed and continuing would eat another file.
    fn free_page(&mut self, page: usize, id: u16) {
        let mut l = self.label(page);
        debug!("free page {} id {:#06x}", page, id);
        if l.nbytes != 0 && l.fid_id != id {
            panic!("label id {:#06x} on page {} does not match file id {:#06x}", l.fid_id, page, id);
        }
        if l.prev_rda != 0 {
            let prev = rda_to_vda(l.prev_rda);
            let mut lprev = self.label(prev);
            lprev.next_rda = 0;
            self.set_label(prev, &lprev);
        }
        l.next_rda = 0;
        l.prev_rda = 0;
        l.nbytes = 0;
        l.filepage = FID_FREE;
        l.fid_file = FID_FREE;
        l.fid_dir = FID_FREE;
        l.fid_id = FID_FREE;
        self.set_label(page, &l);
        self.kdh.free_pages += 1;
        self.descriptor_dirty = true;
        self.set_bitmap_bit(page, 0);
    }

    // ---- chains ---------------------------------------------------------

    /// Length of a file in bytes: the sum of `nbytes` over its data pages.
    /// A page holding fewer than `PAGESZ` bytes ends the file.
    fn file_length(&self, leader_vda: usize) -> usize {
        let mut length = 0;
        let mut page = rda_to_vda(self.label(leader_vda).next_rda);
        while page != 0 {
            let l = self.label(page);
            length += l.nbytes as usize;
            if (l.nbytes as usize) < PAGESZ {
                break;
            }
            page = rda_to_vda(l.next_rda);
        }
        length
    }

    /// Data pages of a file in chain order, up to and including the page
    /// that ends it.
    fn data_pages(&self, leader_vda: usize) -> Vec<usize> {
        let mut ans = Vec::new();
        let mut page = rda_to_vda(self.label(leader_vda).next_rda);
        while page != 0 {
            ans.push(page);
            let l = self.label(page);
            if (l.nbytes as usize) < PAGESZ || l.next_rda == 0 {
                break;
            }
            page = rda_to_vda(l.next_rda);
        }
        ans
    }

    /// In-chain word cursor, used to read structures that span pages.
    /// Returns None at the end of the file.
    fn get_word(&self, fa: &mut FileAddress) -> Option<u16> {
        assert!(fa.char_pos & 1 == 0, "file cursor on odd byte boundary ({})", fa.char_pos);
        let mut l = self.label(fa.vda as usize);
        if fa.char_pos >= l.nbytes {
            if l.next_rda == 0 || (l.nbytes as usize) < PAGESZ {
                return None;
            }
            fa.vda = rda_to_vda(l.next_rda) as u16;
            l = self.label(fa.vda as usize);
            fa.filepage += 1;
            fa.char_pos = 0;
        }
        if fa.filepage != l.filepage {
            panic!("disk corruption: page {} should be filepage {}", fa.vda, fa.filepage);
        }
        let w = self.img.data_word(fa.vda as usize, (fa.char_pos >> 1) as usize);
        fa.char_pos += 2;
        Some(w)
    }

    /// In-chain word cursor for writing; the counterpart of `get_word`.
    fn put_word(&mut self, fa: &mut FileAddress, word: u16) -> Option<()> {
        assert!(fa.char_pos & 1 == 0, "file cursor on odd byte boundary ({})", fa.char_pos);
        let mut l = self.label(fa.vda as usize);
        if fa.char_pos >= l.nbytes {
            if l.next_rda == 0 || (l.nbytes as usize) < PAGESZ {
                return None;
            }
            fa.vda = rda_to_vda(l.next_rda) as u16;
            l = self.label(fa.vda as usize);
            fa.filepage += 1;
            fa.char_pos = 0;
        }
        if l.filepage != fa.filepage {
            l.filepage = fa.filepage;
            self.set_label(fa.vda as usize, &l);
        }
        self.img.set_data_word(fa.vda as usize, (fa.char_pos >> 1) as usize, word);
        fa.char_pos += 2;
        Some(())
    }

    // ---- byte granular file I/O -----------------------------------------

    /// Read up to `size` bytes starting at `offset`.  Reading past the end
    /// of the file returns the bytes that exist.  With `update` the
    /// leader's read time and the cached atime are refreshed.
    fn read_file(&mut self, leader_vda: usize, size: usize, offset: usize, update: bool) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(size);
        let mut offs = 0;
        let mut page = rda_to_vda(self.label(leader_vda).next_rda);
        while page != 0 && out.len() < size {
            let l = self.label(page);
            let nb = l.nbytes as usize;
            if offs + nb > offset {
                let from = match offs >= offset {
                    true => 0,
                    false => offset - offs
                };
                let n = min(size - out.len(), nb - from);
                let mut buf = vec![0u8; n];
                self.img.read_data(page, from, &mut buf);
                out.append(&mut buf);
            }
            offs += nb;
            if nb < PAGESZ {
                break;
            }
            page = rda_to_vda(l.next_rda);
        }
        if update {
            let now = chrono::Utc::now().timestamp();
            let mut lp = self.leader(leader_vda);
            lp.read = unix_to_altotime(now);
            self.set_leader(leader_vda, &lp);
            if let Some(f) = self.files.iter_mut().find(|f| f.leader_vda == leader_vda) {
                f.atime = now;
            }
        }
        out
    }

    /// Write bytes starting at `offset`, extending the chain as needed.
    /// Returns the count actually written, which is short when the free
    /// pool runs dry.  The leader's append hint is used to skip the walk
    /// when the write lands at or past the last page.
    fn write_file(&mut self, leader_vda: usize, dat: &[u8], offset: usize, update: bool) -> usize {
        let size = dat.len();
        let mut lp = self.leader(leader_vda);
        let mut page = rda_to_vda(self.label(leader_vda).next_rda);
        let mut offs: usize = 0;
        let hint = lp.last_page_hint;
        if hint.vda != 0 && hint.filepage >= 1 && offset >= (hint.filepage as usize - 1) * PAGESZ {
            page = hint.vda as usize;
            offs = (hint.filepage as usize - 1) * PAGESZ;
        }
        let mut done = 0;
        let mut last_vda = page;
        while page != 0 && done < size {
            let mut l = self.label(page);
            last_vda = page;
            if offs >= offset && l.nbytes as usize == PAGESZ {
                // whole page overwrite
                let n = min(size - done, PAGESZ);
                l.nbytes = n as u16;
                self.img.write_data(page, 0, &dat[done..done+n]);
                self.set_label(page, &l);
                done += n;
            } else if (l.nbytes as usize) < PAGESZ {
                // top up a short page; a page left short ends the write.
                // the write lands no further out than the bytes already
                // present, so the page never acquires a hole
                let to = min(l.nbytes as usize, offset.saturating_sub(offs));
                let n = min(size - done, PAGESZ - to);
                self.img.write_data(page, to, &dat[done..done+n]);
                l.nbytes = std::cmp::max(l.nbytes, (to + n) as u16);
                self.set_label(page, &l);
                done += n;
                if (l.nbytes as usize) < PAGESZ {
                    break;
                }
            } else {
                debug!("seek over page {} at offset {}", page, offs);
            }
            offs += PAGESZ;
            if done < size && l.next_rda == 0 {
                match self.alloc_page(page) {
                    Some(p) => page = p,
                    None => break
                };
            } else {
                page = rda_to_vda(l.next_rda);
            }
        }
        // cache the append position in the leader
        if last_vda != 0 {
            let ll = self.label(last_vda);
            lp.last_page_hint = FileAddress {
                vda: last_vda as u16,
                filepage: ll.filepage,
                char_pos: ll.nbytes
            };
        }
        if update {
            let now = chrono::Utc::now().timestamp();
            lp.written = unix_to_altotime(now);
            if let Some(f) = self.files.iter_mut().find(|f| f.leader_vda == leader_vda) {
                f.mtime = now;
            }
        }
        self.set_leader(leader_vda, &lp);
        if let Some(idx) = self.files.iter().position(|f| f.leader_vda == leader_vda) {
            self.files[idx].size = self.file_length(leader_vda);
            self.files[idx].blocks = self.data_pages(leader_vda).len();
        }
        done
    }

    /// Re-quantize a file's chain to hold exactly `new_size` bytes,
    /// freeing or allocating pages as required, and refresh the leader's
    /// append hint.
    fn truncate_chain(&mut self, leader_vda: usize, new_size: usize) -> Result<(),Error> {
        let id = self.label(leader_vda).fid_id;
        let target = match new_size {
            0 => 1,
            n => (n + PAGESZ - 1) / PAGESZ
        };
        let remainder = match new_size {
            0 => 0,
            n if n % PAGESZ == 0 => PAGESZ,
            n => n % PAGESZ
        };
        debug!("truncate leader {} to {} bytes: {} pages, {} in the last", leader_vda, new_size, target, remainder);
        let mut last_page = 0;
        let mut last_filepage: u16 = 1;
        let mut tail = leader_vda;
        let mut present = 0;
        let mut page = rda_to_vda(self.label(leader_vda).next_rda);
        while page != 0 {
            let mut l = self.label(page);
            let next = rda_to_vda(l.next_rda);
            let fp = l.filepage as usize;
            if fp == target {
                l.nbytes = remainder as u16;
                self.set_label(page, &l);
                last_page = page;
                last_filepage = l.filepage;
            } else if fp < target {
                l.nbytes = PAGESZ as u16;
                self.set_label(page, &l);
            } else {
                self.free_page(page, id);
            }
            if fp <= target {
                present = std::cmp::max(present, fp);
                tail = page;
            }
            page = next;
        }
        let mut result = Ok(());
        while present < target {
            match self.alloc_page(tail) {
                Some(p) => {
                    present += 1;
                    let mut l = self.label(p);
                    l.nbytes = match present == target {
                        true => remainder as u16,
                        false => PAGESZ as u16
                    };
                    self.set_label(p, &l);
                    tail = p;
                    last_page = p;
                    last_filepage = l.filepage;
                },
                None => {
                    warn!("free pool ran dry while extending leader {}", leader_vda);
                    result = Err(Error::NoSpace);
                    break;
                }
            };
        }
        let mut lp = self.leader(leader_vda);
        lp.last_page_hint = FileAddress {
            vda: last_page as u16,
            filepage: last_filepage,
            char_pos: match remainder == PAGESZ {
                true => 0,
                false => remainder as u16
            }
        };
        self.set_leader(leader_vda, &lp);
        if let Some(idx) = self.files.iter().position(|f| f.leader_vda == leader_vda) {
            self.files[idx].size = self.file_length(leader_vda);
            self.files[idx].blocks = self.data_pages(leader_vda).len();
        }
        result
    }

    // ---- the host visible tree ------------------------------------------

    /// Search every page for leader pages and rebuild the list of files.
    fn make_fileinfo(&mut self) {
        self.files.clear();
        for page in 0..self.img.page_count() {
            let l = self.label(page);
            if l.filepage != 0 || l.fid_file != FID_REGULAR || l.prev_rda != 0 {
                continue;
            }
            self.add_fileinfo(page);
        }
    }
    fn add_fileinfo(&mut self, leader_vda: usize) {
        let l = self.label(leader_vda);
        let lp = self.leader(leader_vda);
        let name = filename_to_string(&lp.filename);
        let read_only = l.fid_dir == FID_DIRECTORY || name == DISK_DESCRIPTOR;
        self.files.push(FileInfo {
            name,
            leader_vda,
            directory: false,
            size: self.file_length(leader_vda),
            blocks: self.data_pages(leader_vda).len(),
            read_only,
            deleted: false,
            ctime: altotime_to_unix(lp.created),
            mtime: altotime_to_unix(lp.written),
            atime: altotime_to_unix(lp.read)
        });
    }
    fn find_fileinfo(&self, name: &str) -> Option<&FileInfo> {
        self.files.iter().find(|f| f.name == name && !f.deleted)
    }
    /// Locate a file by scanning leader pages for the literal name.
    fn find_file(&self, name: &str) -> Option<usize> {
        for page in 0..self.img.page_count() {
            let l = self.label(page);
            if l.filepage == 0 && l.fid_file == FID_REGULAR {
                let lp = self.leader(page);
                if filename_to_string(&lp.filename) == name {
                    return Some(page);
                }
            }
        }
        None
    }

    // ---- directory ------------------------------------------------------

    /// Leader page of the named file according to the directory.
    pub fn find(&self, name: &str) -> Option<usize> {
        let idx = directory::find(&self.entries, file_name(name))?;
        Some(self.entries[idx].fileptr.leader_vda as usize)
    }
    pub fn directory_entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Read SysDir through the ordinary file path and decode the entries,
    /// synchronizing each file's deleted flag with its entry type.
    fn read_sysdir(&mut self) -> Result<(),Error> {
        if self.sysdir_dirty {
            self.save_sysdir()?;
        }
        let (vda, size) = match self.find_fileinfo(SYSDIR) {
            Some(f) => (f.leader_vda, f.size),
            None => {
                error!("the file SysDir was not found");
                return Err(Error::Corrupt);
            }
        };
        let buf = self.read_file(vda, size, 0, false);
        self.entries = directory::parse(&buf);
        let mut deleted = 0;
        for i in 0..self.entries.len() {
            let name = self.entries[i].name();
            let allocated = self.entries[i].is_allocated();
            if !allocated {
                deleted += 1;
            }
            if let Some(f) = self.files.iter_mut().find(|f| f.name == name) {
                f.deleted = !allocated;
            }
        }
        info!("SysDir holds {} entries ({} deleted) in {} bytes", self.entries.len(), deleted, size);
        Ok(())
    }

    /// Serialize the entries back into the SysDir file, growing the file
    /// through the ordinary allocation path when the directory no longer
    /// fits.
    fn save_sysdir(&mut self) -> Result<(),Error> {
        let vda = match self.find_fileinfo(SYSDIR) {
            Some(f) => f.leader_vda,
            None => {
                error!("the file SysDir was not found");
                return Err(Error::Corrupt);
            }
        };
        let buf = directory::serialize(&self.entries);
        let written = self.write_file(vda, &buf, 0, false);
        if written < buf.len() {
            error!("SysDir grew past the free pool");
            return Err(Error::NoSpace);
        }
        self.sysdir_dirty = false;
        Ok(())
    }

    // ---- disk descriptor ------------------------------------------------

    /// Locate DiskDescriptor, decode the fixed header from its first data
    /// page, and pull in the bit table word by word; the table may spill
    /// onto further pages.
    fn read_disk_descriptor(&mut self) -> Result<(),Error> {
        let ddlp = match self.find_file(DISK_DESCRIPTOR) {
            Some(p) => p,
            None => {
                error!("can't find DiskDescriptor");
                return Err(Error::Corrupt);
            }
        };
        let first = rda_to_vda(self.label(ddlp).next_rda);
        let mut hdr = [0u8; KDH_BYTES];
        self.img.read_data(first, 0, &mut hdr);
        self.kdh = DescriptorHeader::from_bytes(&hdr);
        self.bit_count = self.kdh.disk_bt_size as usize * 16;
        self.bit_table = Vec::with_capacity(self.kdh.disk_bt_size as usize);
        let mut fa = FileAddress { vda: first as u16, filepage: 1, char_pos: KDH_BYTES as u16 };
        for _i in 0..self.kdh.disk_bt_size {
            match self.get_word(&mut fa) {
                Some(w) => self.bit_table.push(w),
                None => {
                    error!("bit table ends before its declared size");
                    return Err(Error::Corrupt);
                }
            };
        }
        self.descriptor_dirty = false;
        info!("the bit table is {} words ({} bits)", self.kdh.disk_bt_size, self.bit_count);
        Ok(())
    }

    /// Write the header and bit table back into the DiskDescriptor file.
    fn save_disk_descriptor(&mut self) -> Result<(),Error> {
        let ddlp = match self.find_file(DISK_DESCRIPTOR) {
            Some(p) => p,
            None => {
                error!("can't find DiskDescriptor");
                return Err(Error::Corrupt);
            }
        };
        let first = rda_to_vda(self.label(ddlp).next_rda);
        let hdr = self.kdh.to_bytes();
        self.img.write_data(first, 0, &hdr);
        let mut fa = FileAddress { vda: first as u16, filepage: 1, char_pos: KDH_BYTES as u16 };
        for i in 0..self.kdh.disk_bt_size as usize {
            let w = self.bit_table[i];
            if self.put_word(&mut fa, w).is_none() {
                error!("bit table does not fit in the DiskDescriptor file");
                return Err(Error::IoError);
            }
        }
        self.descriptor_dirty = false;
        Ok(())
    }

    // ---- public operations ----------------------------------------------

    /// Resolve a path to a handle (the leader page VDA, which also serves
    /// as the file's inode number).
    pub fn open(&self, path: &str) -> Result<usize,Error> {
        match self.find_fileinfo(file_name(path)) {
            Some(f) => Ok(f.leader_vda),
            None => Err(Error::NotFound)
        }
    }

    pub fn read(&mut self, handle: usize, size: usize, offset: usize) -> Result<Vec<u8>,Error> {
        if !self.files.iter().any(|f| f.leader_vda == handle && !f.deleted) {
            return Err(Error::NotFound);
        }
        Ok(self.read_file(handle, size, offset, true))
    }

    pub fn write(&mut self, handle: usize, dat: &[u8], offset: usize) -> Result<usize,Error> {
        match self.files.iter().find(|f| f.leader_vda == handle && !f.deleted) {
            Some(f) if f.read_only => return Err(Error::PermissionDenied),
            Some(_) => {},
            None => return Err(Error::NotFound)
        };
        Ok(self.write_file(handle, dat, offset, true))
    }

    pub fn truncate(&mut self, path: &str, new_size: usize) -> Result<(),Error> {
        let leader_vda = match self.find_fileinfo(file_name(path)) {
            Some(f) if f.read_only => return Err(Error::PermissionDenied),
            Some(f) => f.leader_vda,
            None => return Err(Error::NotFound)
        };
        self.truncate_chain(leader_vda, new_size)
    }

    /// Create an empty file: a leader page, one zero length data page, and
    /// a directory entry spliced in at its sorted position (re-using a
    /// deleted entry of the identical name when one exists).
    pub fn create(&mut self, path: &str) -> Result<(),Error> {
        let name = file_name(path);
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidArgument);
        }
        if name.len() >= FNLEN - 2 {
            warn!("name '{}' is too long", name);
            return Err(Error::InvalidArgument);
        }
        if self.find_fileinfo(name).is_some() {
            return Err(Error::AlreadyExists);
        }
        let sysdir_vda = self.find_file(SYSDIR).ok_or(Error::Corrupt)?;
        let sysdir_sn = self.label(sysdir_vda).fid_id;
        let leader_vda = match self.alloc_page(0) {
            Some(p) => p,
            None => return Err(Error::NoSpace)
        };
        let serial = self.label(leader_vda).fid_id;
        let page1 = match self.alloc_page(leader_vda) {
            Some(p) => p,
            None => {
                self.free_page(leader_vda, serial);
                return Err(Error::NoSpace);
            }
        };
        let now = chrono::Utc::now().timestamp();
        let at = unix_to_altotime(now);
        let mut lp = Leader::new();
        lp.created = at;
        lp.written = at;
        lp.read = at;
        lp.filename = string_to_filename(name);
        lp.propbegin = LEADER_PROP_BEGIN;
        lp.proplength = LEADER_PROP_WORDS as u8;
        lp.dir_fp_hint = FilePointer {
            fid_dir: FID_DIRECTORY,
            serialno: sysdir_sn,
            version: 1,
            blank: 0,
            leader_vda: sysdir_vda as u16
        };
        lp.last_page_hint = FileAddress { vda: page1 as u16, filepage: 1, char_pos: 0 };
        self.set_leader(leader_vda, &lp);
        let entry = DirEntry::new(name, FilePointer {
            fid_dir: 0,
            serialno: serial,
            version: 1,
            blank: 0,
            leader_vda: leader_vda as u16
        });
        match directory::insert_position(&self.entries, name) {
            (idx, true) => {
                debug!("re-using deleted entry {} for '{}'", idx, name);
                self.entries[idx] = entry;
            },
            (idx, false) => {
                debug!("inserting entry for '{}' at {}/{}", name, idx, self.entries.len());
                self.entries.insert(idx, entry);
            }
        };
        self.sysdir_dirty = true;
        self.add_fileinfo(leader_vda);
        Ok(())
    }

    /// Delete a file: mark its directory entry, blank the leader's name
    /// and hint, and return every page of the chain to the free pool.
    pub fn unlink(&mut self, path: &str) -> Result<(),Error> {
        let name = file_name(path).to_string();
        let idx = match self.files.iter().position(|f| f.name == name && !f.deleted) {
            Some(i) => i,
            None => return Err(Error::NotFound)
        };
        let leader_vda = self.files[idx].leader_vda;
        let lp = self.leader(leader_vda);
        let fname = filename_to_string(&lp.filename);
        if fname == SYSDIR || fname == DISK_DESCRIPTOR {
            return Err(Error::PermissionDenied);
        }
        let mut lp = lp;
        lp.filename = [0;FNLEN];
        lp.last_page_hint = FileAddress::default();
        self.set_leader(leader_vda, &lp);
        let id = self.label(leader_vda).fid_id;
        let pages = self.data_pages(leader_vda);
        self.free_page(leader_vda, id);
        for page in pages {
            self.free_page(page, id);
        }
        let mut l = self.label(leader_vda);
        l.next_rda = 0;
        l.blank = 0;
        self.set_label(leader_vda, &l);
        match directory::find(&self.entries, &fname) {
            Some(i) => {
                self.entries[i].etype = EntryType::Deleted as u8;
                self.sysdir_dirty = true;
            },
            None => {
                warn!("could not find '{}' in SysDir", fname);
                return Err(Error::NotFound);
            }
        };
        self.files.remove(idx);
        Ok(())
    }

    /// Change a file's name in its leader page and in the directory.  The
    /// two permanent files cannot be renamed.
    pub fn rename(&mut self, path: &str, new_path: &str) -> Result<(),Error> {
        let old = file_name(path).to_string();
        let new = file_name(new_path).to_string();
        if old == SYSDIR || old == DISK_DESCRIPTOR {
            return Err(Error::PermissionDenied);
        }
        if new.is_empty() || new.contains('/') || new.len() >= FNLEN - 2 {
            return Err(Error::InvalidArgument);
        }
        let idx = match self.files.iter().position(|f| f.name == old && !f.deleted) {
            Some(i) => i,
            None => return Err(Error::NotFound)
        };
        let leader_vda = self.files[idx].leader_vda;
        let mut lp = self.leader(leader_vda);
        lp.filename = string_to_filename(&new);
        self.set_leader(leader_vda, &lp);
        match directory::find(&self.entries, &old) {
            Some(i) => {
                self.entries[i].filename = string_to_filename(&new);
                self.entries[i].length = (self.entries[i].record_size() / 2) as u8;
                self.sysdir_dirty = true;
            },
            None => return Err(Error::NotFound)
        };
        self.files[idx].name = new;
        Ok(())
    }

    /// List the root.  The namespace has exactly one directory.
    pub fn readdir(&self, path: &str) -> Result<Vec<FileInfo>,Error> {
        if path != "/" && !path.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(self.files.iter().filter(|f| !f.deleted).cloned().collect())
    }

    pub fn getattr(&self, path: &str) -> Result<FileInfo,Error> {
        if path == "/" {
            return Ok(FileInfo {
                name: String::from("/"),
                leader_vda: 0,
                directory: true,
                size: 0,
                blocks: 0,
                read_only: false,
                deleted: false,
                ctime: 0,
                mtime: 0,
                atime: 0
            });
        }
        match self.find_fileinfo(file_name(path)) {
            Some(f) => Ok(f.clone()),
            None => Err(Error::NotFound)
        }
    }

    /// Stamp the leader's time triplet from host times (seconds since the
    /// Unix epoch).
    pub fn set_times(&mut self, path: &str, atime: i64, mtime: i64) -> Result<(),Error> {
        let leader_vda = match self.find_fileinfo(file_name(path)) {
            Some(f) => f.leader_vda,
            None => return Err(Error::NotFound)
        };
        let mut lp = self.leader(leader_vda);
        lp.created = unix_to_altotime(mtime);
        lp.written = unix_to_altotime(mtime);
        lp.read = unix_to_altotime(atime);
        self.set_leader(leader_vda, &lp);
        if let Some(f) = self.files.iter_mut().find(|f| f.leader_vda == leader_vda) {
            f.mtime = mtime;
            f.atime = atime;
        }
        Ok(())
    }

    pub fn statfs(&self) -> Statfs {
        Statfs {
            block_size: PAGESZ,
            total_blocks: self.img.page_count(),
            free_blocks: self.kdh.free_pages as usize,
            files: self.entries.len(),
            // a file needs at least a leader page and one data page
            free_files: self.kdh.free_pages as usize / 2,
            max_name: FNLEN - 2,
            fsid: self.kdh.last_sn[1] as u32
        }
    }

    /// Print the directory in long form.
    pub fn catalog_to_stdout(&self) {
        println!();
        for f in &self.files {
            if f.deleted {
                continue;
            }
            let lp = self.leader(f.leader_vda);
            println!("{:<40} {:>5} {:>9}  {}", f.name, f.blocks, f.size, altotime_to_string(lp.written));
        }
        println!();
        println!("{} files, {} free pages", self.files.iter().filter(|f| !f.deleted).count(), self.kdh.free_pages);
    }

    /// Dump one page's label and data as words and ASCII, for inspection
    /// of damaged images.
    pub fn dump_page_to_stdout(&self, vda: usize) {
        let l = self.label(vda);
        println!("page {} (rda {:#06x})", vda, vda_to_rda(vda));
        println!("  next_rda : {:#06x} (vda {})", l.next_rda, rda_to_vda(l.next_rda));
        println!("  prev_rda : {:#06x} (vda {})", l.prev_rda, rda_to_vda(l.prev_rda));
        println!("  nbytes   : {}", l.nbytes);
        println!("  filepage : {}", l.filepage);
        println!("  fid      : {:#06x} {:#06x} {:#06x}", l.fid_file, l.fid_dir, l.fid_id);
        let mut dat = vec![0u8; PAGESZ];
        self.img.read_data(vda, 0, &mut dat);
        for row in 0..PAGESZ/16 {
            let mut words = String::new();
            let mut text = String::new();
            for col in 0..8 {
                let hi = dat[row*16 + col*2];
                let lo = dat[row*16 + col*2 + 1];
                words += &format!(" {:02x}{:02x}", hi, lo);
                for b in [hi, lo] {
                    text.push(match b {
                        0x20..=0x7e => b as char,
                        _ => '.'
                    });
                }
            }
            println!("{:04x}:{}  {}", row*16, words, text);
        }
    }

    // ---- write back -----------------------------------------------------

    /// Write dirty in-memory structures back into the image words.
    pub fn sync(&mut self) -> STDRESULT {
        if self.sysdir_dirty {
            self.save_sysdir()?;
        }
        if self.descriptor_dirty {
            self.save_disk_descriptor()?;
        }
        Ok(())
    }

    /// Sync and save the image file(s) to their backup paths.
    pub fn flush(&mut self) -> STDRESULT {
        self.sync()?;
        self.img.save()
    }

    pub fn get_img(&mut self) -> &mut DiabloImage {
        &mut self.img
    }
}
