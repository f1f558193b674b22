//! Validation and repair of the redundant structures.
//!
//! The page labels are authoritative for chains, the chains are
//! authoritative for the bit table, and the directory is authoritative
//! for which chains are alive.  When the descriptor disagrees with any of
//! them the repair pass rebuilds the bit table from the labels, walks
//! every live chain restoring the per-page bookkeeping, and recounts the
//! free pool.  Repair does not fail; it produces the best reconstruction
//! it can and leaves the descriptor dirty so the result is flushed.

use log::{debug,info,warn};
use crate::img::{rda_to_vda,NCYLS,NHEADS,NSECS};
use super::types::*;

impl super::Disk {
    /// Check the descriptor against the compiled geometry, the bit table,
    /// and the labels.  Logs every mismatch; returns false if any.
    pub(crate) fn validate_disk_descriptor(&self) -> bool {
        let mut ok = true;
        if self.kdh.n_disks as usize != self.img.drives() {
            warn!("descriptor names {} disks, {} mounted", self.kdh.n_disks, self.img.drives());
            ok = false;
        }
        if self.kdh.n_tracks as usize != NCYLS {
            warn!("descriptor tracks {} != {}", self.kdh.n_tracks, NCYLS);
            ok = false;
        }
        if self.kdh.n_heads as usize != NHEADS {
            warn!("descriptor heads {} != {}", self.kdh.n_heads, NHEADS);
            ok = false;
        }
        if self.kdh.n_sectors as usize != NSECS {
            warn!("descriptor sectors {} != {}", self.kdh.n_sectors, NSECS);
            ok = false;
        }
        if self.kdh.def_versions_kept != 0 {
            warn!("descriptor keeps {} versions, expected none", self.kdh.def_versions_kept);
            ok = false;
        }
        let page_count = self.img.page_count();
        let mut nfree = 0;
        for page in 0..page_count {
            if self.bitmap_bit(page) == 0 {
                nfree += 1;
            }
        }
        if nfree != self.kdh.free_pages as usize {
            warn!("bit table shows {} free pages, descriptor says {}", nfree, self.kdh.free_pages);
            ok = false;
        }
        let mut nfree = 0;
        for page in 0..page_count {
            if self.is_page_free(page) {
                nfree += 1;
            }
        }
        if nfree != self.kdh.free_pages as usize {
            warn!("labels show {} free pages, descriptor says {}", nfree, self.kdh.free_pages);
            ok = false;
        }
        ok
    }

    /// Rebuild the bit table and free page count from the labels, then
    /// reconcile every live chain against its leader.
    pub(crate) fn fix_disk_descriptor(&mut self) -> Result<(),Error> {
        let page_count = self.img.page_count();
        // labels decide the bit table
        for page in 0..page_count {
            let free = self.is_page_free(page);
            self.set_bitmap_bit(page, if free { 0 } else { 1 });
        }
        self.make_fileinfo();
        self.read_sysdir()?;
        // walk every live chain, restoring the per-page bookkeeping from
        // the leader's label
        for idx in 0..self.entries.len() {
            let entry = self.entries[idx].clone();
            if !entry.is_allocated() || entry.filename[0] == 0 {
                continue;
            }
            let leader_vda = entry.fileptr.leader_vda as usize;
            if leader_vda == 0 || leader_vda >= page_count {
                warn!("entry '{}' points at page {}, skipping", entry.name(), leader_vda);
                continue;
            }
            let l0 = self.label(leader_vda);
            let length = self.file_length(leader_vda);
            let pages = (length + PAGESZ - 1) / PAGESZ;
            let mut fixed = false;
            let mut filepage: u16 = 0;
            let mut offs: usize = 0;
            let mut page = leader_vda;
            while page != 0 {
                let mut l = self.label(page);
                let left = length.saturating_sub(offs);
                if self.bitmap_bit(page) == 0 {
                    warn!("page {} filepage {} was marked free", page, filepage);
                    fixed = true;
                }
                self.set_bitmap_bit(page, 1);
                if filepage > 0 {
                    if left >= PAGESZ && (l.nbytes as usize) < PAGESZ {
                        warn!("page {} filepage {} nbytes {} should be {}", page, filepage, l.nbytes, PAGESZ);
                        l.nbytes = PAGESZ as u16;
                        fixed = true;
                    }
                    if left < PAGESZ && l.nbytes as usize != left {
                        warn!("page {} filepage {} last page nbytes {} should be {}", page, filepage, l.nbytes, left);
                        l.nbytes = left as u16;
                        fixed = true;
                    }
                }
                if l.nbytes > 0 || filepage == 0 {
                    if l.filepage != filepage {
                        warn!("page {} filepage {} should be {}", page, l.filepage, filepage);
                        l.filepage = filepage;
                        fixed = true;
                    }
                    if l.fid_file != l0.fid_file {
                        warn!("page {} fid_file {:#06x} should be {:#06x}", page, l.fid_file, l0.fid_file);
                        l.fid_file = l0.fid_file;
                        fixed = true;
                    }
                    if l.fid_dir != l0.fid_dir {
                        warn!("page {} fid_dir {:#06x} should be {:#06x}", page, l.fid_dir, l0.fid_dir);
                        l.fid_dir = l0.fid_dir;
                        fixed = true;
                    }
                    if l.fid_id != l0.fid_id {
                        warn!("page {} fid_id {:#06x} should be {:#06x}", page, l.fid_id, l0.fid_id);
                        l.fid_id = l0.fid_id;
                        fixed = true;
                    }
                }
                self.set_label(page, &l);
                if filepage > 0 {
                    offs += PAGESZ;
                }
                filepage += 1;
                page = rda_to_vda(l.next_rda);
            }
            if fixed {
                info!("file '{}', {} page{}, {} bytes was repaired", entry.name(), pages, if pages != 1 { "s" } else { "" }, length);
            } else {
                debug!("file '{}', {} page{}, {} bytes verified ok", entry.name(), pages, if pages != 1 { "s" } else { "" }, length);
            }
        }
        // recount the free pool
        let mut nfree = 0;
        for page in 0..page_count {
            if self.bitmap_bit(page) == 0 {
                nfree += 1;
            }
        }
        if self.kdh.free_pages as usize != nfree {
            warn!("free page count {} corrected to {}", self.kdh.free_pages, nfree);
            self.kdh.free_pages = nfree as u16;
        }
        self.descriptor_dirty = true;
        Ok(())
    }
}
