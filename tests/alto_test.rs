// tests of the Alto file system module
use altokit::img::{DiabloImage,NPAGES};
use altokit::fs::alto::Disk;
use altokit::fs::alto::types::{Label,Leader,Error,PAGESZ,EntryType};

// pages consumed by a freshly formatted single drive volume: the boot
// page, SysDir (leader + 1 data page), DiskDescriptor (leader + 2 data
// pages, since the bit table spills onto a second page)
const FORMAT_USED: usize = 6;

fn blank_disk() -> Disk {
    Disk::format(DiabloImage::blank(1), None).expect("could not format")
}

fn label(disk: &mut Disk, vda: usize) -> Label {
    Label::from_words(&disk.get_img().label_words(vda))
}

fn leader(disk: &mut Disk, vda: usize) -> Leader {
    Leader::from_words(disk.get_img().data_words(vda))
}

/// first and second data page of a file, via the chain links
fn data_pages(disk: &mut Disk, leader_vda: usize) -> Vec<usize> {
    let mut ans = Vec::new();
    let mut page = altokit::img::rda_to_vda(label(disk, leader_vda).next_rda);
    while page != 0 {
        ans.push(page);
        let l = label(disk, page);
        if (l.nbytes as usize) < PAGESZ || l.next_rda == 0 {
            break;
        }
        page = altokit::img::rda_to_vda(l.next_rda);
    }
    ans
}

/// the bit table, the labels, and the free page count must always agree
fn assert_consistent(disk: &mut Disk) {
    let free = disk.free_pages();
    let mut by_label = 0;
    let mut by_bitmap = 0;
    for page in 0..NPAGES {
        if disk.is_page_free(page) {
            by_label += 1;
            assert_eq!(disk.bitmap_bit(page), 0, "page {} free but marked allocated", page);
        } else {
            assert_eq!(disk.bitmap_bit(page), 1, "page {} in use but marked free", page);
        }
        if disk.bitmap_bit(page) == 0 {
            by_bitmap += 1;
        }
    }
    assert_eq!(by_label, free);
    assert_eq!(by_bitmap, free);
}

#[test]
fn format_and_mount() {
    let disk = blank_disk();
    let vfs = disk.statfs();
    assert_eq!(vfs.total_blocks, NPAGES);
    assert_eq!(vfs.block_size, PAGESZ);
    assert_eq!(vfs.free_blocks, NPAGES - FORMAT_USED);
    assert_eq!(vfs.files, 2);
    let listing = disk.readdir("/").expect("error");
    let names: Vec<String> = listing.iter().map(|f| f.name.clone()).collect();
    assert!(names.contains(&String::from("SysDir")));
    assert!(names.contains(&String::from("DiskDescriptor")));
    // the permanent files can't be written through the host surface
    assert!(disk.getattr("/SysDir").expect("error").read_only);
    assert!(disk.getattr("/DiskDescriptor").expect("error").read_only);
}

#[test]
fn format_dual_drive() {
    let disk = Disk::format(DiabloImage::blank(2), None).expect("could not format");
    let vfs = disk.statfs();
    assert_eq!(vfs.total_blocks, 2 * NPAGES);
    // the bit table for two drives needs 609 words, filling a third page
    assert_eq!(vfs.free_blocks, 2 * NPAGES - 7);
}

#[test]
fn create_file() {
    let mut disk = blank_disk();
    disk.create("/FOO.TXT").expect("error");
    assert_eq!(disk.getattr("/FOO.TXT").expect("error").size, 0);
    // new entry sits in sorted position, allocated, version 1
    let names: Vec<String> = disk.directory_entries().iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["DiskDescriptor", "FOO.TXT", "SysDir"]);
    let entry = &disk.directory_entries()[1];
    assert_eq!(entry.etype, EntryType::Allocated as u8);
    assert_eq!(entry.fileptr.version, 1);
    let handle = disk.open("/FOO.TXT").expect("error");
    assert_eq!(entry.fileptr.leader_vda as usize, handle);
    // leader and first data page are biased near each other
    let pages = data_pages(&mut disk, handle);
    assert_eq!(pages.len(), 1);
    assert!(pages[0].abs_diff(handle) <= 2);
    assert_eq!(disk.free_pages(), NPAGES - FORMAT_USED - 2);
    assert_consistent(&mut disk);
}

#[test]
fn create_duplicate() {
    let mut disk = blank_disk();
    disk.create("/FOO.TXT").expect("error");
    match disk.create("/FOO.TXT") {
        Err(Error::AlreadyExists) => {},
        _ => panic!("duplicate create should fail")
    }
}

#[test]
fn write_then_read() {
    let mut disk = blank_disk();
    disk.create("/FOO.TXT").expect("error");
    let handle = disk.open("/FOO.TXT").expect("error");
    let buf = vec![0x41u8; 600];
    assert_eq!(disk.write(handle, &buf, 0).expect("error"), 600);
    // 600 bytes means one full page and 88 bytes on a second
    let pages = data_pages(&mut disk, handle);
    assert_eq!(pages.len(), 2);
    assert_eq!(label(&mut disk, pages[0]).nbytes as usize, PAGESZ);
    assert_eq!(label(&mut disk, pages[1]).nbytes, 88);
    assert_eq!(disk.getattr("/FOO.TXT").expect("error").size, 600);
    assert_eq!(disk.read(handle, 600, 0).expect("error"), buf);
    // the reverse links walk back to the leader
    assert_eq!(altokit::img::rda_to_vda(label(&mut disk, pages[1]).prev_rda), pages[0]);
    assert_eq!(altokit::img::rda_to_vda(label(&mut disk, pages[0]).prev_rda), handle);
    // one identity on every page of the chain
    let id = label(&mut disk, handle).fid_id;
    assert_eq!(label(&mut disk, pages[0]).fid_id, id);
    assert_eq!(label(&mut disk, pages[1]).fid_id, id);
    assert_consistent(&mut disk);
}

#[test]
fn read_at_offsets() {
    let mut disk = blank_disk();
    disk.create("/SEQ").expect("error");
    let handle = disk.open("/SEQ").expect("error");
    let buf: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(disk.write(handle, &buf, 0).expect("error"), 1500);
    // unaligned offset and length, crossing a page boundary
    assert_eq!(disk.read(handle, 600, 100).expect("error"), buf[100..700].to_vec());
    // a small read inside a later page
    assert_eq!(disk.read(handle, 10, 1111).expect("error"), buf[1111..1121].to_vec());
    // reads past the end return what exists
    assert_eq!(disk.read(handle, 100, 1450).expect("error"), buf[1450..1500].to_vec());
    assert_eq!(disk.read(handle, 10, 5000).expect("error").len(), 0);
}

#[test]
fn append_in_pieces() {
    let mut disk = blank_disk();
    disk.create("/LOG").expect("error");
    let handle = disk.open("/LOG").expect("error");
    let mut whole = Vec::new();
    let mut offset = 0;
    for chunk in [100usize, 412, 700, 88] {
        let piece = vec![(chunk % 256) as u8; chunk];
        assert_eq!(disk.write(handle, &piece, offset).expect("error"), chunk);
        offset += chunk;
        whole.extend_from_slice(&piece);
    }
    assert_eq!(disk.getattr("/LOG").expect("error").size, whole.len());
    assert_eq!(disk.read(handle, whole.len(), 0).expect("error"), whole);
    assert_consistent(&mut disk);
}

#[test]
fn truncate_file() {
    let mut disk = blank_disk();
    disk.create("/FOO.TXT").expect("error");
    let handle = disk.open("/FOO.TXT").expect("error");
    disk.write(handle, &vec![0x41u8; 600], 0).expect("error");
    let free_before = disk.free_pages();
    let pages = data_pages(&mut disk, handle);
    disk.truncate("/FOO.TXT", 300).expect("error");
    // the second data page goes back to the free pool
    assert_eq!(disk.free_pages(), free_before + 1);
    assert!(disk.is_page_free(pages[1]));
    assert_eq!(label(&mut disk, pages[0]).nbytes, 300);
    assert_eq!(disk.getattr("/FOO.TXT").expect("error").size, 300);
    let hint = leader(&mut disk, handle).last_page_hint;
    assert_eq!(hint.vda as usize, pages[0]);
    assert_eq!(hint.filepage, 1);
    assert_eq!(hint.char_pos, 300);
    // truncation is idempotent
    disk.truncate("/FOO.TXT", 300).expect("error");
    assert_eq!(disk.free_pages(), free_before + 1);
    assert_eq!(disk.getattr("/FOO.TXT").expect("error").size, 300);
    assert_consistent(&mut disk);
}

#[test]
fn truncate_extends() {
    let mut disk = blank_disk();
    disk.create("/GROW").expect("error");
    disk.truncate("/GROW", 1300).expect("error");
    let handle = disk.open("/GROW").expect("error");
    assert_eq!(disk.getattr("/GROW").expect("error").size, 1300);
    let pages = data_pages(&mut disk, handle);
    assert_eq!(pages.len(), 3);
    assert_eq!(label(&mut disk, pages[2]).nbytes as usize, 1300 % PAGESZ);
    assert_consistent(&mut disk);
}

#[test]
fn unlink_file() {
    let mut disk = blank_disk();
    disk.create("/FOO.TXT").expect("error");
    let handle = disk.open("/FOO.TXT").expect("error");
    disk.write(handle, &vec![0x41u8; 600], 0).expect("error");
    let pages = data_pages(&mut disk, handle);
    disk.unlink("/FOO.TXT").expect("error");
    // every page of the chain is free again, and the name is gone
    assert!(disk.is_page_free(handle));
    for page in pages {
        assert!(disk.is_page_free(page));
        assert_eq!(disk.bitmap_bit(page), 0);
    }
    assert_eq!(disk.free_pages(), NPAGES - FORMAT_USED);
    assert!(disk.find("/FOO.TXT").is_none());
    match disk.open("/FOO.TXT") {
        Err(Error::NotFound) => {},
        _ => panic!("unlinked file should be gone")
    }
    // the entry stays in place, marked deleted
    let entry = &disk.directory_entries()[1];
    assert_eq!(entry.etype, EntryType::Deleted as u8);
    assert_consistent(&mut disk);
}

#[test]
fn unlink_then_create() {
    let mut disk = blank_disk();
    disk.create("/FOO.TXT").expect("error");
    let handle = disk.open("/FOO.TXT").expect("error");
    disk.write(handle, "old contents".as_bytes(), 0).expect("error");
    disk.unlink("/FOO.TXT").expect("error");
    let count = disk.directory_entries().len();
    disk.create("/FOO.TXT").expect("error");
    // the deleted entry is re-used, and the file comes back empty
    assert_eq!(disk.directory_entries().len(), count);
    assert_eq!(disk.getattr("/FOO.TXT").expect("error").size, 0);
    let handle = disk.open("/FOO.TXT").expect("error");
    assert_eq!(disk.read(handle, 100, 0).expect("error").len(), 0);
}

#[test]
fn rename_file() {
    let mut disk = blank_disk();
    disk.create("/A").expect("error");
    let handle = disk.open("/A").expect("error");
    disk.write(handle, "the same bytes".as_bytes(), 0).expect("error");
    disk.rename("/A", "/B").expect("error");
    assert!(disk.open("/A").is_err());
    let handle2 = disk.open("/B").expect("error");
    // only the name changed; the chain is untouched
    assert_eq!(handle2, handle);
    assert_eq!(disk.read(handle2, 14, 0).expect("error"), "the same bytes".as_bytes());
    assert_consistent(&mut disk);
}

#[test]
fn permanent_files_are_protected() {
    let mut disk = blank_disk();
    let free_before = disk.free_pages();
    match disk.rename("/DiskDescriptor", "/X") {
        Err(Error::PermissionDenied) => {},
        _ => panic!("renaming DiskDescriptor should fail")
    }
    match disk.unlink("/SysDir") {
        Err(Error::PermissionDenied) => {},
        _ => panic!("deleting SysDir should fail")
    }
    let handle = disk.open("/SysDir").expect("error");
    match disk.write(handle, &[0], 0) {
        Err(Error::PermissionDenied) => {},
        _ => panic!("writing SysDir should fail")
    }
    assert_eq!(disk.free_pages(), free_before);
    assert!(disk.open("/DiskDescriptor").is_ok());
}

#[test]
fn long_names_are_rejected() {
    let mut disk = blank_disk();
    let name = "X".repeat(50);
    match disk.create(&name) {
        Err(Error::InvalidArgument) => {},
        _ => panic!("oversized name should fail")
    }
}

#[test]
fn out_of_space() {
    let mut disk = blank_disk();
    disk.create("/BIG").expect("error");
    let capacity = disk.free_pages() * PAGESZ;
    match disk.truncate("/BIG", capacity + 2 * PAGESZ) {
        Err(Error::NoSpace) => {},
        _ => panic!("extending past the free pool should fail")
    }
    assert_eq!(disk.free_pages(), 0);
    // the partial extension is committed and can be undone
    disk.truncate("/BIG", 0).expect("error");
    assert_eq!(disk.getattr("/BIG").expect("error").size, 0);
    assert_consistent(&mut disk);
}

#[test]
fn flush_roundtrip() {
    let mut disk = blank_disk();
    disk.create("/KEEP.ME").expect("error");
    let handle = disk.open("/KEEP.ME").expect("error");
    disk.write(handle, "persistent bytes".as_bytes(), 0).expect("error");
    disk.sync().expect("error");
    let dat = disk.get_img().drive_bytes(0);
    // a second mount of the flushed bytes sees the same state
    let mut copy = Disk::from_img(DiabloImage::from_bytes(&dat).expect("bad image")).expect("mount failed");
    assert_eq!(copy.free_pages(), disk.free_pages());
    let handle = copy.open("/KEEP.ME").expect("error");
    assert_eq!(copy.read(handle, 16, 0).expect("error"), "persistent bytes".as_bytes());
    assert_consistent(&mut copy);
}

#[test]
fn scavenger_reclaims_lost_page() {
    let mut disk = blank_disk();
    // a page whose label says "in use" while the bit table says "free"
    let mut l = label(&mut disk, 100);
    l.fid_file = 1;
    l.fid_dir = 0;
    l.fid_id = 0x77;
    l.filepage = 1;
    l.nbytes = PAGESZ as u16;
    disk.get_img().set_label_words(100, &l.to_words());
    let dat = disk.get_img().drive_bytes(0);
    let mut copy = Disk::from_img(DiabloImage::from_bytes(&dat).expect("bad image")).expect("mount failed");
    // the mount repaired the bit table and the free page count
    assert_eq!(copy.bitmap_bit(100), 1);
    assert_eq!(copy.free_pages(), NPAGES - FORMAT_USED - 1);
    assert_consistent(&mut copy);
}

#[test]
fn scavenger_restores_chain_bookkeeping() {
    let mut disk = blank_disk();
    disk.create("/FIX.ME").expect("error");
    let handle = disk.open("/FIX.ME").expect("error");
    disk.write(handle, &vec![7u8; 1000], 0).expect("error");
    disk.sync().expect("error");
    let pages = data_pages(&mut disk, handle);
    // cross up the second data page's identity and page number
    let mut l = label(&mut disk, pages[1]);
    l.fid_id = 0x1234;
    l.filepage = 9;
    disk.get_img().set_label_words(pages[1], &l.to_words());
    // and zero the stored free page count so validation trips
    // (the count is word 9 of the descriptor's first data page)
    disk.get_img().set_data_word(4, 9, 0);
    let dat = disk.get_img().drive_bytes(0);
    let mut copy = Disk::from_img(DiabloImage::from_bytes(&dat).expect("bad image")).expect("mount failed");
    let good = label(&mut copy, pages[0]);
    let fixed = label(&mut copy, pages[1]);
    assert_eq!(fixed.fid_id, good.fid_id);
    assert_eq!(fixed.filepage, 2);
    let handle = copy.open("/FIX.ME").expect("error");
    assert_eq!(copy.read(handle, 1000, 0).expect("error"), vec![7u8; 1000]);
}

#[test]
fn set_times() {
    let mut disk = blank_disk();
    disk.create("/T").expect("error");
    disk.set_times("/T", 1_000_000_000, 1_000_000_100).expect("error");
    let attrs = disk.getattr("/T").expect("error");
    assert_eq!(attrs.atime, 1_000_000_000);
    assert_eq!(attrs.mtime, 1_000_000_100);
}
