//! Snapshot store: a sparse, region-based view of the target's address space.
//!
//! Two on-disk forms are accepted:
//! - a directory of files named `mem.{start_hex16}.{end_hex16}.bin`, one per
//!   region (other filenames are ignored)
//! - a single file framed as `{start:u64le, end:u64le, bytes[end-start]}`
//!   records until EOF
//!
//! The snapshot is treated as potentially corrupt and partially readable;
//! every read validates bounds before handing out bytes, and bad reads
//! surface as errors, never as signals.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LE};
use memmap2::Mmap;

use crate::addr::MappedAddr;
use crate::error::{Error, Result};

/// One mapped region: a view into some mmap'd snapshot file.
#[derive(Clone)]
struct RegionView {
    start: u64,
    size: u64,
    map: Arc<Mmap>,
    /// Offset of the region's first byte within `map`.
    file_offset: usize,
}

impl RegionView {
    fn bytes(&self) -> &[u8] {
        &self.map[self.file_offset..self.file_offset + self.size as usize]
    }

    fn host_base(&self) -> usize {
        self.map.as_ptr() as usize + self.file_offset
    }
}

/// Memory-mapped snapshot of a paused process's address space.
///
/// Owns every mmap; reads are zero-copy borrows into them. Immutable and
/// shareable across scan threads without synchronization.
pub struct SnapshotStore {
    by_mapped: BTreeMap<u64, RegionView>,
    by_host: BTreeMap<usize, RegionView>,
    total_bytes: u64,
    data_path: PathBuf,
}

impl SnapshotStore {
    /// Open a snapshot from a region directory or a single framed file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data_path = path.as_ref().to_path_buf();
        let mut store = SnapshotStore {
            by_mapped: BTreeMap::new(),
            by_host: BTreeMap::new(),
            total_bytes: 0,
            data_path: data_path.clone(),
        };

        if data_path.is_dir() {
            for entry in std::fs::read_dir(&data_path)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(start) = parse_region_filename(&name.to_string_lossy()) else {
                    continue;
                };
                let file = File::open(entry.path())?;
                let len = file.metadata()?.len();
                if len == 0 {
                    continue;
                }
                let map = Arc::new(unsafe { Mmap::map(&file)? });
                store.insert_region(RegionView {
                    start,
                    size: len,
                    map,
                    file_offset: 0,
                });
            }
        } else {
            let file = File::open(&data_path)?;
            if file.metadata()?.len() > 0 {
                let map = Arc::new(unsafe { Mmap::map(&file)? });
                let mut offset = 0usize;
                while offset < map.len() {
                    if offset + 16 > map.len() {
                        return Err(Error::TruncatedRegionRecord(offset as u64));
                    }
                    let start = LE::read_u64(&map[offset..offset + 8]);
                    let end = LE::read_u64(&map[offset + 8..offset + 16]);
                    offset += 16;
                    let remaining = (map.len() - offset) as u64;
                    if end < start || end - start > remaining {
                        return Err(Error::TruncatedRegionRecord(offset as u64 - 16));
                    }
                    let size = end - start;
                    if size > 0 {
                        store.insert_region(RegionView {
                            start,
                            size,
                            map: Arc::clone(&map),
                            file_offset: offset,
                        });
                    }
                    offset += size as usize;
                }
            }
        }

        if store.by_mapped.is_empty() {
            return Err(Error::EmptySnapshot(data_path.display().to_string()));
        }
        Ok(store)
    }

    fn insert_region(&mut self, view: RegionView) {
        self.total_bytes += view.size;
        self.by_host.insert(view.host_base(), view.clone());
        self.by_mapped.insert(view.start, view);
    }

    /// The path this snapshot was opened from.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn region_count(&self) -> usize {
        self.by_mapped.len()
    }

    fn find_region<T: ?Sized>(&self, addr: MappedAddr<T>) -> Result<&RegionView> {
        let (_, view) = self
            .by_mapped
            .range(..=addr.raw())
            .next_back()
            .ok_or(Error::OutOfRange(addr.cast()))?;
        if addr.raw() >= view.start + view.size {
            return Err(Error::OutOfRange(addr.cast()));
        }
        Ok(view)
    }

    /// Borrow `size` bytes at `addr`. Fails if the range crosses or leaves
    /// a region.
    pub fn read<T: ?Sized>(&self, addr: MappedAddr<T>, size: u64) -> Result<&[u8]> {
        let view = self.find_region(addr)?;
        let offset = addr.raw() - view.start;
        let end = offset.checked_add(size).ok_or(Error::ReadBeyondRegion {
            addr: addr.cast(),
            size,
        })?;
        if end > view.size {
            return Err(Error::ReadBeyondRegion {
                addr: addr.cast(),
                size,
            });
        }
        Ok(&view.bytes()[offset as usize..end as usize])
    }

    /// Borrow from `addr` to the end of its region.
    pub fn read_to_end<T: ?Sized>(&self, addr: MappedAddr<T>) -> Result<&[u8]> {
        let view = self.find_region(addr)?;
        let offset = (addr.raw() - view.start) as usize;
        Ok(&view.bytes()[offset..])
    }

    /// Read a u64 (little-endian) at `addr`.
    pub fn read_u64<T: ?Sized>(&self, addr: MappedAddr<T>) -> Result<u64> {
        Ok(LE::read_u64(self.read(addr, 8)?))
    }

    /// Read a pointer-sized value at `addr` as a mapped address.
    pub fn read_ptr<T: ?Sized, U: ?Sized>(&self, addr: MappedAddr<T>) -> Result<MappedAddr<U>> {
        Ok(MappedAddr::new(self.read_u64(addr)?))
    }

    /// Read a NUL-terminated string starting at `addr`.
    pub fn read_cstr<T: ?Sized>(&self, addr: MappedAddr<T>) -> Result<String> {
        let bytes = self.read_to_end(addr)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    pub fn exists<T: ?Sized>(&self, addr: MappedAddr<T>) -> bool {
        self.find_region(addr).is_ok()
    }

    pub fn exists_range<T: ?Sized>(&self, addr: MappedAddr<T>, size: u64) -> bool {
        match self.find_region(addr) {
            Ok(view) => {
                let offset = addr.raw() - view.start;
                offset.checked_add(size).is_some_and(|end| end <= view.size)
            }
            Err(_) => false,
        }
    }

    /// The enclosing region of `addr` as (start, size).
    pub fn region_for_address<T: ?Sized>(&self, addr: MappedAddr<T>) -> Result<(MappedAddr, u64)> {
        let view = self.find_region(addr)?;
        Ok((MappedAddr::new(view.start), view.size))
    }

    /// All regions as (start, size), ordered by start address.
    pub fn all_regions(&self) -> Vec<(MappedAddr, u64)> {
        self.by_mapped
            .values()
            .map(|v| (MappedAddr::new(v.start), v.size))
            .collect()
    }

    /// Map a pointer into one of our mmaps back to its snapshot address.
    /// Needed by decoders that walk borrowed slices of variable-length
    /// trailing arrays.
    pub fn host_to_mapped(&self, host: *const u8) -> Result<MappedAddr> {
        let host = host as usize;
        let (_, view) = self
            .by_host
            .range(..=host)
            .next_back()
            .ok_or(Error::HostAddressOutOfRange)?;
        let offset = host - view.host_base();
        if offset as u64 >= view.size {
            return Err(Error::HostAddressOutOfRange);
        }
        Ok(MappedAddr::new(view.start + offset as u64))
    }

    /// Address is non-null, aligned, and starts inside a region.
    pub fn obj_valid<T: ?Sized>(&self, addr: MappedAddr<T>, align: u64) -> bool {
        !addr.is_null() && addr.is_aligned(align) && self.exists(addr)
    }

    /// Address is null, or `obj_valid` with the same alignment.
    pub fn obj_valid_or_null<T: ?Sized>(&self, addr: MappedAddr<T>, align: u64) -> bool {
        addr.is_null() || self.obj_valid(addr, align)
    }
}

/// Parse `mem.{start_hex16}.{end_hex16}.bin`, returning the start address.
fn parse_region_filename(name: &str) -> Option<u64> {
    let tokens: Vec<&str> = name.split('.').collect();
    if tokens.len() != 4 || tokens[0] != "mem" || tokens[3] != "bin" {
        return None;
    }
    // The end token is redundant with the file size; it only has to parse.
    u64::from_str_radix(tokens[2], 16).ok()?;
    u64::from_str_radix(tokens[1], 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_dir_snapshot(regions: &[(u64, Vec<u8>)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (start, bytes) in regions {
            let name = format!("mem.{:016x}.{:016x}.bin", start, start + bytes.len() as u64);
            std::fs::write(dir.path().join(name), bytes).unwrap();
        }
        dir
    }

    #[test]
    fn test_parse_region_filename() {
        assert_eq!(
            parse_region_filename("mem.0000000000001000.0000000000002000.bin"),
            Some(0x1000)
        );
        assert_eq!(parse_region_filename("mem.zz.00.bin"), None);
        assert_eq!(parse_region_filename("notes.txt"), None);
        assert_eq!(parse_region_filename("mem.10.20.dat"), None);
    }

    #[test]
    fn test_directory_form_round_trip() {
        let dir = write_dir_snapshot(&[
            (0x1000, vec![0xAA; 0x100]),
            (0x9000, (0..=0xFF).collect::<Vec<u8>>()),
        ]);
        let store = SnapshotStore::open(dir.path()).unwrap();

        assert_eq!(store.region_count(), 2);
        assert_eq!(store.total_bytes(), 0x200);
        assert_eq!(
            store.all_regions(),
            vec![(MappedAddr::new(0x1000), 0x100), (MappedAddr::new(0x9000), 0x100)]
        );
        assert_eq!(store.read(MappedAddr::<()>::new(0x9010), 4).unwrap(), &[0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn test_single_file_form() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.bin");
        let mut f = File::create(&path).unwrap();
        for (start, bytes) in [(0x1000u64, vec![1u8, 2, 3, 4]), (0x2000, vec![9u8; 8])] {
            f.write_all(&start.to_le_bytes()).unwrap();
            f.write_all(&(start + bytes.len() as u64).to_le_bytes()).unwrap();
            f.write_all(&bytes).unwrap();
        }
        drop(f);

        let store = SnapshotStore::open(&path).unwrap();
        assert_eq!(store.region_count(), 2);
        assert_eq!(store.read(MappedAddr::<()>::new(0x1000), 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(store.read(MappedAddr::<()>::new(0x2007), 1).unwrap(), &[9]);
        assert!(store.read(MappedAddr::<()>::new(0x1004), 1).is_err());
    }

    #[test]
    fn test_single_file_truncated_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(&0x1000u64.to_le_bytes()).unwrap();
        f.write_all(&0x2000u64.to_le_bytes()).unwrap();
        f.write_all(&[0u8; 16]).unwrap(); // far fewer than 0x1000 bytes
        drop(f);

        assert!(matches!(
            SnapshotStore::open(&path),
            Err(Error::TruncatedRegionRecord(_))
        ));
    }

    #[test]
    fn test_read_at_region_boundary() {
        let dir = write_dir_snapshot(&[(0x1000, vec![0u8; 0x100])]);
        let store = SnapshotStore::open(dir.path()).unwrap();

        // Ending exactly at the region end succeeds; one byte past fails.
        assert!(store.read(MappedAddr::<()>::new(0x10F0), 0x10).is_ok());
        assert!(store.read(MappedAddr::<()>::new(0x10F0), 0x11).is_err());
        assert!(store.read(MappedAddr::<()>::new(0x1100), 1).is_err());
    }

    #[test]
    fn test_exists_and_exists_range() {
        let dir = write_dir_snapshot(&[(0x1000, vec![0u8; 0x100])]);
        let store = SnapshotStore::open(dir.path()).unwrap();

        assert!(store.exists(MappedAddr::<()>::new(0x1000)));
        assert!(store.exists(MappedAddr::<()>::new(0x10FF)));
        assert!(!store.exists(MappedAddr::<()>::new(0x1100)));
        assert!(!store.exists(MappedAddr::<()>::new(0xFFF)));
        assert!(store.exists_range(MappedAddr::<()>::new(0x1000), 0x100));
        assert!(!store.exists_range(MappedAddr::<()>::new(0x1001), 0x100));
        assert!(!store.exists_range(MappedAddr::<()>::new(0x1000), u64::MAX));
    }

    #[test]
    fn test_region_for_address() {
        let dir = write_dir_snapshot(&[(0x1000, vec![0u8; 0x100]), (0x3000, vec![0u8; 0x40])]);
        let store = SnapshotStore::open(dir.path()).unwrap();

        let (start, size) = store.region_for_address(MappedAddr::<()>::new(0x3020)).unwrap();
        assert_eq!(start, MappedAddr::new(0x3000));
        assert_eq!(size, 0x40);
        assert!(store.region_for_address(MappedAddr::<()>::new(0x2000)).is_err());
    }

    #[test]
    fn test_host_to_mapped() {
        let dir = write_dir_snapshot(&[(0x1000, vec![7u8; 0x100])]);
        let store = SnapshotStore::open(dir.path()).unwrap();

        let bytes = store.read(MappedAddr::<()>::new(0x1010), 8).unwrap();
        let mapped = store.host_to_mapped(bytes.as_ptr()).unwrap();
        assert_eq!(mapped, MappedAddr::new(0x1010));

        let bogus = 0x10usize as *const u8;
        assert!(store.host_to_mapped(bogus).is_err());
    }

    #[test]
    fn test_obj_valid_helpers() {
        let dir = write_dir_snapshot(&[(0x1000, vec![0u8; 0x100])]);
        let store = SnapshotStore::open(dir.path()).unwrap();

        assert!(store.obj_valid(MappedAddr::<()>::new(0x1008), 8));
        assert!(!store.obj_valid(MappedAddr::<()>::new(0x1004), 8));
        assert!(!store.obj_valid(MappedAddr::<()>::NULL, 8));
        assert!(!store.obj_valid(MappedAddr::<()>::new(0x2000), 8));

        // Null or (aligned and in-range).
        assert!(store.obj_valid_or_null(MappedAddr::<()>::NULL, 8));
        assert!(store.obj_valid_or_null(MappedAddr::<()>::new(0x1008), 8));
        assert!(!store.obj_valid_or_null(MappedAddr::<()>::new(0x1004), 8));
        assert!(!store.obj_valid_or_null(MappedAddr::<()>::new(0x2000), 8));
    }

    #[test]
    fn test_read_cstr() {
        let mut bytes = b"type\0garbage".to_vec();
        bytes.resize(0x40, 0);
        let dir = write_dir_snapshot(&[(0x1000, bytes)]);
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(store.read_cstr(MappedAddr::<()>::new(0x1000)).unwrap(), "type");
    }
}
