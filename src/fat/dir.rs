//! Directory entries, 8.3 names, and path resolution.

use crate::{Error, Storage};

use super::VolumeIo;
use super::cache::CacheSize;
use super::table::{Cluster, DirCursor, Lba};

use typenum::consts::U512;

use core::convert::TryInto;
use core::fmt::{self, Debug};

pub enum Attribute {
    ReadOnly = 0x01,
    Hidden = 0x02,
    System = 0x04,
    VolumeId = 0x08,
    Directory = 0x10,
    Archive = 0x20,
}

/// All four low attribute bits at once marks a long-file-name entry, which
/// this driver skips (LFN support is a non-goal).
pub const LONG_NAME: u8 = 0x0F;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributeSet {
    inner: u8,
}

impl AttributeSet {
    pub fn from_bits(inner: u8) -> Self {
        Self { inner }
    }

    pub fn is_dir(&self) -> bool {
        (self.inner & (Attribute::Directory as u8)) != 0
    }

    pub fn is_read_only(&self) -> bool {
        (self.inner & (Attribute::ReadOnly as u8)) != 0
    }

    pub fn is_long_name(&self) -> bool {
        self.inner == LONG_NAME
    }
}

/// An 8.3 name as it sits in a directory entry: 8 name bytes then 3
/// extension bytes, space padded, no dot.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortName([u8; 11]);

impl Default for ShortName {
    fn default() -> Self {
        Self([b' '; 11])
    }
}

impl Debug for ShortName {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0[..8].iter().take_while(|b| **b != b' ') {
            write!(fmt, "{}", *b as char)?;
        }

        if self.0[8] != b' ' {
            write!(fmt, ".")?;
            for b in self.0[8..].iter().take_while(|b| **b != b' ') {
                write!(fmt, "{}", *b as char)?;
            }
        }

        Ok(())
    }
}

/// Upper-cases and squeezes one byte into the 8.3 repertoire; anything
/// outside it becomes `!`.
fn map_char(c: u8) -> u8 {
    let c = c.to_ascii_uppercase();

    match c {
        b'A'..=b'Z' | b'0'..=b'9'
        | b'$' | b'%' | b'-' | b'_' | b'@' | b'~' | b'`'
        | b'!' | b'(' | b')' | b'{' | b'}' | b'^' | b'#' | b'&' => c,
        _ => b'!',
    }
}

impl ShortName {
    pub const fn from_bytes(bytes: [u8; 11]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 11] {
        &self.0
    }

    /// Canonicalizes one path component: the part before the first `.`
    /// becomes the name (truncated to 8), the part after it the extension
    /// (truncated to 3), both upper-cased and space padded.
    pub fn canonicalize(component: &[u8]) -> Self {
        let mut name = [b' '; 11];

        let mut i = 0;
        let mut n = 0;
        while i < component.len() {
            match component[i] {
                b'.' | b'/' | b'\\' | 0 => break,
                c => {
                    if n < 8 {
                        name[n] = map_char(c);
                        n += 1;
                    }
                    i += 1;
                }
            }
        }

        if i < component.len() && component[i] == b'.' {
            i += 1;

            let mut e = 8;
            while i < component.len() {
                match component[i] {
                    b'/' | b'\\' | 0 => break,
                    c => {
                        if e < 11 {
                            name[e] = map_char(c);
                            e += 1;
                        }
                        i += 1;
                    }
                }
            }
        }

        Self(name)
    }
}

/// A decoded 32-byte directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirEntry {
    // Offset: 00
    pub name: ShortName,
    // Offset: 11
    pub attributes: AttributeSet,
    // Offset: 13
    pub creation_time_tenths: u8,
    // Offset: 14
    pub creation_time: u16,
    // Offset: 16
    pub creation_date: u16,
    // Offset: 18
    pub last_access_date: u16,
    // Offset: 20
    pub cluster_high: u16,
    // Offset: 22
    pub write_time: u16,
    // Offset: 24
    pub write_date: u16,
    // Offset: 26
    pub cluster_low: u16,
    // Offset: 28
    pub file_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Exists,
    Deleted,
    End,
}

impl DirEntry {
    pub fn from_arr(arr: [u8; 32]) -> Self {
        macro_rules! e {
            ($ty:tt, $offset:literal) => {
                $ty::from_le_bytes(
                    arr[$offset..($offset + core::mem::size_of::<$ty>())]
                        .try_into()
                        .unwrap(),
                )
            };
        }

        Self {
            name: ShortName(arr[0..11].try_into().unwrap()),
            attributes: AttributeSet { inner: arr[11] },
            creation_time_tenths: arr[13],
            creation_time: e!(u16, 14),
            creation_date: e!(u16, 16),
            last_access_date: e!(u16, 18),
            cluster_high: e!(u16, 20),
            write_time: e!(u16, 22),
            write_date: e!(u16, 24),
            cluster_low: e!(u16, 26),
            file_size: e!(u32, 28),
        }
    }

    pub fn state(&self) -> State {
        match self.name.0[0] {
            0x00 => State::End,
            0xE5 => State::Deleted,
            _ => State::Exists,
        }
    }

    pub fn first_cluster(&self) -> Cluster {
        (self.cluster_high as u32) << 16 | (self.cluster_low as u32)
    }
}

/// The outcome of walking a path.
///
/// A miss on the final component is not an error: `exists` comes back false
/// with `dir_sector` pointing at the directory sector where the scan ended,
/// which is where entry creation will want to allocate a slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Resolved {
    pub exists: bool,
    pub entry: DirEntry,
    /// Where the matched entry sits on disk.
    pub entry_sector: Lba,
    pub entry_offset: u16,
    /// The last directory sector the scan looked at.
    pub dir_sector: Lba,
}

enum Scan {
    Found {
        entry: DirEntry,
        sector: Lba,
        offset: u16,
    },
    End {
        sector: Lba,
    },
}

/// Walks `path` (components split on `/` or `\`; empty and `.` components
/// skipped) from the root directory of the volume `io` is set up for.
pub(crate) fn resolve<S, N>(io: &mut VolumeIo<'_, S, N>, path: &str) -> Result<Resolved, Error>
where
    S: Storage<SECTOR_SIZE = U512>,
    N: CacheSize,
{
    let mut components = path
        .split(|c| c == '/' || c == '\\')
        .filter(|c| !c.is_empty() && *c != ".")
        .peekable();

    if components.peek().is_none() {
        return Err(Error::NotFound);
    }

    let mut cursor = DirCursor::root(&io.geom);

    loop {
        let component = match components.next() {
            Some(c) => c,
            None => return Err(Error::NotFound),
        };
        let target = ShortName::canonicalize(component.as_bytes());
        let terminal = components.peek().is_none();

        match scan_directory(io, &mut cursor, &target)? {
            Scan::Found { entry, sector, offset } => {
                if terminal {
                    return Ok(Resolved {
                        exists: true,
                        entry,
                        entry_sector: sector,
                        entry_offset: offset,
                        dir_sector: sector,
                    });
                }

                if !entry.attributes.is_dir() {
                    return Err(Error::NotADirectory);
                }

                cursor = DirCursor::at_cluster(&io.geom, entry.first_cluster());
            }

            Scan::End { sector } => {
                return if terminal {
                    Ok(Resolved {
                        exists: false,
                        entry: DirEntry::default(),
                        entry_sector: 0,
                        entry_offset: 0,
                        dir_sector: sector,
                    })
                } else {
                    Err(Error::NotFound)
                };
            }
        }
    }
}

/// Scans one directory for `target`, sector by sector through the data
/// cache, until a match, the 0x00 end-of-directory marker, or the directory
/// itself runs out.
fn scan_directory<S, N>(
    io: &mut VolumeIo<'_, S, N>,
    cursor: &mut DirCursor,
    target: &ShortName,
) -> Result<Scan, Error>
where
    S: Storage<SECTOR_SIZE = U512>,
    N: CacheSize,
{
    let mut last_sector = 0;

    loop {
        let sector = match cursor.sector() {
            Some(s) => s,
            None => return Ok(Scan::End { sector: last_sector }),
        };
        last_sector = sector;

        // None: keep scanning. Some(None): hit the end marker.
        let outcome = {
            let slot = io.data_cache.get(io.storage, sector)?;
            let bytes = slot.bytes();

            let mut outcome = None;
            for offset in (0..512).step_by(32) {
                let arr: [u8; 32] = bytes[offset..offset + 32]
                    .try_into()
                    .map_err(|_| Error::BadFormat)?;
                let entry = DirEntry::from_arr(arr);

                match entry.state() {
                    State::End => {
                        outcome = Some(None);
                        break;
                    }
                    State::Deleted => continue,
                    State::Exists => {}
                }

                // Long-name entries store UCS-2 fragments where the name
                // field would be; never worth comparing.
                if entry.attributes.is_long_name() {
                    continue;
                }

                if entry.name == *target {
                    outcome = Some(Some((entry, offset as u16)));
                    break;
                }
            }

            outcome
        };

        match outcome {
            Some(Some((entry, offset))) => {
                return Ok(Scan::Found { entry, sector, offset });
            }
            Some(None) => return Ok(Scan::End { sector }),
            None => io.advance_dir(cursor)?,
        }
    }
}

#[cfg(test)]
mod name_tests {
    use super::*;

    fn canon(s: &str) -> [u8; 11] {
        *ShortName::canonicalize(s.as_bytes()).as_bytes()
    }

    #[test]
    fn pads_and_uppercases() {
        assert_eq!(&canon("foo.exe"), b"FOO     EXE");
        assert_eq!(&canon("bin"), b"BIN        ");
        assert_eq!(&canon("x.c"), b"X       C  ");
    }

    #[test]
    fn truncates_both_halves() {
        assert_eq!(&canon("ALongFileName.json"), b"ALONGFILJSO");
    }

    #[test]
    fn squeezes_out_of_repertoire_characters() {
        assert_eq!(&canon("a b+c.d?"), b"A!B!C   D! ");
    }

    #[test]
    fn permitted_punctuation_survives() {
        assert_eq!(&canon("$%-_@~`!(){}^#&"), b"$%-_@~`!   ");
    }

    #[test]
    fn extension_does_not_restart_at_later_dots() {
        assert_eq!(&canon("a.b.c"), b"A       B!C");
    }

    #[test]
    fn canonical_names_are_fixed_points() {
        for name in &["foo.exe", "ALongFileName.json", "x.c", "bin", "UPPER.TXT"] {
            let first = ShortName::canonicalize(name.as_bytes());

            // Render back to NAME.EXT form and canonicalize again.
            let mut rendered = Vec::new();
            rendered.extend(first.as_bytes()[..8].iter().filter(|b| **b != b' '));
            if first.as_bytes()[8] != b' ' {
                rendered.push(b'.');
                rendered.extend(first.as_bytes()[8..].iter().filter(|b| **b != b' '));
            }

            assert_eq!(ShortName::canonicalize(&rendered), first);
        }
    }

    #[test]
    fn debug_renders_with_the_dot() {
        assert_eq!(format!("{:?}", ShortName::canonicalize(b"foo.exe")), "FOO.EXE");
        assert_eq!(format!("{:?}", ShortName::canonicalize(b"bin")), "BIN");
    }
}

#[cfg(test)]
mod resolve_tests {
    use super::*;
    use crate::fat::boot_sector::{FatGeometry, FatVariant};
    use crate::fat::cache::SectorCache;
    use crate::testing::TestDisk;

    use typenum::consts::U4;

    fn geometry() -> FatGeometry {
        FatGeometry {
            variant: FatVariant::Fat16 { root_dir_sector: 68 },
            sectors_per_cluster: 2,
            reserved_sectors: 1,
            num_fats: 1,
            fat_size_in_sectors: 64,
            fat_start_sector: 1,
            root_dir_sectors: 3,
            first_data_sector: 71,
            num_clusters: 10_000,
        }
    }

    fn entry_bytes(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
        let mut e = [0u8; 32];
        e[0..11].copy_from_slice(name);
        e[11] = attr;
        e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        e[28..32].copy_from_slice(&size.to_le_bytes());
        e
    }

    fn put_entry(disk: &mut TestDisk, sector: u64, slot: usize, bytes: &[u8; 32]) {
        let offset = (sector * 512) as usize + slot * 32;
        disk.bytes[offset..offset + 32].copy_from_slice(bytes);
    }

    fn disk() -> TestDisk {
        let mut d = TestDisk::new(256);

        // Root: a deleted entry, an LFN entry, a file, and a subdirectory.
        let mut deleted = entry_bytes(b"OLD     TXT", 0x20, 5, 9);
        deleted[0] = 0xE5;
        put_entry(&mut d, 68, 0, &deleted);
        put_entry(&mut d, 68, 1, &entry_bytes(b"HELLO   TXT", LONG_NAME, 0, 0));
        put_entry(&mut d, 68, 2, &entry_bytes(b"HELLO   TXT", 0x20, 2, 13));
        put_entry(&mut d, 68, 3, &entry_bytes(b"SUBDIR     ", 0x10, 3, 0));

        // The subdirectory (cluster 3 => sector 73) holds one source file.
        put_entry(&mut d, 73, 0, &entry_bytes(b"X       C  ", 0x20, 4, 99));

        d
    }

    macro_rules! io {
        ($io:ident over $disk:ident) => {
            let mut data_cache = SectorCache::<U4>::new();
            let mut fat_cache = SectorCache::<U4>::new();
            let mut $io = VolumeIo {
                storage: &mut $disk,
                data_cache: &mut data_cache,
                fat_cache: &mut fat_cache,
                geom: geometry(),
            };
        };
    }

    #[test]
    fn finds_a_file_in_the_root() {
        let mut d = disk();
        io!(io over d);

        let r = resolve(&mut io, "/HELLO.TXT").unwrap();

        assert!(r.exists);
        assert_eq!(r.entry.file_size, 13);
        assert_eq!(r.entry.first_cluster(), 2);
        assert_eq!(r.entry_sector, 68);
        // Slot 2: past the deleted entry and the long-name entry.
        assert_eq!(r.entry_offset, 64);
    }

    #[test]
    fn case_and_separators_do_not_matter() {
        let mut d = disk();
        io!(io over d);

        assert!(resolve(&mut io, "hello.txt").unwrap().exists);
        assert!(resolve(&mut io, "\\SUBDIR\\x.c").unwrap().exists);
        assert!(resolve(&mut io, "./subdir/X.C").unwrap().exists);
    }

    #[test]
    fn descends_into_subdirectories() {
        let mut d = disk();
        io!(io over d);

        let r = resolve(&mut io, "/SUBDIR/X.C").unwrap();

        assert!(r.exists);
        assert_eq!(r.entry.file_size, 99);
        assert_eq!(r.entry_sector, 73);
    }

    #[test]
    fn a_miss_reports_the_directory_it_ended_in() {
        let mut d = disk();
        io!(io over d);

        let r = resolve(&mut io, "/MISSING.TXT").unwrap();

        assert!(!r.exists);
        assert_eq!(r.dir_sector, 68);
    }

    #[test]
    fn deleted_entries_do_not_match() {
        let mut d = disk();
        io!(io over d);

        assert!(!resolve(&mut io, "/OLD.TXT").unwrap().exists);
    }

    #[test]
    fn files_in_the_middle_of_a_path_fail() {
        let mut d = disk();
        io!(io over d);

        assert_eq!(
            resolve(&mut io, "/HELLO.TXT/X.C").unwrap_err(),
            Error::NotADirectory,
        );
    }

    #[test]
    fn missing_intermediate_directories_fail() {
        let mut d = disk();
        io!(io over d);

        assert_eq!(resolve(&mut io, "/NOPE/X.C").unwrap_err(), Error::NotFound);
    }

    #[test]
    fn an_empty_path_is_rejected() {
        let mut d = disk();
        io!(io over d);

        assert_eq!(resolve(&mut io, "").unwrap_err(), Error::NotFound);
        assert_eq!(resolve(&mut io, "/").unwrap_err(), Error::NotFound);
        assert_eq!(resolve(&mut io, "./").unwrap_err(), Error::NotFound);
    }
}
