//! A small FAT16/FAT32 volume reader.
//!
//! The device is abstracted behind the [`Storage`] trait (one 512-byte sector
//! per transfer); everything above it lives in [`fat`]: partition discovery,
//! the sector caches, FAT chain traversal, path resolution, and the
//! POSIX-flavoured descriptor layer.
//!
//! Reading is fully supported. The write path is reserved: `write` (and
//! opening a file for writing) currently fails, but the plumbing that the
//! write path will need (dirty sectors, write-back flush, directory-slot
//! tracking) is already in place.

// Mark the crate as no_std unless the `std` feature is enabled (tests always
// get std).
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

#[allow(unused_extern_crates)]
extern crate core; // makes rls actually look into the standard library (hack)

macro_rules! using_std { ($($i:item)*) => ($(#[cfg(feature = "std")]$i)*) }

pub mod storage;
pub use storage::Storage;

pub mod gpt;
pub mod mbr;

pub mod fat;
pub use fat::{FatFs, Partition, PartitionKind};
pub use fat::file::{OpenFlags, Stat, Timestamp, Whence};

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        pub mod mutex;
        pub use mutex::SharedFatFs;
    }
}

#[cfg(test)]
pub(crate) mod testing;

/// Everything a volume operation can fail with.
///
/// The underlying device's own error values are not carried here; they are
/// logged at the point of failure and collapse to [`Error::Io`] so that the
/// driver's surface stays independent of the storage implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The storage backend reported a read or write failure.
    Io,
    /// A signature, jump instruction, sector size, or geometry field did not
    /// validate.
    BadFormat,
    /// Discovery finished without a usable FAT partition.
    NoFatVolume,
    /// A FAT chain ended early, pointed at a free cluster, or pointed at a
    /// cluster marked bad.
    CorruptChain,
    /// Path resolution ran out of directory without a match.
    NotFound,
    /// A non-final path component named something that is not a directory.
    NotADirectory,
    /// The final path component named a directory where a file was required.
    IsDirectory,
    /// The descriptor is out of range or not open.
    BadDescriptor,
    /// The partition index is out of range or not a FAT partition.
    BadPartition,
    /// The active partition cannot change while descriptors are open.
    PartitionBusy,
    /// `open` needs at least one of `RDONLY`/`WRONLY`.
    BadFlags,
    /// The descriptor was not opened with the access the operation needs.
    PermissionDenied,
    /// The seek target is negative or past the end of the file.
    SeekOutOfRange,
    /// Every descriptor slot is in use.
    OutOfDescriptors,
    /// The write path is not implemented yet.
    ReadOnly,
}

using_std! {
    use std::fmt;

    impl fmt::Display for Error {
        fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
            use Error::*;
            let msg = match self {
                Io => "storage backend error",
                BadFormat => "on-disk structure failed validation",
                NoFatVolume => "no FAT partition found",
                CorruptChain => "corrupt FAT chain",
                NotFound => "no such file or directory",
                NotADirectory => "path component is not a directory",
                IsDirectory => "path names a directory",
                BadDescriptor => "bad file descriptor",
                BadPartition => "bad partition index",
                PartitionBusy => "open descriptors pin the active partition",
                BadFlags => "open flags select no access mode",
                PermissionDenied => "descriptor lacks the required access",
                SeekOutOfRange => "seek target outside the file",
                OutOfDescriptors => "file descriptor table is full",
                ReadOnly => "write support is not implemented",
            };

            write!(fmt, "{}", msg)
        }
    }

    impl std::error::Error for Error { }
}
