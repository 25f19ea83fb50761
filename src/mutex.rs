//! Serializing the handle for callers with threads.
//!
//! The driver itself is strictly single-threaded: every operation takes
//! `&mut FatFs` and the caller must serialize. When std is around, this
//! wrapper does the serializing with a plain `std::sync::Mutex` so a mounted
//! volume can be parked in a `static` or shared between threads.
//!
//! Nothing here implements poisoning recovery! If you panic while inside a
//! critical section, the next lock attempt panics too.

use crate::{FatFs, Storage};
use crate::fat::cache::CacheSize;

use typenum::consts::U512;

use std::sync::Mutex;

pub struct SharedFatFs<S, N>
where
    S: Storage<SECTOR_SIZE = U512>,
    N: CacheSize,
{
    inner: Mutex<FatFs<S, N>>,
}

impl<S, N> SharedFatFs<S, N>
where
    S: Storage<SECTOR_SIZE = U512>,
    N: CacheSize,
{
    pub fn new(fs: FatFs<S, N>) -> Self {
        Self { inner: Mutex::new(fs) }
    }

    /// Runs `func` with exclusive access to the volume.
    pub fn with<F: FnOnce(&mut FatFs<S, N>) -> R, R>(&self, func: F) -> R {
        let mut inner = self.inner.lock().unwrap();

        func(&mut *inner)
    }

    /// Gets the volume back out (e.g. to `unmount` it).
    pub fn into_inner(self) -> FatFs<S, N> {
        self.inner.into_inner().unwrap()
    }
}

#[cfg(test)]
mod mutex_tests {
    use super::*;
    use crate::OpenFlags;
    use crate::testing::sample_volume;

    use std::sync::Arc;

    #[test]
    fn critical_sections_from_multiple_threads() {
        let shared = Arc::new(SharedFatFs::new(sample_volume()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    shared.with(|fs| {
                        let fd = fs.open("/HELLO.TXT", OpenFlags::RDONLY)?;
                        let mut buf = [0u8; 32];
                        let n = fs.read(fd, &mut buf)?;
                        fs.close(fd)?;
                        Ok::<_, crate::Error>(buf[..n].to_vec())
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), b"Hello, world!");
        }
    }

    #[test]
    fn the_volume_comes_back_out() {
        let shared = SharedFatFs::new(sample_volume());
        let mut fs = shared.into_inner();

        assert!(fs.stat("/HELLO.TXT").is_ok());
    }
}
