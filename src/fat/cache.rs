//! Home of the `SectorCache` type; that which reads and writes to `Storage`
//! flow through.
//!
//! A mounted volume keeps two of these: one for file/directory data and one
//! for FAT metadata, so a burst of data traffic can't wash the FAT sectors
//! (which get touched on every cluster hop) out of cache.

use crate::{Error, Storage};
use crate::storage::SectorBuf;

use generic_array::{ArrayLength, GenericArray};
use typenum::consts::U512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Does not hold a sector.
    Invalid,
    /// Holds a sector, unmodified; can be freely evicted.
    Valid,
    /// Holds a sector with modifications the device hasn't seen yet.
    Dirty,
}

/// One cached sector.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSlot {
    state: SlotState,
    lba: u64,
    buf: SectorBuf,
}

impl Default for CacheSlot {
    fn default() -> Self {
        Self {
            state: SlotState::Invalid,
            lba: 0,
            buf: SectorBuf::default(),
        }
    }
}

impl CacheSlot {
    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn lba(&self) -> u64 {
        self.lba
    }

    pub fn bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Mutable access to the cached sector. The slot is marked dirty up
    /// front; the contents are authoritative from here until write-back.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.state = SlotState::Dirty;
        self.buf.as_mut_slice()
    }
}

/// Anything that can size a cache: a typenum unsigned that can back both the
/// slot array and the recency list.
pub trait CacheSize: ArrayLength<CacheSlot> + ArrayLength<usize> {}
impl<T: ArrayLength<CacheSlot> + ArrayLength<usize>> CacheSize for T {}

/// A small fully-associative write-back sector cache.
///
/// Recency is an explicit index list: `mru[0]` is the most recently touched
/// slot, `mru[N-1]` is the eviction candidate. The list is always a
/// permutation of `0..N`.
#[derive(Debug, Clone)]
pub struct SectorCache<N: CacheSize> {
    slots: GenericArray<CacheSlot, N>,
    mru: GenericArray<usize, N>,
}

impl<N: CacheSize> Default for SectorCache<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: CacheSize> SectorCache<N> {
    pub fn new() -> Self {
        let mut mru: GenericArray<usize, N> = GenericArray::default();
        for (i, m) in mru.as_mut_slice().iter_mut().enumerate() {
            *m = i;
        }

        Self { slots: GenericArray::default(), mru }
    }

    /// Returns the slot holding `lba`, filling (and possibly evicting) as
    /// needed. The returned slot always holds the requested sector.
    pub fn get<'a, S: Storage<SECTOR_SIZE = U512>>(
        &'a mut self,
        storage: &mut S,
        lba: u64,
    ) -> Result<&'a mut CacheSlot, Error> {
        let idx = match self
            .slots
            .as_slice()
            .iter()
            .position(|s| s.state != SlotState::Invalid && s.lba == lba)
        {
            Some(hit) => hit,
            // Miss: take the least recently used slot.
            None => self.mru.as_slice().last().copied().unwrap_or(0),
        };

        self.touch(idx);

        let slot = &mut self.slots.as_mut_slice()[idx];

        if slot.state != SlotState::Invalid && slot.lba == lba {
            log::trace!("cache hit for sector {}", lba);
            return Ok(slot);
        }

        if slot.state == SlotState::Dirty {
            log::trace!("write-back of sector {} to make room for {}", slot.lba, lba);
            if let Err(e) = storage.write_sector(slot.lba, &slot.buf) {
                // The modified contents are gone; the slot can't stand in
                // for its old sector anymore either.
                log::warn!("write-back of sector {} failed: {:?}", slot.lba, e);
                slot.state = SlotState::Invalid;
                return Err(Error::Io);
            }
        }

        slot.lba = lba;
        slot.state = SlotState::Invalid;

        log::trace!("cache fill for sector {}", lba);
        storage.read_sector(lba, &mut slot.buf).map_err(|e| {
            log::warn!("read of sector {} failed: {:?}", lba, e);
            Error::Io
        })?;
        slot.state = SlotState::Valid;

        Ok(slot)
    }

    /// Writes every dirty slot back to the device. Slots that flush cleanly
    /// become `Valid`; a failed slot stays dirty and the error surfaces.
    pub fn flush<S: Storage<SECTOR_SIZE = U512>>(
        &mut self,
        storage: &mut S,
    ) -> Result<(), Error> {
        for slot in self.slots.as_mut_slice().iter_mut() {
            if slot.state == SlotState::Dirty {
                storage.write_sector(slot.lba, &slot.buf).map_err(|e| {
                    log::warn!("flush of sector {} failed: {:?}", slot.lba, e);
                    Error::Io
                })?;
                slot.state = SlotState::Valid;
            }
        }

        Ok(())
    }

    /// Move `idx` to the front of the recency list, sliding everything that
    /// was ahead of it back one place.
    fn touch(&mut self, idx: usize) {
        let mru = self.mru.as_mut_slice();

        if let Some(pos) = mru.iter().position(|&i| i == idx) {
            for j in (1..=pos).rev() {
                mru[j] = mru[j - 1];
            }
            mru[0] = idx;
        }
    }

    #[cfg(test)]
    pub(crate) fn recency_order(&self) -> &[usize] {
        self.mru.as_slice()
    }

    #[cfg(test)]
    pub(crate) fn slot_states(&self) -> impl Iterator<Item = (SlotState, u64)> + '_ {
        self.slots.as_slice().iter().map(|s| (s.state, s.lba))
    }
}
