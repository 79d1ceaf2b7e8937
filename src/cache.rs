//! Packet cache with scoped locks
//!
//! The drive loop addresses packets by logical offset and may revisit the
//! same packet many times while channels drain at different rates. The cache
//! keeps whole packets in a fixed number of slots and hands out [`PacketLock`]
//! guards; a slot can only be evicted while no guard for it is alive.
//!
//! Scheduling is single-threaded cooperative, so there is no interior
//! synchronization: pinning is simply the guard's `Rc` clone of the slot
//! buffer.

use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

use crate::packet::{PacketHeader, PACKET_HEADER_SIZE};
use crate::paged_file::PagedFile;
use crate::{Error, Result};

/// Default number of packet slots a reader allocates
pub const DEFAULT_CACHE_SLOTS: usize = 32;

/// One cached packet, shared between the cache and any outstanding locks.
#[derive(Debug)]
pub struct PacketBuffer {
    logical_offset: u64,
    data: Vec<u8>,
}

/// Scoped pin on a cached packet.
///
/// The payload stays resident for as long as the guard is alive; dropping it
/// (on any exit path, including error returns) releases the pin.
#[derive(Debug)]
pub struct PacketLock {
    buffer: Rc<PacketBuffer>,
}

impl PacketLock {
    /// Logical offset of the pinned packet.
    pub fn logical_offset(&self) -> u64 {
        self.buffer.logical_offset
    }

    /// Full packet bytes, header included.
    pub fn packet(&self) -> &[u8] {
        &self.buffer.data
    }
}

struct Slot {
    logical_offset: u64,
    buffer: Rc<PacketBuffer>,
    last_used: u64,
}

/// Fixed-capacity LRU cache of packets keyed by logical offset.
pub struct PacketCache {
    file: Rc<RefCell<PagedFile>>,
    slots: Vec<Slot>,
    capacity: usize,
    use_tick: u64,
}

impl PacketCache {
    /// Create a cache with `capacity` slots reading through `file`.
    pub fn new(file: Rc<RefCell<PagedFile>>, capacity: usize) -> Self {
        Self {
            file,
            slots: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            use_tick: 0,
        }
    }

    /// Pin the packet at `logical_offset`, fetching it if necessary.
    pub fn lock(&mut self, logical_offset: u64) -> Result<PacketLock> {
        self.use_tick += 1;

        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.logical_offset == logical_offset)
        {
            slot.last_used = self.use_tick;
            trace!("packet cache hit at logical offset {logical_offset}");
            return Ok(PacketLock {
                buffer: Rc::clone(&slot.buffer),
            });
        }

        let buffer = Rc::new(Self::fetch(&self.file, logical_offset)?);
        let lock = PacketLock {
            buffer: Rc::clone(&buffer),
        };

        if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                logical_offset,
                buffer,
                last_used: self.use_tick,
            });
            return Ok(lock);
        }

        // Evict the least recently used slot nobody is holding
        let victim = self
            .slots
            .iter_mut()
            .filter(|slot| Rc::strong_count(&slot.buffer) == 1)
            .min_by_key(|slot| slot.last_used)
            .ok_or_else(|| Error::Internal {
                context: "packet cache exhausted, all slots pinned".into(),
                detail: logical_offset,
            })?;

        trace!(
            "packet cache evicting logical offset {} for {logical_offset}",
            victim.logical_offset
        );
        victim.logical_offset = logical_offset;
        victim.buffer = buffer;
        victim.last_used = self.use_tick;
        Ok(lock)
    }

    /// Number of slots currently pinned by outstanding locks.
    pub fn pinned_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| Rc::strong_count(&slot.buffer) > 1)
            .count()
    }

    /// Drop every unpinned slot's buffer.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    fn fetch(file: &Rc<RefCell<PagedFile>>, logical_offset: u64) -> Result<PacketBuffer> {
        let mut file = file.borrow_mut();

        let mut header_bytes = [0u8; PACKET_HEADER_SIZE];
        file.read_at_logical(logical_offset, &mut header_bytes)?;
        let header = PacketHeader::parse(&header_bytes)?;

        let mut data = vec![0u8; header.logical_length as usize];
        file.read_at_logical(logical_offset, &mut data)?;

        trace!(
            "fetched packet type {} ({} bytes) at logical offset {logical_offset}",
            header.packet_type,
            header.logical_length
        );
        Ok(PacketBuffer {
            logical_offset,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DATA_PACKET, EMPTY_PACKET};
    use crate::paged_file::PagedWriter;
    use std::path::Path;

    fn raw_packet(packet_type: u8, length: usize, fill: u8) -> Vec<u8> {
        assert!(length % 4 == 0 && length >= 4);
        let mut packet = vec![fill; length];
        packet[0] = packet_type;
        packet[1] = 0;
        packet[2..4].copy_from_slice(&((length - 1) as u16).to_le_bytes());
        packet
    }

    fn write_packets(path: &Path, packets: &[Vec<u8>]) -> Vec<u64> {
        let mut writer = PagedWriter::create(path).unwrap();
        let mut offsets = Vec::new();
        for packet in packets {
            offsets.push(writer.logical_length());
            writer.write(packet).unwrap();
        }
        writer.finish().unwrap();
        offsets
    }

    fn open_cache(path: &Path, capacity: usize) -> PacketCache {
        let file = Rc::new(RefCell::new(PagedFile::open(path).unwrap()));
        PacketCache::new(file, capacity)
    }

    #[test]
    fn test_hit_returns_same_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let offsets = write_packets(&path, &[raw_packet(DATA_PACKET, 16, 0xAA)]);

        let mut cache = open_cache(&path, 4);
        let a = cache.lock(offsets[0]).unwrap();
        let b = cache.lock(offsets[0]).unwrap();
        assert!(Rc::ptr_eq(&a.buffer, &b.buffer));
        assert_eq!(a.packet().len(), 16);
        assert_eq!(cache.pinned_slots(), 1);

        drop(a);
        drop(b);
        assert_eq!(cache.pinned_slots(), 0);
    }

    #[test]
    fn test_lru_eviction_skips_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evict.bin");
        let offsets = write_packets(
            &path,
            &[
                raw_packet(DATA_PACKET, 16, 1),
                raw_packet(EMPTY_PACKET, 16, 2),
                raw_packet(DATA_PACKET, 16, 3),
            ],
        );

        let mut cache = open_cache(&path, 2);
        let pinned = cache.lock(offsets[0]).unwrap();
        let second = cache.lock(offsets[1]).unwrap();
        drop(second);

        // Slot for offsets[1] is the only evictable one
        let third = cache.lock(offsets[2]).unwrap();
        assert_eq!(third.logical_offset(), offsets[2]);
        assert_eq!(pinned.packet()[4], 1);
        assert_eq!(cache.pinned_slots(), 2);
    }

    #[test]
    fn test_exhausted_when_all_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.bin");
        let offsets = write_packets(
            &path,
            &[raw_packet(DATA_PACKET, 16, 1), raw_packet(DATA_PACKET, 16, 2)],
        );

        let mut cache = open_cache(&path, 1);
        let _held = cache.lock(offsets[0]).unwrap();
        let err = cache.lock(offsets[1]).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }), "actual error: {err:?}");
    }

    #[test]
    fn test_fetch_rejects_garbage_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.bin");
        let offsets = write_packets(&path, &[raw_packet(DATA_PACKET, 16, 0x77)]);

        // An offset inside the packet lands on payload bytes, which do not
        // parse as a packet header
        let mut cache = open_cache(&path, 2);
        let err = cache.lock(offsets[0] + 4).unwrap_err();
        assert!(matches!(err, Error::BadPacket { .. }), "actual error: {err:?}");
    }
}
