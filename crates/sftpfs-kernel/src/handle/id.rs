//! Handle id allocation.
//!
//! Ids are 32-bit unsigned integers, rendered on the wire as a 4-byte
//! big-endian token. Zero is never issued. An allocator may be shared by
//! every connection of a server or owned by a single connection; either way
//! no two live handles sharing an allocator ever carry the same id.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::vfs::{VfsError, VfsResult};

/// Width of an encoded handle token.
pub const HANDLE_TOKEN_LEN: usize = 4;

/// Identifier of a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u32);

impl HandleId {
    /// Wrap a raw id.
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub fn get(&self) -> u32 {
        self.0
    }

    /// The 4-byte big-endian wire token.
    pub fn encode(&self) -> [u8; HANDLE_TOKEN_LEN] {
        self.0.to_be_bytes()
    }

    /// Parse a wire token. Anything but exactly 4 bytes is a bad message.
    pub fn decode(token: &[u8]) -> VfsResult<Self> {
        let bytes: [u8; HANDLE_TOKEN_LEN] = token.try_into().map_err(|_| {
            VfsError::bad_message(format!(
                "handle token must be {HANDLE_TOKEN_LEN} bytes, got {}",
                token.len()
            ))
        })?;
        Ok(Self(u32::from_be_bytes(bytes)))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues the lowest free id and takes ids back on release.
#[derive(Debug, Clone, Default)]
pub struct HandleIdAllocator {
    in_use: Arc<Mutex<BTreeSet<u32>>>,
}

impl HandleIdAllocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the lowest id not currently in use.
    pub fn allocate(&self) -> VfsResult<HandleLease> {
        let mut in_use = self.in_use.lock();

        // First gap in the ordered set, starting at 1.
        let mut candidate: u32 = 1;
        for &taken in in_use.iter() {
            if taken != candidate {
                break;
            }
            candidate = candidate
                .checked_add(1)
                .ok_or_else(|| VfsError::other("handle ids exhausted"))?;
        }

        in_use.insert(candidate);
        Ok(HandleLease {
            id: HandleId(candidate),
            allocator: self.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Return an id to the pool.
    pub fn release(&self, id: HandleId) {
        self.in_use.lock().remove(&id.0);
    }

    /// Returns true if `id` is currently reserved.
    pub fn is_live(&self, id: HandleId) -> bool {
        self.in_use.lock().contains(&id.0)
    }

    /// Number of reserved ids.
    pub fn live_count(&self) -> usize {
        self.in_use.lock().len()
    }
}

/// A reserved id that goes back to its allocator exactly once.
#[derive(Debug)]
pub struct HandleLease {
    id: HandleId,
    allocator: HandleIdAllocator,
    released: AtomicBool,
}

impl HandleLease {
    /// The reserved id.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Give the id back. Later calls are no-ops.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.allocator.release(self.id);
        }
    }

    /// Returns true once the id has been given back.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let id = HandleId::new(0x0102_0304);
        assert_eq!(id.encode(), [1, 2, 3, 4]);
        assert_eq!(HandleId::decode(&[1, 2, 3, 4]).unwrap(), id);
    }

    #[test]
    fn test_decode_wrong_length_is_bad_message() {
        for token in [&[][..], &[1, 2, 3][..], &[1, 2, 3, 4, 5][..]] {
            let err = HandleId::decode(token).unwrap_err();
            assert!(matches!(err, VfsError::BadMessage(_)), "{err:?}");
        }
    }

    #[test]
    fn test_allocates_lowest_free_id() {
        let alloc = HandleIdAllocator::new();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        let c = alloc.allocate().unwrap();
        assert_eq!((a.id().get(), b.id().get(), c.id().get()), (1, 2, 3));

        b.release();
        let d = alloc.allocate().unwrap();
        assert_eq!(d.id().get(), 2);
        assert_eq!(alloc.live_count(), 3);
    }

    #[test]
    fn test_release_is_idempotent_and_drop_releases() {
        let alloc = HandleIdAllocator::new();
        let lease = alloc.allocate().unwrap();
        let id = lease.id();

        lease.release();
        lease.release();
        assert!(lease.is_released());
        assert!(!alloc.is_live(id));

        // Someone else takes the id; dropping the stale lease must not free it.
        let other = alloc.allocate().unwrap();
        assert_eq!(other.id(), id);
        drop(lease);
        assert!(alloc.is_live(id));

        drop(other);
        assert_eq!(alloc.live_count(), 0);
    }

    #[test]
    fn test_no_collisions_across_threads() {
        let alloc = HandleIdAllocator::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..50).map(|_| alloc.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let leases: Vec<HandleLease> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        let ids: BTreeSet<u32> = leases.iter().map(|l| l.id().get()).collect();
        assert_eq!(ids.len(), 400);
        assert_eq!(alloc.live_count(), 400);
    }
}
