/// Cipher-key records owned by a BSS entry.
///
/// The key slots hold whatever the handshake derives: slot 0 the pairwise
/// key, slot 1 the group key. Material is wiped before the backing memory
/// is released, on every destruction path.
use core::sync::atomic::{AtomicU64, Ordering};

/// Number of key slots per BSS entry.
pub const KEY_SLOTS: usize = 4;

/// Pairwise transient key slot.
pub const SLOT_PAIRWISE: usize = 0;
/// Group temporal key slot.
pub const SLOT_GROUP: usize = 1;

/// Longest key material the slots accept (256-bit).
pub const KEY_MAX_LEN: usize = 32;

/// CCMP packet numbers are 48 bits.
pub const PN_MASK: u64 = 0xFFFF_FFFF_FFFF;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyFlags: u8 {
        /// Installed for the transmit direction.
        const TX = 1 << 0;
        /// Protects unicast traffic.
        const PAIRWISE = 1 << 1;
        /// Protects group-addressed traffic.
        const GROUP = 1 << 2;
    }
}

/// One installed cipher key.
pub struct Key {
    pub flags: KeyFlags,
    pub id: u8,
    len: usize,
    material: [u8; KEY_MAX_LEN],
    /// Next transmit packet number, post-incremented per protected frame.
    tx_pn: AtomicU64,
    /// Highest packet number accepted on receive.
    replay: AtomicU64,
}

impl Key {
    pub fn new(flags: KeyFlags, id: u8, material: &[u8]) -> Option<Key> {
        if material.is_empty() || material.len() > KEY_MAX_LEN {
            return None;
        }
        let mut buf = [0u8; KEY_MAX_LEN];
        buf[..material.len()].copy_from_slice(material);
        Some(Key {
            flags,
            id,
            len: material.len(),
            material: buf,
            tx_pn: AtomicU64::new(1),
            replay: AtomicU64::new(0),
        })
    }

    pub fn material(&self) -> &[u8] {
        &self.material[..self.len]
    }

    /// Allocates the next 48-bit transmit packet number.
    pub fn next_tx_pn(&self) -> u64 {
        self.tx_pn.fetch_add(1, Ordering::Relaxed) & PN_MASK
    }

    /// Replay check: a received packet number is accepted only if strictly
    /// greater than every previously accepted one, and the window advances
    /// only on acceptance.
    pub fn accept_rx_pn(&self, pn: u64) -> bool {
        let pn = pn & PN_MASK;
        let mut current = self.replay.load(Ordering::Acquire);
        loop {
            if pn <= current {
                return false;
            }
            match self.replay.compare_exchange_weak(
                current,
                pn,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    #[cfg(test)]
    pub fn replay_counter(&self) -> u64 {
        self.replay.load(Ordering::Acquire)
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        // Volatile wipe so the zeroing of dead key material is not elided.
        for b in self.material.iter_mut() {
            unsafe { core::ptr::write_volatile(b, 0) };
        }
        self.len = 0;
    }
}

impl core::fmt::Debug for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("Key")
            .field("flags", &self.flags)
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}
