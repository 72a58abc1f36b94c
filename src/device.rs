/// Collaborator interfaces.
///
/// The core sits between three externally supplied pieces: the radio driver
/// below it, the network stack above it, and the cipher/authenticator
/// module beside it. Each is reached through a trait object handed to the
/// link at construction; fakes implementing these live in `test_utils`.
use std::sync::Arc;

use crate::bss::BssEntry;
use crate::error::{DriverStatus, Result};
use crate::frame::MacAddr;
use crate::ie::PhyMode;
use crate::link::Link;
use crate::state::LinkState;

/// What the driver needs to know about the BSS a state change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BssDescriptor {
    pub bssid: MacAddr,
    pub channel: u8,
    pub beacon_interval: u16,
}

/// Media state reported to the network stack when the link comes up or
/// goes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub up: bool,
    /// Negotiated speed; the top common rate times 500 kbit/s.
    pub speed_kbps: u32,
    pub mode: Option<PhyMode>,
}

impl LinkStatus {
    pub fn down() -> Self {
        Self { up: false, speed_kbps: 0, mode: None }
    }
}

/// The radio driver's control surface.
///
/// Calls may arrive on any thread at or below dispatch level; the core
/// serialises `set_state` so the driver observes exactly one call per
/// transition.
pub trait DriverOps: Send + Sync {
    /// Hands a batch of fully framed packets to the hardware. A
    /// `ResourceInUse` return means "too busy": the core frees the batch
    /// and reports success to its caller.
    fn send(&self, frames: Vec<Vec<u8>>) -> core::result::Result<(), DriverStatus>;

    fn set_channel(&self, channel: u8) -> core::result::Result<(), DriverStatus>;

    fn set_state(
        &self,
        state: LinkState,
        bss: Option<&BssDescriptor>,
    ) -> core::result::Result<(), DriverStatus>;
}

/// The network stack's receive surface.
pub trait NetworkOps: Send + Sync {
    /// Delivers one decapsulated layer-3 payload for the given EtherType.
    fn deliver(&self, ethertype: u16, src: MacAddr, dst: MacAddr, payload: &[u8]);

    /// Reports media connect/disconnect and the negotiated speed.
    fn link_status(&self, status: LinkStatus);
}

/// The CCMP primitive and EAPOL authenticator submodule.
///
/// The handshake session delivers derived keys by calling
/// [`Link::install_key`] and signals completion through
/// [`Link::handshake_complete`].
pub trait CipherOps: Send + Sync {
    /// Sets up an authenticator session for the four-way handshake on the
    /// given BSS. Called on entering Associated with a pairwise cipher,
    /// under the link lock: implementations must not call back into the
    /// link from inside this method.
    fn init_handshake(&self, link: &Link, bss: &Arc<BssEntry>) -> Result<()>;

    /// Tears the authenticator session down (handshake finished or the
    /// connection attempt was abandoned).
    fn teardown(&self, bss: &Arc<BssEntry>);

    /// Encrypts a fully framed data packet in place: inserts the cipher
    /// header after the MAC header, appends the MIC, consumes one transmit
    /// packet number from the installed key.
    fn encrypt(&self, bss: &Arc<BssEntry>, frame: &mut Vec<u8>) -> Result<()>;

    /// Decrypts a received protected frame in place, enforcing the replay
    /// window of the matching key. Failure drops the frame.
    fn decrypt(&self, bss: &Arc<BssEntry>, frame: &mut Vec<u8>) -> Result<()>;

    /// Feeds one received EAPOL message to the authenticator session.
    fn eapol(&self, link: &Link, bss: &Arc<BssEntry>, body: &[u8]);
}
