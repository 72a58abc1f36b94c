/// Data path: encapsulation of outbound packets, the pause queue that
/// cooperates with the key handshake, and decapsulation of received data
/// frames.
///
/// Outbound frames gain an LLC+SNAP prefix and a to-DS 802.11 header; on an
/// encrypted BSS the cipher inserts its header and MIC. While transmit is
/// paused (scanning, or the handshake has not finished) frames queue with
/// everything but the BSSID and sequence number populated, since the BSS
/// may differ by the time the queue drains.
use std::sync::Arc;

use log::{debug, error, trace};

use crate::bss::BssEntry;
use crate::error::{DriverStatus, Error, Result};
use crate::frame::{
    self, FrameHeader, MacAddr, DATA_NULL, ETHER_TYPE_EAPOL, MAC_HEADER_LEN,
};
use crate::link::{Link, LinkInner, PausedFrame};

/// Upper bound on frames parked during a handshake; beyond it the sender
/// sees back-pressure as an error.
const MAX_PAUSED_FRAMES: usize = 128;

/// Offset of the protected bit inside the second frame-control byte.
const FC1_PROTECTED: u8 = 1 << 6;

bitflags::bitflags! {
    /// Per-packet transmit options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxFlags: u8 {
        /// Never run this packet through the cipher (EAPOL messages during
        /// a rekey travel in the clear until keys switch over).
        const UNENCRYPTED = 1 << 0;
        /// Bypass the pause queue.
        const FORCE_TRANSMIT = 1 << 1;
    }
}

/// One layer-3 packet handed down by the network stack.
#[derive(Debug, Clone)]
pub struct TxPacket {
    pub payload: Vec<u8>,
    pub flags: TxFlags,
}

impl TxPacket {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload, flags: TxFlags::empty() }
    }
}

impl Link {
    /// Encapsulates and transmits a batch of packets for one protocol.
    ///
    /// `dst` of `None` addresses the broadcast domain. A driver return of
    /// `ResourceInUse` means "too busy": the rest of the batch is freed and
    /// the call still reports success.
    pub fn send_data(
        &self,
        packets: Vec<TxPacket>,
        src: MacAddr,
        dst: Option<MacAddr>,
        protocol: u16,
    ) -> Result<()> {
        let mut inner = self.lock_inner();

        let mut batch: Vec<Vec<u8>> = Vec::new();
        let pausable = inner.data_paused;
        let active = inner.active.upgrade();

        for packet in packets {
            if pausable && !packet.flags.contains(TxFlags::FORCE_TRANSMIT) {
                if inner.paused.len() >= MAX_PAUSED_FRAMES {
                    return Err(Error::OutOfResources);
                }
                // Header populated as far as possible; receiver address and
                // sequence number stay zero until the queue drains.
                let frame =
                    frame::encode_data(&src, dst.as_ref(), &[0u8; 6], protocol, &packet.payload, 0);
                inner
                    .paused
                    .push(PausedFrame { frame, exempt: packet.flags.contains(TxFlags::UNENCRYPTED) });
                continue;
            }

            if !inner.state.is_connected() {
                return Err(Error::Unsuccessful);
            }
            let Some(bss) = active.as_ref() else {
                return Err(Error::Unsuccessful);
            };
            let mut frame = frame::encode_data(
                &src,
                dst.as_ref(),
                bss.bssid(),
                protocol,
                &packet.payload,
                self.seq_next(),
            );
            if bss.join().encrypt_data && !packet.flags.contains(TxFlags::UNENCRYPTED) {
                frame[1] |= FC1_PROTECTED;
                if let Err(e) = self.cipher.encrypt(bss, &mut frame) {
                    error!("encrypt failed; dropping outbound packet: {}", e);
                    continue;
                }
            }
            batch.push(frame);
        }

        if batch.is_empty() {
            return Ok(());
        }
        match self.driver.send(batch) {
            Ok(()) => Ok(()),
            Err(DriverStatus::ResourceInUse) => {
                trace!("driver busy; outbound batch dropped");
                Ok(())
            }
            Err(status) => Err(Error::Driver(status)),
        }
    }

    /// Stops outbound data. If associated, a null-data frame with the
    /// power-management bit asks the AP to buffer inbound traffic for us.
    pub(crate) fn pause_data_frames_locked(&self, inner: &mut LinkInner) {
        if inner.data_paused {
            return;
        }
        inner.data_paused = true;
        if inner.state.is_connected() {
            if let Some(bss) = inner.active.upgrade() {
                if let Err(e) = self.send_null_data(&bss, true) {
                    debug!("could not signal power-save entry: {}", e);
                }
            }
        }
    }

    /// Resumes outbound data: clears power-save at the AP, clears the flag,
    /// and drains the queue with the current BSSID, fresh sequence numbers,
    /// and encryption as now required.
    pub(crate) fn resume_data_frames_locked(&self, inner: &mut LinkInner) {
        if !inner.data_paused {
            return;
        }
        let active = inner.active.upgrade();
        if inner.state.is_connected() {
            if let Some(bss) = active.as_ref() {
                if let Err(e) = self.send_null_data(bss, false) {
                    debug!("could not signal power-save exit: {}", e);
                }
            }
        }
        inner.data_paused = false;

        if inner.paused.is_empty() {
            return;
        }
        let parked = std::mem::take(&mut inner.paused);
        let Some(bss) = active else {
            // No BSS to address the frames to; they are undeliverable.
            debug!("dropping {} paused frames with no active BSS", parked.len());
            return;
        };
        let encrypt = bss.join().encrypt_data;
        let mut batch = Vec::with_capacity(parked.len());
        for mut parked_frame in parked {
            let frame = &mut parked_frame.frame;
            frame[4..10].copy_from_slice(bss.bssid());
            let seq = frame::seq_ctrl(self.seq_next());
            frame[22..24].copy_from_slice(&seq.to_le_bytes());
            if encrypt && !parked_frame.exempt {
                frame[1] |= FC1_PROTECTED;
                if let Err(e) = self.cipher.encrypt(&bss, frame) {
                    error!("encrypt failed; dropping paused packet: {}", e);
                    continue;
                }
            }
            batch.push(parked_frame.frame);
        }
        if batch.is_empty() {
            return;
        }
        match self.driver.send(batch) {
            Ok(()) | Err(DriverStatus::ResourceInUse) => {}
            Err(status) => error!("driver rejected drained frames: {:?}", status),
        }
    }

    /// Drops any parked frames and clears the pause flag; used when the
    /// link lands in Initialised and the queue has no deliverable target.
    pub(crate) fn flush_paused_locked(&self, inner: &mut LinkInner) {
        if !inner.paused.is_empty() {
            debug!("flushing {} paused frames", inner.paused.len());
            inner.paused.clear();
        }
        inner.data_paused = false;
    }

    fn send_null_data(&self, bss: &Arc<BssEntry>, power_mgmt: bool) -> Result<()> {
        let frame = frame::encode_null_data(&self.props.mac, bss.bssid(), power_mgmt, self.seq_next());
        self.driver.send(vec![frame]).map_err(Error::Driver)
    }

    /// Receive path for data frames. Decrypt failures and malformed LLC
    /// prefixes drop the frame silently (with a debug diagnostic); EAPOL
    /// payloads feed the authenticator session instead of the network
    /// stack.
    pub(crate) fn handle_data_frame(&self, header: &FrameHeader, raw: &[u8]) {
        let (bss, link_up, encrypting) = {
            let inner = self.lock_inner();
            let Some(bss) = inner.active.upgrade() else {
                trace!("data frame with no active BSS dropped");
                return;
            };
            let encrypting = bss.join().encrypt_data;
            (bss, inner.link_up, encrypting)
        };
        if header.addr2 != *bss.bssid() {
            trace!("data frame from foreign BSS {:02x?} dropped", header.addr2);
            return;
        }

        let mut buf = raw.to_vec();
        if header.frame_control.protected() {
            if let Err(e) = self.cipher.decrypt(&bss, &mut buf) {
                debug!("dropping undecryptable frame: {}", e);
                return;
            }
        } else if encrypting && header.frame_control.subtype() != DATA_NULL {
            debug!("plaintext data frame on an encrypted link dropped");
            return;
        }

        if header.frame_control.subtype() == DATA_NULL {
            // Keep-alive poke from the AP; answer in kind when up.
            if link_up {
                if let Err(e) = self.send_null_data(&bss, false) {
                    debug!("could not answer keep-alive: {}", e);
                }
            }
            return;
        }

        if buf.len() < MAC_HEADER_LEN {
            debug!("decrypted frame shorter than its header dropped");
            return;
        }
        let body = &buf[MAC_HEADER_LEN..];
        let (ethertype, payload) = match frame::parse_llc_snap(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("dropping data frame with bad LLC prefix: {}", e);
                return;
            }
        };

        if ethertype == ETHER_TYPE_EAPOL {
            if bss.join().handshake_active {
                self.cipher.eapol(self, &bss, payload);
            } else {
                debug!("EAPOL message outside a handshake dropped");
            }
            return;
        }

        // The controlled port stays shut until the handshake finishes.
        let requires_keys = bss.params().security.pairwise_cipher();
        if requires_keys && !encrypting {
            debug!("data frame before key handshake completion dropped");
            return;
        }

        // From-DS addressing: addr1 is us, addr3 the original source.
        self.network.deliver(ethertype, header.addr3, header.addr1, payload);
    }
}
