/// The link object: one instance per radio, the root everything else hangs
/// off.
///
/// Locking: the link lock guards the state variable, the BSS list, the
/// active-BSS pointer, the pause queue, and the timer bookkeeping. The scan
/// lock serialises scan workers. When both are taken the order is scan →
/// link. Entry reference counts are atomic and are taken and dropped
/// without the link lock; the per-entry parameter lock nests inside the
/// link lock.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::bss::{BssEntry, BssList, BssParams, WeakBss};
use crate::device::{CipherOps, DriverOps, NetworkOps};
use crate::error::{Error, Result};
use crate::frame::{
    self, CapabilityInfo, FrameHeader, MacAddr, ProbeView, MGMT_ASSOC_RESP, MGMT_AUTH,
    MGMT_BEACON, MGMT_DEAUTH, MGMT_DISASSOC, MGMT_PROBE_RESP, MGMT_REASSOC_RESP, TYPE_CTRL,
    TYPE_DATA, TYPE_MGMT,
};
use crate::ie::RateSet;
use crate::key::{Key, KeyFlags, KEY_SLOTS};
use crate::state::{DropReason, LinkState, ProbeNext};
use crate::timer::StateTimer;

/// Default dwell per probed channel. Long enough to catch one beacon cycle
/// of a typical AP (beacons broadcast every ~100 ms).
pub const DEFAULT_DWELL: Duration = Duration::from_millis(120);

/// Default delay between channels of a background sweep, left for normal
/// traffic to progress.
pub const DEFAULT_BACKGROUND_GAP: Duration = Duration::from_millis(200);

/// What the radio reports about itself at link creation.
#[derive(Debug, Clone)]
pub struct LinkProperties {
    pub mac: MacAddr,
    pub rates: RateSet,
    pub capabilities: CapabilityInfo,
    /// Highest channel the radio tunes; sweeps run 1..=max_channel.
    pub max_channel: u8,
    pub dwell: Duration,
    pub background_gap: Duration,
}

impl Default for LinkProperties {
    fn default() -> Self {
        use crate::ie::SupportedRate;
        let mut rates = RateSet::new();
        // 802.11b basic set plus the OFDM g rates, in 500 kbit/s units.
        for v in [2u8, 4, 11, 22] {
            let _ = rates.push(SupportedRate::new(true, v));
        }
        for v in [12u8, 18, 24, 36, 48, 72, 96, 108] {
            let _ = rates.push(SupportedRate::new(false, v));
        }
        Self {
            mac: [0; 6],
            rates,
            capabilities: CapabilityInfo::empty(),
            max_channel: 11,
            dwell: DEFAULT_DWELL,
            background_gap: DEFAULT_BACKGROUND_GAP,
        }
    }
}

/// A frame parked on the pause queue. The header is populated as far as
/// possible; BSSID and sequence number are filled at drain time, since the
/// BSS may differ by then.
pub(crate) struct PausedFrame {
    pub frame: Vec<u8>,
    /// Marked unencrypted by the sender; skips the cipher at drain.
    pub exempt: bool,
}

/// Everything the link lock protects.
pub(crate) struct LinkInner {
    pub state: LinkState,
    /// State to restore when a transient probe ends.
    pub pre_probe_state: LinkState,
    /// Transition requested while Probing, replayed on probe exit.
    pub probe_next: Option<ProbeNext>,
    pub bss_list: BssList,
    pub active: WeakBss,
    pub paused: Vec<PausedFrame>,
    pub data_paused: bool,
    /// Generation of the currently armed state timer; zero when disarmed.
    pub timer_generation: u64,
    pub link_up: bool,
    /// Channel the radio was last tuned to.
    pub current_channel: u8,
}

pub struct Link {
    pub(crate) props: LinkProperties,
    pub(crate) driver: Arc<dyn DriverOps>,
    pub(crate) network: Arc<dyn NetworkOps>,
    pub(crate) cipher: Arc<dyn CipherOps>,
    pub(crate) inner: Mutex<LinkInner>,
    pub(crate) scan_lock: Mutex<()>,
    seq: AtomicU32,
    pub(crate) timer: StateTimer,
}

impl Link {
    /// Creates a link bound to one radio and moves it to Initialised.
    ///
    /// The caller's properties are copied so the core owns them; the ESS
    /// capability bit is forced on, since a station always reaches the
    /// distribution system through an AP.
    pub fn new(
        mut props: LinkProperties,
        driver: Arc<dyn DriverOps>,
        network: Arc<dyn NetworkOps>,
        cipher: Arc<dyn CipherOps>,
    ) -> Result<Arc<Link>> {
        props.capabilities |= CapabilityInfo::ESS;
        let link = Arc::new_cyclic(|weak: &std::sync::Weak<Link>| {
            let weak = weak.clone();
            Link {
                props,
                driver,
                network,
                cipher,
                inner: Mutex::new(LinkInner {
                    state: LinkState::Uninitialised,
                    pre_probe_state: LinkState::Uninitialised,
                    probe_next: None,
                    bss_list: BssList::default(),
                    active: WeakBss::default(),
                    paused: Vec::new(),
                    data_paused: false,
                    timer_generation: 0,
                    link_up: false,
                    current_channel: 1,
                }),
                scan_lock: Mutex::new(()),
                seq: AtomicU32::new(1),
                timer: StateTimer::new(move |generation| {
                    if let Some(link) = weak.upgrade() {
                        link.on_state_timeout(generation);
                    }
                }),
            }
        });
        {
            let mut inner = link.lock_inner();
            link.driver.set_state(LinkState::Initialised, None).map_err(Error::Driver)?;
            inner.state = LinkState::Initialised;
        }
        Ok(link)
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next 12-bit frame sequence number; post-incremented per emitted
    /// frame, wraps modulo 2^12.
    pub(crate) fn seq_next(&self) -> u16 {
        (self.seq.fetch_add(1, Ordering::Relaxed) & 0xFFF) as u16
    }

    pub fn state(&self) -> LinkState {
        self.lock_inner().state
    }

    /// Takes a counted reference on the active BSS, if any.
    pub fn active_bss(&self) -> Option<Arc<BssEntry>> {
        self.lock_inner().active.upgrade()
    }

    /// Entry point for every frame the driver receives. Control frames are
    /// acknowledged in hardware and ignored here; parse failures are logged
    /// and the frame dropped with no state change.
    pub fn process_received_frame(&self, raw: &[u8], rssi: i8) {
        if frame::peek_frame_type(raw) == Some(TYPE_CTRL) {
            return;
        }
        let (header, body) = match frame::parse_frame(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("dropping unparseable frame ({} bytes): {}", raw.len(), e);
                return;
            }
        };
        match header.frame_control.frame_type() {
            TYPE_MGMT => match header.frame_control.subtype() {
                MGMT_BEACON | MGMT_PROBE_RESP => {
                    if let Err(e) = self.update_bss_from_probe(&header, body, rssi) {
                        debug!("discarding probe/beacon from {:02x?}: {}", header.addr3, e);
                    }
                }
                MGMT_AUTH => self.on_auth_frame(&header, body),
                MGMT_ASSOC_RESP | MGMT_REASSOC_RESP => self.on_assoc_resp_frame(&header, body),
                MGMT_DEAUTH => self.on_deauth_frame(&header, body),
                MGMT_DISASSOC => self.on_disassoc_frame(&header, body),
                other => debug!("ignoring management subtype {}", other),
            },
            TYPE_DATA => self.handle_data_frame(&header, raw),
            _ => {}
        }
    }

    /// Insert-or-update the registry from a beacon or probe response.
    ///
    /// A beacon that mutates the parameters of the *active* BSS means the
    /// AP has effectively become a different network; the state machine is
    /// driven back to Initialised before the fields are overwritten.
    pub(crate) fn update_bss_from_probe(
        &self,
        header: &FrameHeader,
        body: &[u8],
        rssi: i8,
    ) -> Result<()> {
        let view = ProbeView::parse(body)?;
        let bssid = header.addr3;
        let now = Instant::now();
        let channel_hint = self.lock_inner().current_channel;
        let params = BssParams::from_probe(&view, channel_hint, rssi, now)?;

        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        if let Some(entry) = inner.bss_list.lookup(&bssid).cloned() {
            if inner.active.is(&entry) && entry.params().materially_differs(&params) {
                warn!("active BSS {:02x?} changed parameters; dropping the connection", bssid);
                self.move_to_initialised_locked(inner, DropReason::ApChanged);
            }
            entry.update_params(params);
        } else {
            inner.bss_list.insert(Arc::new(BssEntry::new(bssid, params)));
        }
        inner.bss_list.trim(now, &inner.active);
        Ok(())
    }

    /// Called by the authenticator session to deliver a derived key into
    /// the active BSS entry's key array.
    pub fn install_key(
        &self,
        bss: &Arc<BssEntry>,
        slot: usize,
        flags: KeyFlags,
        id: u8,
        material: &[u8],
    ) -> Result<()> {
        if slot >= KEY_SLOTS {
            return Err(Error::NotSupported);
        }
        let key = Key::new(flags, id, material).ok_or(Error::DataLengthMismatch)?;
        bss.join().keys[slot] = Some(key);
        Ok(())
    }

    /// Asks the AP for permission to leave and drops back to Initialised.
    /// Valid while connecting or connected.
    pub fn leave(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        match inner.state {
            LinkState::Authenticating
            | LinkState::Associating
            | LinkState::Associated
            | LinkState::Encrypted => {
                self.move_to_initialised_locked(&mut inner, DropReason::LocalLeave);
                Ok(())
            }
            LinkState::Probing => {
                inner.probe_next = Some(ProbeNext::Initialised(DropReason::LocalLeave));
                Ok(())
            }
            _ => Err(Error::Unsuccessful),
        }
    }

    /// Removes the link: leaves any joined BSS and returns the state
    /// machine to Uninitialised. The remaining BSS entries drop with the
    /// link, wiping their keys.
    pub fn shutdown(&self) {
        let mut inner = self.lock_inner();
        if matches!(
            inner.state,
            LinkState::Authenticating
                | LinkState::Associating
                | LinkState::Associated
                | LinkState::Encrypted
        ) {
            self.move_to_initialised_locked(&mut inner, DropReason::LocalLeave);
        }
        self.timer.cancel();
        inner.timer_generation = 0;
        if let Err(e) = self.driver.set_state(LinkState::Uninitialised, None) {
            warn!("driver refused Uninitialised on shutdown: {:?}", e);
        }
        inner.state = LinkState::Uninitialised;
    }
}

impl core::fmt::Debug for Link {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Link").field("mac", &self.props.mac).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CapabilityInfo;
    use crate::test_utils::{harness, join_network, ProbeResponseBuilder, AP_BSSID};

    #[test]
    fn construction_forces_ess_and_reports_initialised() {
        let h = harness();
        assert!(h.link.props.capabilities.contains(CapabilityInfo::ESS));
        assert_eq!(h.link.state(), LinkState::Initialised);
        assert_eq!(h.driver.observed_states(), vec![LinkState::Initialised]);
    }

    #[test]
    fn sequence_numbers_increase_and_wrap() {
        let h = harness();
        let first = h.link.seq_next();
        let second = h.link.seq_next();
        assert_eq!(second, first + 1);
        for _ in 0..0x1000 {
            h.link.seq_next();
        }
        // Still within 12 bits after wrapping the counter.
        assert!(h.link.seq_next() < 0x1000);
    }

    #[test]
    fn repeated_probe_updates_are_idempotent() {
        let h = harness();
        let probe = ProbeResponseBuilder::new(b"net").build();
        h.link.process_received_frame(&probe, -40);
        h.link.process_received_frame(&probe, -40);

        let inner = h.link.lock_inner();
        assert_eq!(inner.bss_list.len(), 1);
        assert_eq!(inner.state, LinkState::Initialised);
        let entry = inner.bss_list.lookup(&AP_BSSID).unwrap();
        assert_eq!(entry.ssid().as_slice(), b"net");
    }

    #[test]
    fn oversized_element_drops_the_probe_without_partial_update() {
        let h = harness();
        let mut probe = ProbeResponseBuilder::new(b"net").build();
        // Declare the SSID element longer than the frame.
        let ie_start = frame::MAC_HEADER_LEN + 12;
        probe[ie_start + 1] = 0xF0;
        h.link.process_received_frame(&probe, -40);

        assert!(h.link.lock_inner().bss_list.is_empty());
    }

    #[test]
    fn short_and_garbage_frames_are_ignored() {
        let h = harness();
        h.link.process_received_frame(&[0x80, 0x00], -40);
        h.link.process_received_frame(&[], -40);
        h.link.process_received_frame(&[0xFF; 23], -40);
        assert_eq!(h.link.state(), LinkState::Initialised);
        assert!(h.link.lock_inner().bss_list.is_empty());
    }

    #[test]
    fn control_frames_are_ignored() {
        let h = harness();
        // PS-Poll: type control, subtype 10.
        let ps_poll = [0xA4, 0x00, 0x01, 0xC0, 6, 6, 6, 6, 6, 6, 7, 7, 7, 7, 7, 7];
        h.link.process_received_frame(&ps_poll, -40);
        assert_eq!(h.link.state(), LinkState::Initialised);
    }

    #[test]
    fn leave_without_a_connection_is_refused() {
        let h = harness();
        assert_eq!(h.link.leave(), Err(Error::Unsuccessful));
    }

    #[test]
    fn shutdown_returns_the_link_to_uninitialised() {
        let h = harness();
        join_network(&h, b"open", b"", false);
        h.link.shutdown();

        assert_eq!(h.link.state(), LinkState::Uninitialised);
        assert!(h.link.active_bss().is_none());
        let states = h.driver.observed_states();
        assert_eq!(states.last(), Some(&LinkState::Uninitialised));
        // The disconnect passed through Initialised on the way down.
        assert_eq!(states[states.len() - 2], LinkState::Initialised);
        assert!(!h.network.last_status().unwrap().up);
    }

    #[test]
    fn stale_entries_are_trimmed_on_update() {
        let h = harness();
        let mut old = ProbeResponseBuilder::new(b"old");
        old.bssid = [0xAA; 6];
        h.link.process_received_frame(&old.build(), -70);

        // Age the first entry past the expiry window.
        {
            let inner = h.link.lock_inner();
            let entry = inner.bss_list.lookup(&[0xAA; 6]).unwrap();
            let mut params = entry.params();
            params.last_seen = Instant::now()
                .checked_sub(crate::bss::BSS_EXPIRY + Duration::from_secs(1))
                .expect("monotonic clock too close to zero");
        }

        h.link.process_received_frame(&ProbeResponseBuilder::new(b"new").build(), -40);
        let inner = h.link.lock_inner();
        assert!(inner.bss_list.lookup(&[0xAA; 6]).is_none());
        assert!(inner.bss_list.lookup(&AP_BSSID).is_some());
    }
}
