/// Scan engine.
///
/// One scan runs at a time, serialised by the scan lock (taken before the
/// link lock, never after). A foreground sweep holds the link in Probing
/// for the whole channel walk; a background sweep enters Probing
/// transiently per channel and sits out an inter-channel gap so normal
/// traffic keeps moving. Received probe responses and beacons land in the
/// BSS registry as they arrive on the receive path.
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::bss::{BssEntry, Security};
use crate::error::{Error, Result};
use crate::frame::{MacAddr, BROADCAST_ADDR, MGMT_PROBE_REQ};
use crate::ie::{self, Ssid};
use crate::link::{Link, LinkInner};
use crate::state::{DropReason, LinkState, ScanExit};

/// Slice of the home beacon interval given up at the end of a background
/// dwell so the station is back in time for its own AP's beacon.
const BEACON_DWELL_PAD: Duration = Duration::from_millis(10);

/// One beacon-interval time unit is 1024 µs.
const TIME_UNIT_MICROS: u64 = 1024;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScanFlags: u8 {
        /// Probe a specific BSSID instead of broadcasting.
        const DIRECTED = 1 << 0;
        /// Join the best candidate once the sweep finishes.
        const JOIN = 1 << 1;
        /// Dwell-limited sweep that preserves the current association.
        const BACKGROUND = 1 << 2;
    }
}

/// Completion callback; receives the scan's overall outcome.
pub type ScanDone = Box<dyn FnOnce(Result<()>) + Send>;

/// A scan request, consumed by the worker that runs it.
pub struct ScanRequest {
    pub ssid: Ssid,
    pub bssid: Option<MacAddr>,
    pub passphrase: Vec<u8>,
    pub flags: ScanFlags,
    pub done: Option<ScanDone>,
}

impl ScanRequest {
    /// Broadcast scan that joins the strongest matching network.
    pub fn broadcast_join(ssid: &[u8], passphrase: &[u8]) -> Result<Self> {
        let mut s = Ssid::new();
        s.extend_from_slice(ssid).map_err(|_| Error::DataLengthMismatch)?;
        Ok(Self {
            ssid: s,
            bssid: None,
            passphrase: passphrase.to_vec(),
            flags: ScanFlags::JOIN,
            done: None,
        })
    }

    /// Directed scan-and-join of one specific AP.
    pub fn directed_join(ssid: &[u8], bssid: MacAddr, passphrase: &[u8]) -> Result<Self> {
        let mut request = Self::broadcast_join(ssid, passphrase)?;
        request.bssid = Some(bssid);
        request.flags |= ScanFlags::DIRECTED;
        Ok(request)
    }

    /// Observation-only broadcast sweep; fills the registry and reports
    /// success whether or not anything was heard.
    pub fn observe() -> Self {
        Self {
            ssid: Ssid::new(),
            bssid: None,
            passphrase: Vec::new(),
            flags: ScanFlags::empty(),
            done: None,
        }
    }
}

impl Link {
    /// Spawns the per-request scan worker. The handle may be joined for a
    /// deterministic completion point or detached.
    pub fn start_scan(self: &Arc<Self>, request: ScanRequest) -> JoinHandle<()> {
        let link = Arc::clone(self);
        std::thread::spawn(move || link.scan_worker(request))
    }

    /// Link start: scan for the given network and join it.
    pub fn start(self: &Arc<Self>, ssid: &[u8], passphrase: &[u8]) -> Result<JoinHandle<()>> {
        Ok(self.start_scan(ScanRequest::broadcast_join(ssid, passphrase)?))
    }

    /// Bring-up convenience: join the compiled-in test network from
    /// [`crate::defaults`].
    pub fn start_default(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.start(crate::defaults::DEFAULT_SSID, crate::defaults::DEFAULT_PASSPHRASE)
    }

    pub(crate) fn scan_worker(&self, mut request: ScanRequest) {
        let _scan_guard = self.scan_lock.lock().unwrap_or_else(|e| e.into_inner());
        let done = request.done.take();

        let background = {
            let inner = self.lock_inner();
            inner.state.is_connected() || request.flags.contains(ScanFlags::BACKGROUND)
        };
        let result = if background {
            self.background_sweep(&request)
        } else {
            self.foreground_sweep(&request)
        };
        match (&result, done) {
            (_, Some(done)) => done(result),
            (Err(e), None) => warn!("scan finished with error: {}", e),
            (Ok(()), None) => {}
        }
    }

    /// Full sweep with transmit paused throughout. Requires an idle link.
    fn foreground_sweep(&self, request: &ScanRequest) -> Result<()> {
        {
            let mut inner = self.lock_inner();
            if inner.state != LinkState::Initialised {
                return Err(Error::Unsuccessful);
            }
            self.enter_probing_locked(&mut inner)?;
        }

        let mut sweep_error = None;
        for channel in 1..=self.props.max_channel {
            if let Err(e) = self.probe_channel(channel, request) {
                sweep_error = Some(e);
                break;
            }
            std::thread::sleep(self.props.dwell);
        }

        let mut inner = self.lock_inner();
        if let Some(e) = sweep_error {
            let _ = self.exit_probing_locked(&mut inner, ScanExit::Initialised);
            return Err(e);
        }
        if !request.flags.contains(ScanFlags::JOIN) {
            return self.exit_probing_locked(&mut inner, ScanExit::Initialised);
        }
        match self.select_candidate(&inner, request) {
            Ok(candidate) => {
                candidate.join().passphrase = request.passphrase.clone();
                self.exit_probing_locked(&mut inner, ScanExit::Join(candidate))
            }
            Err(e) => {
                debug!("no joinable candidate: {}", e);
                let _ = self.exit_probing_locked(&mut inner, ScanExit::Initialised);
                Err(e)
            }
        }
    }

    /// Channel-at-a-time sweep that keeps the association alive: each dwell
    /// ends `BEACON_DWELL_PAD` short of the home AP's beacon interval, and
    /// an inter-channel gap lets queued traffic drain.
    fn background_sweep(&self, request: &ScanRequest) -> Result<()> {
        let (home_channel, beacon_interval) = {
            let inner = self.lock_inner();
            let Some(active) = inner.active.upgrade() else {
                return Err(Error::Unsuccessful);
            };
            let params = active.params();
            (params.channel, params.beacon_interval)
        };
        let dwell = Duration::from_micros(u64::from(beacon_interval) * TIME_UNIT_MICROS)
            .saturating_sub(BEACON_DWELL_PAD)
            .min(self.props.dwell);

        for channel in 1..=self.props.max_channel {
            {
                let mut inner = self.lock_inner();
                if !inner.state.is_connected() {
                    // The association fell apart mid-sweep (deauth replayed
                    // on a probe exit, or a local leave); stop scanning.
                    return Err(Error::OperationCancelled);
                }
                self.enter_probing_locked(&mut inner)?;
            }
            let probe_result = self.probe_channel(channel, request);
            if probe_result.is_ok() {
                std::thread::sleep(dwell);
            }
            {
                let mut inner = self.lock_inner();
                if let Err(e) = self.driver.set_channel(home_channel) {
                    let _ = self.exit_probing_locked(&mut inner, ScanExit::Restore);
                    return Err(Error::Driver(e));
                }
                inner.current_channel = home_channel;
                self.exit_probing_locked(&mut inner, ScanExit::Restore)?;
            }
            probe_result?;
            std::thread::sleep(self.props.background_gap);
        }

        if !request.flags.contains(ScanFlags::JOIN) {
            return Ok(());
        }
        let mut inner = self.lock_inner();
        let candidate = self.select_candidate(&inner, request)?;
        if inner.active.is(&candidate) {
            // Already joined to the best candidate.
            return Ok(());
        }
        candidate.join().passphrase = request.passphrase.clone();
        // No roaming shortcut: leave the current BSS outright, then run the
        // full join against the new one.
        self.move_to_initialised_locked(&mut inner, DropReason::LocalLeave);
        self.begin_authenticating_locked(&mut inner, candidate)
    }

    /// Tunes to a channel and emits one probe request, broadcast or
    /// directed per the request's flags.
    fn probe_channel(&self, channel: u8, request: &ScanRequest) -> Result<()> {
        {
            let mut inner = self.lock_inner();
            self.driver.set_channel(channel).map_err(Error::Driver)?;
            inner.current_channel = channel;
        }
        let target = if request.flags.contains(ScanFlags::DIRECTED) {
            request.bssid.unwrap_or(BROADCAST_ADDR)
        } else {
            BROADCAST_ADDR
        };
        let mut body = Vec::new();
        ie::write_ssid_ie(&mut body, &request.ssid)?;
        ie::write_rates_ies(&mut body, &self.props.rates)?;
        self.send_mgmt_frame(MGMT_PROBE_REQ, &target, &target, &body)
    }

    /// Join selection. Directed requests pick their BSSID; broadcast
    /// requests pick the strongest SSID match whose basic rates can be
    /// served locally and whose security this core can actually join.
    fn select_candidate(
        &self,
        inner: &LinkInner,
        request: &ScanRequest,
    ) -> Result<Arc<BssEntry>> {
        if let Some(bssid) = request.bssid {
            let entry = inner.bss_list.lookup(&bssid).cloned().ok_or(Error::Unsuccessful)?;
            self.check_joinable(&entry, request)?;
            return Ok(entry);
        }

        let mut best: Option<(i8, Arc<BssEntry>)> = None;
        let mut last_error = Error::Unsuccessful;
        for entry in inner.bss_list.iter() {
            if entry.ssid().as_slice() != request.ssid.as_slice() {
                continue;
            }
            match self.check_joinable(entry, request) {
                Ok(()) => {
                    let rssi = entry.params().rssi;
                    if best.as_ref().map_or(true, |(r, _)| rssi > *r) {
                        best = Some((rssi, entry.clone()));
                    }
                }
                Err(e) => last_error = e,
            }
        }
        best.map(|(_, entry)| entry).ok_or(last_error)
    }

    fn check_joinable(&self, entry: &Arc<BssEntry>, request: &ScanRequest) -> Result<()> {
        let params = entry.params();
        ie::negotiate_rates(&self.props.rates, &params.rates)?;
        match params.security {
            Security::Open => Ok(()),
            Security::Rsn(_) if request.passphrase.is_empty() => Err(Error::AccessDenied),
            Security::Rsn(_) => Ok(()),
            Security::Unsupported => Err(Error::NotSupported),
        }
    }
}
