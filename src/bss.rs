/// BSS registry: the cache of access points the station has heard from.
///
/// Entries are shared by reference count (`Arc`): the list owns one
/// reference, in-flight receive processing and scan selection take their
/// own, and the link's active pointer is deliberately a weak handle: the
/// list's reference is what backs it. An entry removed from
/// the list lives on until its last holder drops it, at which point its key
/// material is wiped.
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::frame::{CapabilityInfo, MacAddr, ProbeView};
use crate::ie::{self, RateSet, RsnInfo, Ssid, SupportedRate};
use crate::key::{Key, KEY_SLOTS};

/// Entries not heard from for this long are dropped by the trim sweep.
pub const BSS_EXPIRY: Duration = Duration::from_secs(10);

/// A `(offset, len)` range into an entry's owned elements blob. Parsed
/// element positions are stored this way so they survive blob replacement
/// without dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IeRange {
    pub offset: usize,
    pub len: usize,
}

impl IeRange {
    pub fn slice<'a>(&self, blob: &'a [u8]) -> Option<&'a [u8]> {
        blob.get(self.offset..self.offset + self.len)
    }
}

/// What the BSS's RSN element offered, reduced to this core's policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Security {
    /// No privacy bit, no RSN: plaintext data frames.
    Open,
    /// CCMP pairwise and group with a PSK-family AKM.
    Rsn(RsnInfo),
    /// Privacy demanded with something this core refuses (WEP, WPA1,
    /// non-CCMP RSN). Recognised but never joined.
    Unsupported,
}

impl Security {
    pub fn pairwise_cipher(&self) -> bool {
        matches!(self, Security::Rsn(_))
    }
}

/// The air-observed side of an entry, replaced wholesale whenever a newer
/// beacon or probe response for the BSSID is parsed.
#[derive(Debug, Clone)]
pub struct BssParams {
    pub beacon_interval: u16,
    pub capabilities: CapabilityInfo,
    pub channel: u8,
    pub rssi: i8,
    pub last_seen: Instant,
    pub rates: RateSet,
    /// Verbatim copy of the probe/beacon IE region.
    pub elements: Vec<u8>,
    pub ssid: Option<IeRange>,
    pub rsn: Option<IeRange>,
    pub security: Security,
}

impl BssParams {
    /// Builds params from a validated probe view. `channel_hint` is the
    /// channel the frame was received on, used when the body carries no
    /// DSSS parameter element.
    pub fn from_probe(view: &ProbeView<'_>, channel_hint: u8, rssi: i8, now: Instant) -> Result<Self> {
        let elements = view.ies.to_vec();
        let ssid = ie::find_ie_range(&elements, ie::IE_SSID).map(|(offset, len)| IeRange { offset, len });
        if let Some(r) = &ssid {
            if r.len > ie::SSID_MAX_LEN {
                return Err(Error::DataLengthMismatch);
            }
        }
        let rsn = ie::find_ie_range(&elements, ie::IE_RSN).map(|(offset, len)| IeRange { offset, len });
        let channel = ie::find_ie(&elements, ie::IE_DSSS_PARAM)
            .and_then(|p| p.first().copied())
            .unwrap_or(channel_hint);

        let security = match &rsn {
            Some(range) => {
                let body = range.slice(&elements).ok_or(Error::DataLengthMismatch)?;
                match RsnInfo::parse(body) {
                    Ok(info) if info.supports_ccmp_psk() => Security::Rsn(info),
                    Ok(_) | Err(_) => Security::Unsupported,
                }
            }
            None if view.capabilities.contains(CapabilityInfo::PRIVACY) => Security::Unsupported,
            None => Security::Open,
        };

        Ok(Self {
            beacon_interval: view.beacon_interval,
            capabilities: view.capabilities,
            channel,
            rssi,
            last_seen: now,
            rates: ie::collect_rates(&elements),
            elements,
            ssid,
            rsn,
            security,
        })
    }

    pub fn ssid_bytes(&self) -> &[u8] {
        self.ssid.and_then(|r| r.slice(&self.elements)).unwrap_or(&[])
    }

    fn rsn_bytes(&self) -> &[u8] {
        self.rsn.and_then(|r| r.slice(&self.elements)).unwrap_or(&[])
    }

    /// True when the AP has effectively become a different network: any of
    /// beacon interval, capabilities, channel, rate count, SSID, or RSN
    /// differ from what the active connection was built on.
    pub fn materially_differs(&self, newer: &BssParams) -> bool {
        self.beacon_interval != newer.beacon_interval
            || self.capabilities != newer.capabilities
            || self.channel != newer.channel
            || self.rates.len() != newer.rates.len()
            || self.ssid_bytes() != newer.ssid_bytes()
            || self.rsn_bytes() != newer.rsn_bytes()
    }
}

/// The join-local side of an entry: everything that only means something
/// while this entry is (or is becoming) the active BSS.
#[derive(Debug, Default)]
pub struct JoinState {
    /// 14-bit association id; valid only while associated.
    pub aid: u16,
    /// Top rate shared with the AP, fixed at association time.
    pub max_rate: Option<SupportedRate>,
    /// Credential for the key handshake on an encrypted BSS.
    pub passphrase: Vec<u8>,
    pub keys: [Option<Key>; KEY_SLOTS],
    /// An authenticator session exists for this entry.
    pub handshake_active: bool,
    /// Outgoing data frames must pass through the cipher.
    pub encrypt_data: bool,
}

impl JoinState {
    pub fn wipe_keys(&mut self) {
        for slot in self.keys.iter_mut() {
            // Dropping a key wipes its material.
            *slot = None;
        }
        self.encrypt_data = false;
    }
}

/// One cached access point.
pub struct BssEntry {
    bssid: MacAddr,
    params: Mutex<BssParams>,
    join: Mutex<JoinState>,
}

impl BssEntry {
    pub fn new(bssid: MacAddr, params: BssParams) -> Self {
        Self { bssid, params: Mutex::new(params), join: Mutex::new(JoinState::default()) }
    }

    pub fn bssid(&self) -> &MacAddr {
        &self.bssid
    }

    /// Lock order: the link lock, when held, is taken before this one.
    pub fn params(&self) -> MutexGuard<'_, BssParams> {
        self.params.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn join(&self) -> MutexGuard<'_, JoinState> {
        self.join.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ssid(&self) -> Ssid {
        let params = self.params();
        let mut out = Ssid::new();
        let _ = out.extend_from_slice(params.ssid_bytes());
        out
    }

    /// Replaces the air-observed side in place. Ranges in the new params
    /// already index the new blob, so nothing dangles.
    pub fn update_params(&self, newer: BssParams) {
        *self.params() = newer;
    }

    /// Deep copy for a reconnection attempt: same air-observed fields, same
    /// association id, passphrase and negotiated rate, but no keys and no
    /// authenticator session. The fresh entry replaces the original as the
    /// target of the new attempt.
    pub fn copy_for_reconnect(&self) -> Arc<BssEntry> {
        let params = self.params().clone();
        let join = self.join();
        let copy = BssEntry::new(self.bssid, params);
        {
            let mut fresh = copy.join();
            fresh.aid = join.aid;
            fresh.max_rate = join.max_rate;
            fresh.passphrase = join.passphrase.clone();
        }
        Arc::new(copy)
    }
}

impl core::fmt::Debug for BssEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BssEntry").field("bssid", &self.bssid).finish()
    }
}

/// Weak handle for the link's active-BSS pointer.
///
/// The active pointer is not a counted reference; the list entry's
/// reference backs it. `upgrade()` is only meaningful while the caller
/// holds the link lock, which is what keeps the list entry alive.
#[derive(Default)]
pub struct WeakBss(Weak<BssEntry>);

impl WeakBss {
    pub fn clear(&mut self) {
        self.0 = Weak::new();
    }

    pub fn set(&mut self, entry: &Arc<BssEntry>) {
        self.0 = Arc::downgrade(entry);
    }

    pub fn upgrade(&self) -> Option<Arc<BssEntry>> {
        self.0.upgrade()
    }

    pub fn is(&self, entry: &Arc<BssEntry>) -> bool {
        self.0.upgrade().is_some_and(|e| Arc::ptr_eq(&e, entry))
    }
}

/// The per-link list of cached entries. Unordered; at most one entry per
/// BSSID.
#[derive(Default)]
pub struct BssList {
    entries: Vec<Arc<BssEntry>>,
}

impl BssList {
    pub fn lookup(&self, bssid: &MacAddr) -> Option<&Arc<BssEntry>> {
        self.entries.iter().find(|e| e.bssid() == bssid)
    }

    /// Inserts a new entry; an existing entry for the BSSID is replaced so
    /// the one-entry-per-BSSID invariant holds.
    pub fn insert(&mut self, entry: Arc<BssEntry>) {
        self.remove(&entry.bssid().clone());
        self.entries.push(entry);
    }

    pub fn remove(&mut self, bssid: &MacAddr) -> Option<Arc<BssEntry>> {
        let idx = self.entries.iter().position(|e| e.bssid() == bssid)?;
        Some(self.entries.swap_remove(idx))
    }

    /// Drops entries not seen within the expiry window. The active entry is
    /// exempt regardless of age.
    pub fn trim(&mut self, now: Instant, active: &WeakBss) {
        self.entries.retain(|e| {
            if active.is(e) {
                return true;
            }
            let last_seen = e.params().last_seen;
            now.saturating_duration_since(last_seen) <= BSS_EXPIRY
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BssEntry>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
