/// Shared test doubles: a recording driver, a recording network stack, a
/// fake cipher with real packet-number bookkeeping, and frame builders for
/// the AP side of every exchange.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bss::BssEntry;
use crate::device::{BssDescriptor, CipherOps, DriverOps, LinkStatus, NetworkOps};
use crate::error::{DriverStatus, Error, Result};
use crate::frame::{
    self, CapabilityInfo, FrameControl, MacAddr, DATA_DATA, MAC_HEADER_LEN, MGMT_ASSOC_RESP,
    MGMT_AUTH, MGMT_BEACON, MGMT_DEAUTH, MGMT_DISASSOC, MGMT_PROBE_RESP, TYPE_DATA,
};
use crate::ie::{self, SupportedRate};
use crate::key::{KeyFlags, SLOT_GROUP, SLOT_PAIRWISE};
use crate::link::{Link, LinkProperties};
use crate::state::LinkState;

pub const STATION_MAC: MacAddr = [8; 6];
pub const AP_BSSID: MacAddr = [6; 6];

/// Marker the fake cipher appends in place of a real MIC.
pub const FAKE_MIC: [u8; 8] = [0x4D; 8];
const FAKE_CCMP_HDR_LEN: usize = 8;

pub struct FakeDriver {
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub channels: Mutex<Vec<u8>>,
    pub states: Mutex<Vec<LinkState>>,
    pub state_bss: Mutex<Vec<Option<BssDescriptor>>>,
    pub fail_send: AtomicBool,
    pub busy: AtomicBool,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
            state_bss: Mutex::new(Vec::new()),
            fail_send: AtomicBool::new(false),
            busy: AtomicBool::new(false),
        })
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent frames of one management subtype.
    pub fn mgmt_frames(&self, subtype: u8) -> Vec<Vec<u8>> {
        self.sent_frames()
            .into_iter()
            .filter(|f| {
                let fc = FrameControl(u16::from_le_bytes([f[0], f[1]]));
                fc.frame_type() == frame::TYPE_MGMT && fc.subtype() == subtype
            })
            .collect()
    }

    pub fn data_frames(&self) -> Vec<Vec<u8>> {
        self.sent_frames()
            .into_iter()
            .filter(|f| {
                let fc = FrameControl(u16::from_le_bytes([f[0], f[1]]));
                fc.frame_type() == TYPE_DATA && fc.subtype() == DATA_DATA
            })
            .collect()
    }

    pub fn observed_states(&self) -> Vec<LinkState> {
        self.states.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
        self.channels.lock().unwrap().clear();
    }
}

impl DriverOps for FakeDriver {
    fn send(&self, frames: Vec<Vec<u8>>) -> core::result::Result<(), DriverStatus> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(DriverStatus::Failed);
        }
        if self.busy.load(Ordering::SeqCst) {
            return Err(DriverStatus::ResourceInUse);
        }
        self.sent.lock().unwrap().extend(frames);
        Ok(())
    }

    fn set_channel(&self, channel: u8) -> core::result::Result<(), DriverStatus> {
        self.channels.lock().unwrap().push(channel);
        Ok(())
    }

    fn set_state(
        &self,
        state: LinkState,
        bss: Option<&BssDescriptor>,
    ) -> core::result::Result<(), DriverStatus> {
        self.states.lock().unwrap().push(state);
        self.state_bss.lock().unwrap().push(bss.copied());
        Ok(())
    }
}

pub struct FakeNetwork {
    pub delivered: Mutex<Vec<(u16, MacAddr, MacAddr, Vec<u8>)>>,
    pub statuses: Mutex<Vec<LinkStatus>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { delivered: Mutex::new(Vec::new()), statuses: Mutex::new(Vec::new()) })
    }

    pub fn last_status(&self) -> Option<LinkStatus> {
        self.statuses.lock().unwrap().last().copied()
    }
}

impl NetworkOps for FakeNetwork {
    fn deliver(&self, ethertype: u16, src: MacAddr, dst: MacAddr, payload: &[u8]) {
        self.delivered.lock().unwrap().push((ethertype, src, dst, payload.to_vec()));
    }

    fn link_status(&self, status: LinkStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

/// XOR-transform stand-in for CCMP plus a two-message stand-in for the
/// four-way handshake. Packet numbers and the replay window go through the
/// real [`crate::key::Key`] bookkeeping.
pub struct FakeCipher {
    pub handshakes_started: AtomicUsize,
    pub teardowns: AtomicUsize,
    pub eapol_seen: AtomicUsize,
    /// AP messages consumed before keys are installed and completion is
    /// signalled.
    pub msgs_to_complete: usize,
    pub pairwise_material: Vec<u8>,
    pub group_material: Vec<u8>,
}

impl FakeCipher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handshakes_started: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
            eapol_seen: AtomicUsize::new(0),
            msgs_to_complete: 2,
            pairwise_material: hex::decode("000102030405060708090a0b0c0d0e0f").unwrap(),
            group_material: hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").unwrap(),
        })
    }

    fn key_slot(frame: &[u8]) -> usize {
        // Group-addressed receiver → group key, else pairwise.
        if frame[4] & 1 != 0 {
            SLOT_GROUP
        } else {
            SLOT_PAIRWISE
        }
    }

    fn xor_in_place(material: &[u8], data: &mut [u8]) {
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= material[i % material.len()];
        }
    }
}

impl CipherOps for FakeCipher {
    fn init_handshake(&self, _link: &Link, _bss: &Arc<BssEntry>) -> Result<()> {
        self.handshakes_started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn teardown(&self, _bss: &Arc<BssEntry>) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }

    fn encrypt(&self, bss: &Arc<BssEntry>, frame: &mut Vec<u8>) -> Result<()> {
        let slot = Self::key_slot(frame);
        let join = bss.join();
        let key = join.keys[slot].as_ref().ok_or(Error::Unsuccessful)?;
        let pn = key.next_tx_pn();
        let material = key.material().to_vec();
        drop(join);

        let pn_bytes = pn.to_le_bytes();
        let header = [
            pn_bytes[0], pn_bytes[1], 0, 0x20, pn_bytes[2], pn_bytes[3], pn_bytes[4], pn_bytes[5],
        ];
        Self::xor_in_place(&material, &mut frame[MAC_HEADER_LEN..]);
        let mut out = Vec::with_capacity(frame.len() + FAKE_CCMP_HDR_LEN + FAKE_MIC.len());
        out.extend_from_slice(&frame[..MAC_HEADER_LEN]);
        out.extend_from_slice(&header);
        out.extend_from_slice(&frame[MAC_HEADER_LEN..]);
        out.extend_from_slice(&FAKE_MIC);
        *frame = out;
        Ok(())
    }

    fn decrypt(&self, bss: &Arc<BssEntry>, frame: &mut Vec<u8>) -> Result<()> {
        if frame.len() < MAC_HEADER_LEN + FAKE_CCMP_HDR_LEN + FAKE_MIC.len() {
            return Err(Error::DataLengthMismatch);
        }
        if frame[frame.len() - FAKE_MIC.len()..] != FAKE_MIC {
            return Err(Error::Unsuccessful);
        }
        let slot = Self::key_slot(frame);
        let header = &frame[MAC_HEADER_LEN..MAC_HEADER_LEN + FAKE_CCMP_HDR_LEN];
        let pn = u64::from_le_bytes([
            header[0], header[1], header[4], header[5], header[6], header[7], 0, 0,
        ]);
        let join = bss.join();
        let key = join.keys[slot].as_ref().ok_or(Error::Unsuccessful)?;
        if !key.accept_rx_pn(pn) {
            return Err(Error::Unsuccessful);
        }
        let material = key.material().to_vec();
        drop(join);

        let mic_start = frame.len() - FAKE_MIC.len();
        frame.truncate(mic_start);
        frame.drain(MAC_HEADER_LEN..MAC_HEADER_LEN + FAKE_CCMP_HDR_LEN);
        Self::xor_in_place(&material, &mut frame[MAC_HEADER_LEN..]);
        Ok(())
    }

    fn eapol(&self, link: &Link, bss: &Arc<BssEntry>, _body: &[u8]) {
        let seen = self.eapol_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == self.msgs_to_complete {
            link.install_key(
                bss,
                SLOT_PAIRWISE,
                KeyFlags::TX | KeyFlags::PAIRWISE,
                0,
                &self.pairwise_material,
            )
            .unwrap();
            link.install_key(bss, SLOT_GROUP, KeyFlags::GROUP, 1, &self.group_material).unwrap();
            link.handshake_complete();
        }
    }
}

pub struct Harness {
    pub link: Arc<Link>,
    pub driver: Arc<FakeDriver>,
    pub network: Arc<FakeNetwork>,
    pub cipher: Arc<FakeCipher>,
}

pub fn harness() -> Harness {
    let driver = FakeDriver::new();
    let network = FakeNetwork::new();
    let cipher = FakeCipher::new();
    let props = LinkProperties {
        mac: STATION_MAC,
        max_channel: 3,
        dwell: Duration::ZERO,
        background_gap: Duration::ZERO,
        ..LinkProperties::default()
    };
    let driver_ops: Arc<dyn DriverOps> = driver.clone();
    let network_ops: Arc<dyn NetworkOps> = network.clone();
    let cipher_ops: Arc<dyn CipherOps> = cipher.clone();
    let link = Link::new(props, driver_ops, network_ops, cipher_ops).expect("link construction");
    Harness { link, driver, network, cipher }
}

/// Builder for the AP's probe responses and beacons.
pub struct ProbeResponseBuilder {
    pub bssid: MacAddr,
    pub ssid: Vec<u8>,
    pub channel: u8,
    pub beacon_interval: u16,
    pub privacy: bool,
    pub rsn: Option<Vec<u8>>,
    pub rates: Vec<SupportedRate>,
    pub seq: u16,
    pub beacon: bool,
}

impl ProbeResponseBuilder {
    pub fn new(ssid: &[u8]) -> Self {
        Self {
            bssid: AP_BSSID,
            ssid: ssid.to_vec(),
            channel: 1,
            beacon_interval: 100,
            privacy: false,
            rsn: None,
            rates: vec![
                SupportedRate::new(true, 2),
                SupportedRate::new(true, 4),
                SupportedRate::new(false, 22),
                SupportedRate::new(false, 108),
            ],
            seq: 1,
            beacon: false,
        }
    }

    pub fn wpa2(mut self) -> Self {
        self.privacy = true;
        self.rsn = Some(ie::STATION_RSN_BODY.to_vec());
        self
    }

    pub fn as_beacon(mut self) -> Self {
        self.beacon = true;
        self
    }

    pub fn rates(mut self, rates: Vec<SupportedRate>) -> Self {
        self.rates = rates;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u64.to_le_bytes()); // timestamp
        body.extend_from_slice(&self.beacon_interval.to_le_bytes());
        let mut cap = CapabilityInfo::ESS;
        if self.privacy {
            cap |= CapabilityInfo::PRIVACY;
        }
        body.extend_from_slice(&cap.bits().to_le_bytes());
        ie::write_ssid_ie(&mut body, &self.ssid).unwrap();
        ie::write_rates_ies(&mut body, &self.rates).unwrap();
        ie::write_dsss_ie(&mut body, self.channel).unwrap();
        if let Some(rsn) = &self.rsn {
            ie::write_ie(&mut body, ie::IE_RSN, rsn).unwrap();
        }
        let subtype = if self.beacon { MGMT_BEACON } else { MGMT_PROBE_RESP };
        let dst = if self.beacon { frame::BROADCAST_ADDR } else { STATION_MAC };
        frame::encode_management(subtype, &dst, &self.bssid, &self.bssid, self.seq, &body)
    }
}

pub fn auth_response_frame(status: u16) -> Vec<u8> {
    let mut body = Vec::new();
    frame::AuthBody { algorithm: frame::AUTH_ALGORITHM_OPEN, txn_seq: 2, status }.write(&mut body);
    frame::encode_management(MGMT_AUTH, &STATION_MAC, &AP_BSSID, &AP_BSSID, 2, &body)
}

pub fn assoc_response_frame(status: u16, aid: u16) -> Vec<u8> {
    let mut body = Vec::new();
    frame::put_u16_le(&mut body, CapabilityInfo::ESS.bits());
    frame::put_u16_le(&mut body, status);
    frame::put_u16_le(&mut body, aid | 0xC000);
    ie::write_rates_ies(
        &mut body,
        &[
            SupportedRate::new(true, 2),
            SupportedRate::new(true, 4),
            SupportedRate::new(false, 22),
            SupportedRate::new(false, 108),
        ],
    )
    .unwrap();
    frame::encode_management(MGMT_ASSOC_RESP, &STATION_MAC, &AP_BSSID, &AP_BSSID, 3, &body)
}

pub fn deauth_frame(reason: u16) -> Vec<u8> {
    let mut body = Vec::new();
    frame::write_reason(&mut body, reason);
    frame::encode_management(MGMT_DEAUTH, &STATION_MAC, &AP_BSSID, &AP_BSSID, 4, &body)
}

pub fn disassoc_frame(reason: u16) -> Vec<u8> {
    let mut body = Vec::new();
    frame::write_reason(&mut body, reason);
    frame::encode_management(MGMT_DISASSOC, &STATION_MAC, &AP_BSSID, &AP_BSSID, 4, &body)
}

/// A from-DS data frame as the AP would relay it to the station.
pub fn ap_data_frame(src: MacAddr, ethertype: u16, payload: &[u8], seq: u16) -> Vec<u8> {
    let fc = FrameControl::new(TYPE_DATA, DATA_DATA).with_from_ds(true);
    let mut out = Vec::new();
    frame::put_u16_le(&mut out, fc.0);
    frame::put_u16_le(&mut out, 0);
    out.extend_from_slice(&STATION_MAC);
    out.extend_from_slice(&AP_BSSID);
    out.extend_from_slice(&src);
    frame::put_u16_le(&mut out, frame::seq_ctrl(seq));
    frame::write_llc_snap(&mut out, ethertype);
    out.extend_from_slice(payload);
    out
}

pub fn eapol_frame(seq: u16) -> Vec<u8> {
    ap_data_frame(AP_BSSID, frame::ETHER_TYPE_EAPOL, &[0x02, 0x03, 0x00, 0x5F], seq)
}

/// Walks a harness through scan-and-join up to the association response.
pub fn join_network(h: &Harness, ssid: &[u8], passphrase: &[u8], wpa2: bool) {
    let mut builder = ProbeResponseBuilder::new(ssid);
    if wpa2 {
        builder = builder.wpa2();
    }
    h.link.process_received_frame(&builder.build(), -40);
    let request = crate::scan::ScanRequest::broadcast_join(ssid, passphrase).unwrap();
    h.link.scan_worker(request);
    assert_eq!(h.link.state(), LinkState::Authenticating);
    h.link.process_received_frame(&auth_response_frame(0), -40);
    assert_eq!(h.link.state(), LinkState::Associating);
    h.link.process_received_frame(&assoc_response_frame(0, 1), -40);
    assert_eq!(h.link.state(), LinkState::Associated);
}
