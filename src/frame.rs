/// 802.11 MAC frame codec.
///
/// Builds and parses the three frame layouts (management, control, data)
/// plus the LLC+SNAP prefix data frames carry. Pure byte-level logic with no
/// link state; the connection machinery composes these into full exchanges.
///
/// All multi-byte header integers are little-endian on the wire. The SNAP
/// EtherType is big-endian, as are the RSN suite selectors handled in `ie`.
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// A 6-byte IEEE 802 MAC address.
pub type MacAddr = [u8; 6];

/// The all-stations broadcast address.
pub const BROADCAST_ADDR: MacAddr = [0xFF; 6];

/// Length of the fixed portion of a management or data frame header.
pub const MAC_HEADER_LEN: usize = 24;

/// Length of the LLC + SNAP prefix on data frames.
pub const LLC_SNAP_LEN: usize = 8;

pub const TYPE_MGMT: u8 = 0;
pub const TYPE_CTRL: u8 = 1;
pub const TYPE_DATA: u8 = 2;

// Management subtypes (IEEE Std 802.11-2012, 8.2.4.1.3)
pub const MGMT_ASSOC_REQ: u8 = 0;
pub const MGMT_ASSOC_RESP: u8 = 1;
pub const MGMT_REASSOC_REQ: u8 = 2;
pub const MGMT_REASSOC_RESP: u8 = 3;
pub const MGMT_PROBE_REQ: u8 = 4;
pub const MGMT_PROBE_RESP: u8 = 5;
pub const MGMT_BEACON: u8 = 8;
pub const MGMT_DISASSOC: u8 = 10;
pub const MGMT_AUTH: u8 = 11;
pub const MGMT_DEAUTH: u8 = 12;

// Data subtypes
pub const DATA_DATA: u8 = 0;
pub const DATA_NULL: u8 = 4;

/// Open System authentication algorithm number.
pub const AUTH_ALGORITHM_OPEN: u16 = 0;

/// Management status code meaning success.
pub const STATUS_SUCCESS: u16 = 0;

// Reason codes the station emits (IEEE Std 802.11-2012, 8.4.1.7)
pub const REASON_DEAUTH_LEAVING: u16 = 3;
pub const REASON_DISASSOC_LEAVING: u16 = 8;

/// EtherType carrying EAPOL handshake messages.
pub const ETHER_TYPE_EAPOL: u16 = 0x888E;

/// Association IDs occupy 14 bits; the upper two bits of the field are set
/// on the wire and masked off when read.
pub const AID_MASK: u16 = 0x3FFF;

/// The frame-control word leading every frame.
///
/// Bits: protocol version 0-1, type 2-3, subtype 4-7, to-DS 8, from-DS 9,
/// more-fragments 10, retry 11, power-management 12, more-data 13,
/// protected 14, order 15.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl(pub u16);

impl FrameControl {
    pub fn new(frame_type: u8, subtype: u8) -> Self {
        Self((u16::from(frame_type & 0x3) << 2) | (u16::from(subtype & 0xF) << 4))
    }

    pub fn protocol_version(self) -> u8 {
        (self.0 & 0x3) as u8
    }

    pub fn frame_type(self) -> u8 {
        ((self.0 >> 2) & 0x3) as u8
    }

    pub fn subtype(self) -> u8 {
        ((self.0 >> 4) & 0xF) as u8
    }

    pub fn to_ds(self) -> bool {
        self.0 & (1 << 8) != 0
    }

    pub fn from_ds(self) -> bool {
        self.0 & (1 << 9) != 0
    }

    pub fn power_mgmt(self) -> bool {
        self.0 & (1 << 12) != 0
    }

    pub fn protected(self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn with_to_ds(self, v: bool) -> Self {
        self.with_bit(8, v)
    }

    pub fn with_from_ds(self, v: bool) -> Self {
        self.with_bit(9, v)
    }

    pub fn with_power_mgmt(self, v: bool) -> Self {
        self.with_bit(12, v)
    }

    pub fn with_protected(self, v: bool) -> Self {
        self.with_bit(14, v)
    }

    fn with_bit(self, bit: u16, v: bool) -> Self {
        if v {
            Self(self.0 | (1 << bit))
        } else {
            Self(self.0 & !(1 << bit))
        }
    }
}

bitflags::bitflags! {
    /// Capability bitmap advertised in beacons and association exchanges.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CapabilityInfo: u16 {
        const ESS            = 1 << 0;
        const IBSS           = 1 << 1;
        const CF_POLLABLE    = 1 << 2;
        const CF_POLL_REQ    = 1 << 3;
        const PRIVACY        = 1 << 4;
        const SHORT_PREAMBLE = 1 << 5;
    }
}

/// Parsed fixed header shared by management and data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_control: FrameControl,
    pub duration: u16,
    pub addr1: MacAddr,
    pub addr2: MacAddr,
    pub addr3: MacAddr,
    pub seq_ctrl: u16,
}

impl FrameHeader {
    /// 12-bit sequence number (upper bits of the sequence-control field).
    pub fn sequence(&self) -> u16 {
        self.seq_ctrl >> 4
    }

    /// 4-bit fragment number.
    pub fn fragment(&self) -> u16 {
        self.seq_ctrl & 0xF
    }
}

/// Splits a raw frame into its fixed header and body.
///
/// Control frames use shorter layouts and are not parsed here; the caller
/// classifies on the first frame-control byte before calling.
pub fn parse_frame(frame: &[u8]) -> Result<(FrameHeader, &[u8])> {
    if frame.len() < MAC_HEADER_LEN {
        return Err(Error::DataLengthMismatch);
    }
    let header = FrameHeader {
        frame_control: FrameControl(LittleEndian::read_u16(&frame[0..2])),
        duration: LittleEndian::read_u16(&frame[2..4]),
        addr1: frame[4..10].try_into().unwrap_or_default(),
        addr2: frame[10..16].try_into().unwrap_or_default(),
        addr3: frame[16..22].try_into().unwrap_or_default(),
        seq_ctrl: LittleEndian::read_u16(&frame[22..24]),
    };
    Ok((header, &frame[MAC_HEADER_LEN..]))
}

/// Reads the frame type without requiring a full header.
pub fn peek_frame_type(frame: &[u8]) -> Option<u8> {
    frame.first().map(|b| (b >> 2) & 0x3)
}

pub(crate) fn put_u16_le(out: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    LittleEndian::write_u16(&mut b, v);
    out.extend_from_slice(&b);
}

pub(crate) fn put_u16_be(out: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, v);
    out.extend_from_slice(&b);
}

/// Encodes the sequence-control field for a whole-frame sequence number.
/// The fragment bits stay zero; this core does not fragment.
pub fn seq_ctrl(seq: u16) -> u16 {
    (seq & 0xFFF) << 4
}

fn write_header(
    out: &mut Vec<u8>,
    fc: FrameControl,
    addr1: &MacAddr,
    addr2: &MacAddr,
    addr3: &MacAddr,
    seq: u16,
) {
    put_u16_le(out, fc.0);
    // Duration stays zero; the radio fills it on transmit.
    put_u16_le(out, 0);
    out.extend_from_slice(addr1);
    out.extend_from_slice(addr2);
    out.extend_from_slice(addr3);
    put_u16_le(out, seq_ctrl(seq));
}

/// Builds a management frame: header + caller-provided body.
///
/// Address order is (destination, transmitter, BSSID).
pub fn encode_management(
    subtype: u8,
    dst: &MacAddr,
    src: &MacAddr,
    bssid: &MacAddr,
    seq: u16,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAC_HEADER_LEN + body.len());
    write_header(&mut out, FrameControl::new(TYPE_MGMT, subtype), dst, src, bssid, seq);
    out.extend_from_slice(body);
    out
}

/// Builds an outbound (to-DS) data frame around an LLC+SNAP-wrapped payload.
///
/// Address order on the to-DS path is (receiver = BSSID, transmitter = src,
/// destination). A `None` destination means broadcast. The protected bit is
/// set by the caller's cipher step, not here.
pub fn encode_data(
    src: &MacAddr,
    dst: Option<&MacAddr>,
    bssid: &MacAddr,
    protocol: u16,
    payload: &[u8],
    seq: u16,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAC_HEADER_LEN + LLC_SNAP_LEN + payload.len());
    let fc = FrameControl::new(TYPE_DATA, DATA_DATA).with_to_ds(true);
    write_header(&mut out, fc, bssid, src, dst.unwrap_or(&BROADCAST_ADDR), seq);
    write_llc_snap(&mut out, protocol);
    out.extend_from_slice(payload);
    out
}

/// Builds a null-data frame. With `power_mgmt` set it asks the AP to buffer
/// inbound traffic; cleared, it resumes delivery.
pub fn encode_null_data(src: &MacAddr, bssid: &MacAddr, power_mgmt: bool, seq: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAC_HEADER_LEN);
    let fc = FrameControl::new(TYPE_DATA, DATA_NULL)
        .with_to_ds(true)
        .with_power_mgmt(power_mgmt);
    write_header(&mut out, fc, bssid, src, bssid, seq);
    out
}

/// Writes the LLC + SNAP prefix carrying an EtherType.
pub fn write_llc_snap(out: &mut Vec<u8>, ethertype: u16) {
    // DSAP = SSAP = 0xAA (SNAP), unnumbered information, zero OUI.
    out.extend_from_slice(&[0xAA, 0xAA, 0x03, 0x00, 0x00, 0x00]);
    put_u16_be(out, ethertype);
}

/// Validates and strips the LLC + SNAP prefix of a received data frame body,
/// returning the EtherType and the layer-3 payload.
pub fn parse_llc_snap(body: &[u8]) -> Result<(u16, &[u8])> {
    if body.len() < LLC_SNAP_LEN {
        return Err(Error::DataLengthMismatch);
    }
    if body[0] != 0xAA || body[1] != 0xAA || body[2] != 0x03 {
        return Err(Error::DataLengthMismatch);
    }
    let ethertype = BigEndian::read_u16(&body[6..8]);
    Ok((ethertype, &body[LLC_SNAP_LEN..]))
}

/// Fixed body of an authentication frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthBody {
    pub algorithm: u16,
    pub txn_seq: u16,
    pub status: u16,
}

impl AuthBody {
    pub const LEN: usize = 6;

    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < Self::LEN {
            return Err(Error::DataLengthMismatch);
        }
        Ok(Self {
            algorithm: LittleEndian::read_u16(&body[0..2]),
            txn_seq: LittleEndian::read_u16(&body[2..4]),
            status: LittleEndian::read_u16(&body[4..6]),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        put_u16_le(out, self.algorithm);
        put_u16_le(out, self.txn_seq);
        put_u16_le(out, self.status);
    }
}

/// Parsed fixed prefix of an association response, with the trailing IEs.
#[derive(Debug, Clone, Copy)]
pub struct AssocRespView<'a> {
    pub capabilities: CapabilityInfo,
    pub status: u16,
    pub aid: u16,
    pub ies: &'a [u8],
}

impl<'a> AssocRespView<'a> {
    pub const PREFIX_LEN: usize = 6;

    pub fn parse(body: &'a [u8]) -> Result<Self> {
        if body.len() < Self::PREFIX_LEN {
            return Err(Error::DataLengthMismatch);
        }
        Ok(Self {
            capabilities: CapabilityInfo::from_bits_retain(LittleEndian::read_u16(&body[0..2])),
            status: LittleEndian::read_u16(&body[2..4]),
            aid: LittleEndian::read_u16(&body[4..6]) & AID_MASK,
            ies: &body[Self::PREFIX_LEN..],
        })
    }
}

/// Parsed fixed prefix of a beacon or probe response, with the trailing IEs.
#[derive(Debug, Clone, Copy)]
pub struct ProbeView<'a> {
    pub timestamp: u64,
    pub beacon_interval: u16,
    pub capabilities: CapabilityInfo,
    pub ies: &'a [u8],
}

impl<'a> ProbeView<'a> {
    pub const PREFIX_LEN: usize = 12;

    /// Parses the fixed prefix and validates every trailing IE before
    /// returning, so a caller that then walks the IEs cannot run past the
    /// frame on a bad length byte.
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        if body.len() < Self::PREFIX_LEN {
            return Err(Error::DataLengthMismatch);
        }
        let ies = &body[Self::PREFIX_LEN..];
        crate::ie::validate_ies(ies)?;
        Ok(Self {
            timestamp: LittleEndian::read_u64(&body[0..8]),
            beacon_interval: LittleEndian::read_u16(&body[8..10]),
            capabilities: CapabilityInfo::from_bits_retain(LittleEndian::read_u16(&body[10..12])),
            ies,
        })
    }
}

/// Reads the reason code of a deauthentication or disassociation body.
pub fn parse_reason(body: &[u8]) -> Result<u16> {
    if body.len() < 2 {
        return Err(Error::DataLengthMismatch);
    }
    Ok(LittleEndian::read_u16(&body[0..2]))
}

/// Writes a reason-code body.
pub fn write_reason(out: &mut Vec<u8>, reason: u16) {
    put_u16_le(out, reason);
}
