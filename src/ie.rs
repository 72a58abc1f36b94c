/// Information-element codec.
///
/// Management-frame bodies carry a run of (id, length, payload) TLVs after
/// their fixed prefix. The reader refuses any element whose declared length
/// runs past the buffer; callers that cache element positions validate the
/// whole run first and store offsets, never pointers.
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::frame::put_u16_le;

pub const IE_SSID: u8 = 0;
pub const IE_SUPPORTED_RATES: u8 = 1;
pub const IE_DSSS_PARAM: u8 = 3;
pub const IE_RSN: u8 = 48;
pub const IE_EXT_SUPPORTED_RATES: u8 = 50;

/// An SSID is 0-32 octets and not necessarily UTF-8.
pub const SSID_MAX_LEN: usize = 32;
pub type Ssid = heapless::Vec<u8, SSID_MAX_LEN>;

/// Combined cap on the basic + extended rate sets the core tracks.
pub const MAX_RATES: usize = 16;
pub type RateSet = heapless::Vec<SupportedRate, MAX_RATES>;

/// The supported-rates IE proper holds at most eight entries; the rest
/// spill into the extended-supported-rates IE.
const RATES_IE_MAX: usize = 8;

/// One advertised rate: `(basic << 7) | (value & 0x7F)`, value in units of
/// 500 kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedRate(pub u8);

impl SupportedRate {
    /// The HT-PHY membership selector shares the rates IE; it is not a rate.
    pub const HT_PHY_SELECTOR: u8 = 127;

    pub fn new(basic: bool, value: u8) -> Self {
        Self(((basic as u8) << 7) | (value & 0x7F))
    }

    pub fn value(self) -> u8 {
        self.0 & 0x7F
    }

    pub fn is_basic(self) -> bool {
        self.0 & 0x80 != 0
    }

    pub fn is_ht_selector(self) -> bool {
        self.value() == Self::HT_PHY_SELECTOR
    }

    pub fn speed_kbps(self) -> u32 {
        u32::from(self.value()) * 500
    }
}

/// Modulation family implied by the top negotiated rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyMode {
    B,
    G,
}

impl PhyMode {
    /// 802.11b tops out at 11 Mbit/s, 802.11g at 54 Mbit/s; anything above
    /// needs PHYs this core does not drive.
    pub fn from_speed_kbps(speed: u32) -> Result<Self> {
        if speed <= 11_000 {
            Ok(PhyMode::B)
        } else if speed <= 54_000 {
            Ok(PhyMode::G)
        } else {
            Err(Error::NotSupported)
        }
    }
}

/// Iterator over the TLV run of a management-frame body.
///
/// Yields `Err` once and then stops if an element's declared length runs
/// past the end of the buffer.
pub struct IeReader<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> IeReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, failed: false }
    }
}

impl<'a> Iterator for IeReader<'a> {
    type Item = Result<(u8, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        if self.pos + 2 > self.buf.len() {
            self.failed = true;
            return Some(Err(Error::DataLengthMismatch));
        }
        let id = self.buf[self.pos];
        let len = self.buf[self.pos + 1] as usize;
        let start = self.pos + 2;
        if start + len > self.buf.len() {
            self.failed = true;
            return Some(Err(Error::DataLengthMismatch));
        }
        self.pos = start + len;
        Some(Ok((id, &self.buf[start..start + len])))
    }
}

/// Checks that the whole TLV run is well formed.
pub fn validate_ies(buf: &[u8]) -> Result<()> {
    for ie in IeReader::new(buf) {
        ie?;
    }
    Ok(())
}

/// Finds the first element with the given id in a validated run.
pub fn find_ie<'a>(buf: &'a [u8], id: u8) -> Option<&'a [u8]> {
    IeReader::new(buf).filter_map(|ie| ie.ok()).find(|(i, _)| *i == id).map(|(_, p)| p)
}

/// Like [`find_ie`], but returns the payload position as an
/// `(offset, length)` pair into `buf` so callers owning the buffer can
/// store ranges instead of borrows.
pub fn find_ie_range(buf: &[u8], id: u8) -> Option<(usize, usize)> {
    let mut pos = 0;
    while pos + 2 <= buf.len() {
        let cur = buf[pos];
        let len = buf[pos + 1] as usize;
        let start = pos + 2;
        if start + len > buf.len() {
            return None;
        }
        if cur == id {
            return Some((start, len));
        }
        pos = start + len;
    }
    None
}

/// Appends one element. Payloads longer than a length byte can express are
/// refused.
pub fn write_ie(out: &mut Vec<u8>, id: u8, payload: &[u8]) -> Result<()> {
    if payload.len() > u8::MAX as usize {
        return Err(Error::DataLengthMismatch);
    }
    out.push(id);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    Ok(())
}

pub fn write_ssid_ie(out: &mut Vec<u8>, ssid: &[u8]) -> Result<()> {
    if ssid.len() > SSID_MAX_LEN {
        return Err(Error::DataLengthMismatch);
    }
    write_ie(out, IE_SSID, ssid)
}

/// Writes the rate set, splitting into the supported-rates IE (first eight)
/// and an extended-supported-rates IE for the remainder.
pub fn write_rates_ies(out: &mut Vec<u8>, rates: &[SupportedRate]) -> Result<()> {
    if rates.is_empty() {
        return Err(Error::DataLengthMismatch);
    }
    let bytes: Vec<u8> = rates.iter().map(|r| r.0).collect();
    let head = &bytes[..bytes.len().min(RATES_IE_MAX)];
    write_ie(out, IE_SUPPORTED_RATES, head)?;
    if bytes.len() > RATES_IE_MAX {
        write_ie(out, IE_EXT_SUPPORTED_RATES, &bytes[RATES_IE_MAX..])?;
    }
    Ok(())
}

pub fn write_dsss_ie(out: &mut Vec<u8>, channel: u8) -> Result<()> {
    write_ie(out, IE_DSSS_PARAM, &[channel])
}

/// Collects the supported and extended rate IEs of a validated run into one
/// set. Entries past the cap are ignored rather than rejected.
pub fn collect_rates(ies: &[u8]) -> RateSet {
    let mut rates = RateSet::new();
    for id in [IE_SUPPORTED_RATES, IE_EXT_SUPPORTED_RATES] {
        if let Some(payload) = find_ie(ies, id) {
            for &b in payload {
                let _ = rates.push(SupportedRate(b));
            }
        }
    }
    rates
}

/// Rate validation against the local rate set.
///
/// Every rate the AP marks basic must be locally supported (the HT-PHY
/// membership selector is ignored); the negotiated rate is the fastest one
/// both sides list. An empty intersection refuses the BSS.
pub fn negotiate_rates(local: &[SupportedRate], ap: &[SupportedRate]) -> Result<SupportedRate> {
    let mut best: Option<SupportedRate> = None;
    for &rate in ap {
        if rate.is_ht_selector() {
            continue;
        }
        let served = local.iter().any(|l| l.value() == rate.value());
        if rate.is_basic() && !served {
            return Err(Error::NotSupported);
        }
        if served && best.map_or(true, |b| rate.value() > b.value()) {
            best = Some(rate);
        }
    }
    best.ok_or(Error::NotSupported)
}

// RSN suite selectors are big-endian OUI:type pairs (IEEE 802.11-2012,
// 8.4.2.27).
pub const OUI_IEEE: [u8; 3] = [0x00, 0x0F, 0xAC];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suite {
    pub oui: [u8; 3],
    pub kind: u8,
}

impl Suite {
    pub const CCMP: Suite = Suite { oui: OUI_IEEE, kind: 4 };
    pub const AKM_PSK: Suite = Suite { oui: OUI_IEEE, kind: 2 };
    pub const AKM_PSK_SHA256: Suite = Suite { oui: OUI_IEEE, kind: 6 };

    fn parse(buf: &[u8]) -> Suite {
        Suite { oui: [buf[0], buf[1], buf[2]], kind: buf[3] }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.oui);
        out.push(self.kind);
    }
}

const MAX_SUITES: usize = 4;

/// Parsed RSN element. Sections absent from a truncated element take the
/// protocol defaults (CCMP group, CCMP pairwise, PSK AKM, no capabilities).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsnInfo {
    pub version: u16,
    pub group: Suite,
    pub pairwise: heapless::Vec<Suite, MAX_SUITES>,
    pub akms: heapless::Vec<Suite, MAX_SUITES>,
    pub capabilities: u16,
}

impl Default for RsnInfo {
    fn default() -> Self {
        let mut pairwise = heapless::Vec::new();
        let _ = pairwise.push(Suite::CCMP);
        let mut akms = heapless::Vec::new();
        let _ = akms.push(Suite::AKM_PSK);
        Self { version: 1, group: Suite::CCMP, pairwise, akms, capabilities: 0 }
    }
}

impl RsnInfo {
    /// Parses an RSN element body. The version must be 1; each later
    /// section is optional, but a section that starts must be complete.
    pub fn parse(body: &[u8]) -> Result<RsnInfo> {
        if body.len() < 2 {
            return Err(Error::DataLengthMismatch);
        }
        let version = LittleEndian::read_u16(&body[0..2]);
        if version != 1 {
            return Err(Error::VersionMismatch);
        }
        let mut info = RsnInfo::default();
        let mut rest = &body[2..];

        // Group cipher suite.
        if rest.is_empty() {
            return Ok(info);
        }
        if rest.len() < 4 {
            return Err(Error::DataLengthMismatch);
        }
        info.group = Suite::parse(rest);
        rest = &rest[4..];

        // Pairwise suite list.
        match read_suite_list(&mut rest)? {
            Some(list) => info.pairwise = list,
            None => return Ok(info),
        }

        // AKM suite list.
        match read_suite_list(&mut rest)? {
            Some(list) => info.akms = list,
            None => return Ok(info),
        }

        // RSN capabilities.
        if rest.is_empty() {
            return Ok(info);
        }
        if rest.len() < 2 {
            return Err(Error::DataLengthMismatch);
        }
        info.capabilities = LittleEndian::read_u16(&rest[0..2]);
        rest = &rest[2..];

        // PMKID list and group-management cipher follow; this core does not
        // consume them but still bounds-checks the declared count.
        if rest.is_empty() {
            return Ok(info);
        }
        if rest.len() < 2 {
            return Err(Error::DataLengthMismatch);
        }
        let pmkid_count = LittleEndian::read_u16(&rest[0..2]) as usize;
        rest = &rest[2..];
        let pmkid_len = pmkid_count.checked_mul(16).ok_or(Error::DataLengthMismatch)?;
        if rest.len() < pmkid_len {
            return Err(Error::DataLengthMismatch);
        }
        rest = &rest[pmkid_len..];
        if !rest.is_empty() && rest.len() < 4 {
            return Err(Error::DataLengthMismatch);
        }
        Ok(info)
    }

    /// True when the element offers CCMP for both group and pairwise and an
    /// AKM this core speaks (PSK or PSK-SHA256). Anything weaker is refused.
    pub fn supports_ccmp_psk(&self) -> bool {
        self.group == Suite::CCMP
            && self.pairwise.iter().any(|s| *s == Suite::CCMP)
            && self
                .akms
                .iter()
                .any(|s| *s == Suite::AKM_PSK || *s == Suite::AKM_PSK_SHA256)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        put_u16_le(out, self.version);
        self.group.write(out);
        put_u16_le(out, self.pairwise.len() as u16);
        for s in &self.pairwise {
            s.write(out);
        }
        put_u16_le(out, self.akms.len() as u16);
        for s in &self.akms {
            s.write(out);
        }
        put_u16_le(out, self.capabilities);
    }
}

fn read_suite_list(rest: &mut &[u8]) -> Result<Option<heapless::Vec<Suite, MAX_SUITES>>> {
    if rest.is_empty() {
        return Ok(None);
    }
    if rest.len() < 2 {
        return Err(Error::DataLengthMismatch);
    }
    let count = LittleEndian::read_u16(&rest[0..2]) as usize;
    let bytes = count.checked_mul(4).ok_or(Error::DataLengthMismatch)?;
    if rest.len() < 2 + bytes {
        return Err(Error::DataLengthMismatch);
    }
    let mut list = heapless::Vec::new();
    for i in 0..count {
        let off = 2 + i * 4;
        // Suites past the cap cannot be ones we would select anyway.
        let _ = list.push(Suite::parse(&rest[off..off + 4]));
    }
    *rest = &rest[2 + bytes..];
    Ok(Some(list))
}

/// The station's fixed advertised RSN body: version 1, group CCMP, one
/// pairwise suite (CCMP), one AKM (PSK), zero capabilities.
pub const STATION_RSN_BODY: [u8; 20] = [
    0x01, 0x00, // version
    0x00, 0x0F, 0xAC, 0x04, // group: CCMP
    0x01, 0x00, // pairwise count
    0x00, 0x0F, 0xAC, 0x04, // pairwise: CCMP
    0x01, 0x00, // AKM count
    0x00, 0x0F, 0xAC, 0x02, // AKM: PSK
    0x00, 0x00, // capabilities
];

/// Suite selectors are transmitted big-endian when viewed as a 32-bit
/// value; expose the numeric form for diagnostics.
pub fn suite_selector(suite: &Suite) -> u32 {
    let mut b = [0u8; 4];
    b[..3].copy_from_slice(&suite.oui);
    b[3] = suite.kind;
    BigEndian::read_u32(&b)
}
