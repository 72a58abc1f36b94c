/// Connection state machine.
///
/// The progression runs Uninitialised → Initialised → Probing →
/// Authenticating → Associating → Associated → Encrypted, with AP-initiated
/// deauthentication and disassociation dropping back to re-attempt states
/// and every failure path landing in Initialised. Transitions serialise on
/// the link lock; the driver observes exactly one `set_state` per
/// transition, and entry actions for a state begin only after that call
/// returns.
///
/// Probing is special: no other transition is allowed while a probe is in
/// flight. A transition requested during a probe is latched in
/// `probe_next` and replayed when the probe exits, so the hardware sees one
/// mode change at a time.
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::bss::BssEntry;
use crate::device::{BssDescriptor, LinkStatus};
use crate::error::{Error, Result};
use crate::frame::{
    self, AssocRespView, AuthBody, CapabilityInfo, FrameHeader, MacAddr, AUTH_ALGORITHM_OPEN,
    MGMT_ASSOC_REQ, MGMT_AUTH, MGMT_DEAUTH, MGMT_DISASSOC, REASON_DEAUTH_LEAVING,
    REASON_DISASSOC_LEAVING, STATUS_SUCCESS,
};
use crate::ie::{self, PhyMode};
use crate::key::SLOT_PAIRWISE;
use crate::link::{Link, LinkInner};

/// Window for the authentication reply.
pub(crate) const AUTH_TIMEOUT: Duration = Duration::from_secs(2);
/// Window for the association reply.
pub(crate) const ASSOC_TIMEOUT: Duration = Duration::from_secs(2);
/// Window for the complete four-way key handshake.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state of a link. The driver is told about every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Uninitialised,
    Initialised,
    Probing,
    Authenticating,
    Associating,
    Associated,
    Encrypted,
}

impl LinkState {
    /// Connected enough to carry (or be about to carry) data.
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Associated | LinkState::Encrypted)
    }
}

/// Why a connection is being dropped back to Initialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DropReason {
    /// The caller asked to leave; the AP is notified and the entry leaves
    /// the list.
    LocalLeave,
    /// A timeout, refused reply, or entry-action failure.
    Failure,
    /// The active AP changed its advertised parameters mid-connection.
    ApChanged,
}

/// A transition latched while Probing, replayed on probe exit.
pub(crate) enum ProbeNext {
    Initialised(DropReason),
    Authenticating(Arc<BssEntry>),
    Associating(Arc<BssEntry>),
}

/// How a scan sweep wants to leave the Probing state.
pub(crate) enum ScanExit {
    /// Back to whatever state the probe interrupted.
    Restore,
    /// Sweep finished without a join.
    Initialised,
    /// Sweep selected this entry; go authenticate against it.
    Join(Arc<BssEntry>),
}

/// A reply counts only if it came from the joined BSS.
fn reply_from_active(header: &FrameHeader, bssid: &MacAddr) -> Result<()> {
    if header.addr2 != *bssid || header.addr3 != *bssid {
        return Err(Error::InvalidAddress);
    }
    Ok(())
}

impl Link {
    pub(crate) fn send_mgmt_frame(
        &self,
        subtype: u8,
        dst: &MacAddr,
        bssid: &MacAddr,
        body: &[u8],
    ) -> Result<()> {
        let frame =
            frame::encode_management(subtype, dst, &self.props.mac, bssid, self.seq_next(), body);
        self.driver.send(vec![frame]).map_err(Error::Driver)
    }

    pub(crate) fn driver_set_state(
        &self,
        state: LinkState,
        bss: Option<&Arc<BssEntry>>,
    ) -> Result<()> {
        let desc = bss.map(|b| {
            let params = b.params();
            BssDescriptor {
                bssid: *b.bssid(),
                channel: params.channel,
                beacon_interval: params.beacon_interval,
            }
        });
        self.driver.set_state(state, desc.as_ref()).map_err(Error::Driver)
    }

    /// Drops the connection, notifies the AP when this side is the one
    /// walking away, wipes keys, and lands in Initialised.
    pub(crate) fn move_to_initialised_locked(&self, inner: &mut LinkInner, reason: DropReason) {
        if inner.state == LinkState::Probing {
            inner.probe_next = Some(ProbeNext::Initialised(reason));
            return;
        }
        let prev = inner.state;
        self.timer.cancel();
        inner.timer_generation = 0;

        if let Some(active) = inner.active.upgrade() {
            if matches!(reason, DropReason::LocalLeave | DropReason::ApChanged) {
                let notice = match prev {
                    LinkState::Associated | LinkState::Encrypted => {
                        Some((MGMT_DISASSOC, REASON_DISASSOC_LEAVING))
                    }
                    LinkState::Associating => Some((MGMT_DEAUTH, REASON_DEAUTH_LEAVING)),
                    _ => None,
                };
                if let Some((subtype, reason_code)) = notice {
                    let mut body = Vec::new();
                    frame::write_reason(&mut body, reason_code);
                    if let Err(e) =
                        self.send_mgmt_frame(subtype, active.bssid(), active.bssid(), &body)
                    {
                        debug!("could not notify AP while leaving: {}", e);
                    }
                }
            }
            let had_session = {
                let mut join = active.join();
                let had = join.handshake_active;
                join.handshake_active = false;
                join.wipe_keys();
                had
            };
            if had_session {
                self.cipher.teardown(&active);
            }
            inner.active.clear();
            if reason == DropReason::LocalLeave {
                inner.bss_list.remove(active.bssid());
            }
        }

        self.flush_paused_locked(inner);
        if inner.link_up {
            inner.link_up = false;
            self.network.link_status(LinkStatus::down());
        }
        if let Err(e) = self.driver.set_state(LinkState::Initialised, None) {
            warn!("driver refused Initialised during teardown: {:?}", e);
        }
        inner.state = LinkState::Initialised;
    }

    /// Makes `bss` the active entry and opens the authentication exchange.
    /// On any entry-action failure the machine lands back in Initialised.
    pub(crate) fn begin_authenticating_locked(
        &self,
        inner: &mut LinkInner,
        bss: Arc<BssEntry>,
    ) -> Result<()> {
        if inner.state == LinkState::Probing {
            inner.probe_next = Some(ProbeNext::Authenticating(bss));
            return Ok(());
        }
        let outcome = self.authenticate_entry_actions(inner, &bss);
        if outcome.is_err() {
            self.move_to_initialised_locked(inner, DropReason::Failure);
        }
        outcome
    }

    fn authenticate_entry_actions(&self, inner: &mut LinkInner, bss: &Arc<BssEntry>) -> Result<()> {
        if inner.state.is_connected() {
            self.pause_data_frames_locked(inner);
        }
        if inner.link_up {
            inner.link_up = false;
            self.network.link_status(LinkStatus::down());
        }
        inner.bss_list.insert(bss.clone());
        inner.active.set(bss);

        let channel = bss.params().channel;
        if channel != inner.current_channel {
            self.driver.set_channel(channel).map_err(Error::Driver)?;
            inner.current_channel = channel;
        }
        self.driver_set_state(LinkState::Authenticating, Some(bss))?;
        inner.state = LinkState::Authenticating;

        // Open System authentication, first message of the exchange.
        let mut body = Vec::new();
        AuthBody { algorithm: AUTH_ALGORITHM_OPEN, txn_seq: 1, status: STATUS_SUCCESS }
            .write(&mut body);
        self.send_mgmt_frame(MGMT_AUTH, bss.bssid(), bss.bssid(), &body)?;
        inner.timer_generation = self.timer.arm(AUTH_TIMEOUT);
        Ok(())
    }

    pub(crate) fn begin_associating_locked(
        &self,
        inner: &mut LinkInner,
        bss: Arc<BssEntry>,
    ) -> Result<()> {
        if inner.state == LinkState::Probing {
            inner.probe_next = Some(ProbeNext::Associating(bss));
            return Ok(());
        }
        let outcome = self.associate_entry_actions(inner, &bss);
        if outcome.is_err() {
            self.move_to_initialised_locked(inner, DropReason::Failure);
        }
        outcome
    }

    fn associate_entry_actions(&self, inner: &mut LinkInner, bss: &Arc<BssEntry>) -> Result<()> {
        self.driver_set_state(LinkState::Associating, Some(bss))?;
        inner.state = LinkState::Associating;

        let mut body = Vec::new();
        {
            let params = bss.params();
            let mut capabilities = self.props.capabilities;
            if params.security.pairwise_cipher() {
                capabilities |= CapabilityInfo::PRIVACY;
            }
            frame::put_u16_le(&mut body, capabilities.bits());
            frame::put_u16_le(&mut body, 0); // listen interval
            ie::write_ssid_ie(&mut body, params.ssid_bytes())?;
            ie::write_rates_ies(&mut body, &self.props.rates)?;
            if params.security.pairwise_cipher() {
                ie::write_ie(&mut body, ie::IE_RSN, &ie::STATION_RSN_BODY)?;
            }
        }
        self.send_mgmt_frame(MGMT_ASSOC_REQ, bss.bssid(), bss.bssid(), &body)?;
        inner.timer_generation = self.timer.arm(ASSOC_TIMEOUT);
        Ok(())
    }

    fn enter_associated_locked(&self, inner: &mut LinkInner, bss: &Arc<BssEntry>) {
        if let Err(e) = self.driver_set_state(LinkState::Associated, Some(bss)) {
            warn!("driver refused Associated: {}", e);
            self.move_to_initialised_locked(inner, DropReason::Failure);
            return;
        }
        inner.state = LinkState::Associated;

        if bss.params().security.pairwise_cipher() {
            bss.join().handshake_active = true;
            if let Err(e) = self.cipher.init_handshake(self, bss) {
                warn!("could not start key handshake: {}", e);
                self.move_to_initialised_locked(inner, DropReason::Failure);
                return;
            }
            inner.timer_generation = self.timer.arm(HANDSHAKE_TIMEOUT);
        } else {
            self.bring_link_up_locked(inner, bss);
        }
    }

    fn bring_link_up_locked(&self, inner: &mut LinkInner, bss: &Arc<BssEntry>) {
        let speed_kbps = bss.join().max_rate.map(|r| r.speed_kbps()).unwrap_or(0);
        let mode = PhyMode::from_speed_kbps(speed_kbps).ok();
        self.resume_data_frames_locked(inner);
        inner.link_up = true;
        self.network.link_status(LinkStatus { up: true, speed_kbps, mode });
    }

    /// Called by the authenticator session once the four-way handshake has
    /// produced and installed keys. Drives Associated → Encrypted and
    /// releases paused traffic.
    pub fn handshake_complete(&self) {
        let mut inner = self.lock_inner();
        if inner.state != LinkState::Associated {
            debug!("handshake completion in state {:?} ignored", inner.state);
            return;
        }
        let Some(active) = inner.active.upgrade() else { return };
        {
            let mut join = active.join();
            if !join.handshake_active {
                debug!("handshake completion without a session ignored");
                return;
            }
            if join.keys[SLOT_PAIRWISE].is_none() {
                drop(join);
                warn!("handshake completed without a pairwise key");
                self.move_to_initialised_locked(&mut inner, DropReason::Failure);
                return;
            }
            join.handshake_active = false;
            join.encrypt_data = true;
        }
        self.cipher.teardown(&active);
        self.timer.cancel();
        inner.timer_generation = 0;

        if let Err(e) = self.driver_set_state(LinkState::Encrypted, Some(&active)) {
            warn!("driver refused Encrypted: {}", e);
            self.move_to_initialised_locked(&mut inner, DropReason::Failure);
            return;
        }
        inner.state = LinkState::Encrypted;
        self.bring_link_up_locked(&mut inner, &active);
    }

    /// Authentication reply handler.
    pub(crate) fn on_auth_frame(&self, header: &FrameHeader, body: &[u8]) {
        let mut inner = self.lock_inner();
        if inner.state != LinkState::Authenticating {
            debug!("authentication frame outside Authenticating ignored");
            return;
        }
        let Some(active) = inner.active.upgrade() else { return };
        if let Err(e) = reply_from_active(header, active.bssid()) {
            warn!("authentication reply from {:02x?} ignored: {}", header.addr2, e);
            return;
        }
        let auth = match AuthBody::parse(body) {
            Ok(auth) => auth,
            Err(e) => {
                debug!("malformed authentication reply: {}", e);
                return;
            }
        };
        if auth.algorithm != AUTH_ALGORITHM_OPEN
            || auth.txn_seq != 2
            || auth.status != STATUS_SUCCESS
        {
            warn!(
                "authentication refused (algorithm {}, txn {}, status {})",
                auth.algorithm, auth.txn_seq, auth.status
            );
            self.move_to_initialised_locked(&mut inner, DropReason::Failure);
            return;
        }
        // Reply beat the timer; disarm it before moving on.
        self.timer.cancel();
        inner.timer_generation = 0;
        let _ = self.begin_associating_locked(&mut inner, active);
    }

    /// Association reply handler.
    pub(crate) fn on_assoc_resp_frame(&self, header: &FrameHeader, body: &[u8]) {
        let mut inner = self.lock_inner();
        if inner.state != LinkState::Associating {
            debug!("association response outside Associating ignored");
            return;
        }
        let Some(active) = inner.active.upgrade() else { return };
        if let Err(e) = reply_from_active(header, active.bssid()) {
            warn!("association response from {:02x?} ignored: {}", header.addr2, e);
            return;
        }
        let view = match AssocRespView::parse(body) {
            Ok(view) => view,
            Err(e) => {
                debug!("malformed association response: {}", e);
                return;
            }
        };
        if view.status != STATUS_SUCCESS {
            warn!("association refused with status {}", view.status);
            self.move_to_initialised_locked(&mut inner, DropReason::Failure);
            return;
        }
        if ie::validate_ies(view.ies).is_err() {
            debug!("association response carries malformed elements");
            return;
        }
        let resp_rates = ie::collect_rates(view.ies);
        let rates = if resp_rates.is_empty() { active.params().rates.clone() } else { resp_rates };
        let max_rate = match ie::negotiate_rates(&self.props.rates, &rates) {
            Ok(rate) => rate,
            Err(e) => {
                warn!("no serviceable rate set with AP: {}", e);
                self.move_to_initialised_locked(&mut inner, DropReason::Failure);
                return;
            }
        };
        {
            let mut join = active.join();
            join.aid = view.aid;
            join.max_rate = Some(max_rate);
        }
        self.timer.cancel();
        inner.timer_generation = 0;
        self.enter_associated_locked(&mut inner, &active);
    }

    /// AP-initiated deauthentication: rebuild fresh state against a
    /// reconnect copy and re-enter the authentication exchange.
    pub(crate) fn on_deauth_frame(&self, header: &FrameHeader, body: &[u8]) {
        let mut inner = self.lock_inner();
        let Some(active) = inner.active.upgrade() else { return };
        if reply_from_active(header, active.bssid()).is_err() {
            debug!("deauthentication from a foreign address ignored");
            return;
        }
        let reason = frame::parse_reason(body).unwrap_or(0);
        match inner.state {
            LinkState::Associated | LinkState::Encrypted => {
                warn!("deauthenticated by AP (reason {}); re-authenticating", reason);
                let copy = self.prepare_reconnect_locked(&mut inner, &active);
                let _ = self.begin_authenticating_locked(&mut inner, copy);
            }
            LinkState::Probing if inner.pre_probe_state.is_connected() => {
                warn!("deauthenticated by AP during a probe (reason {})", reason);
                let copy = self.prepare_reconnect_locked(&mut inner, &active);
                inner.probe_next = Some(ProbeNext::Authenticating(copy));
            }
            LinkState::Authenticating | LinkState::Associating => {
                warn!("deauthenticated by AP mid-attempt (reason {})", reason);
                self.move_to_initialised_locked(&mut inner, DropReason::Failure);
            }
            _ => {}
        }
    }

    /// AP-initiated disassociation: authentication still stands, so only
    /// the association is re-attempted, against the same entry with keys
    /// wiped.
    pub(crate) fn on_disassoc_frame(&self, header: &FrameHeader, body: &[u8]) {
        let mut inner = self.lock_inner();
        let Some(active) = inner.active.upgrade() else { return };
        if reply_from_active(header, active.bssid()).is_err() {
            debug!("disassociation from a foreign address ignored");
            return;
        }
        let reason = frame::parse_reason(body).unwrap_or(0);
        match inner.state {
            LinkState::Associated | LinkState::Encrypted => {
                warn!("disassociated by AP (reason {}); re-associating", reason);
                self.prepare_reassociation_locked(&mut inner, &active);
                let _ = self.begin_associating_locked(&mut inner, active);
            }
            LinkState::Probing if inner.pre_probe_state.is_connected() => {
                warn!("disassociated by AP during a probe (reason {})", reason);
                self.prepare_reassociation_locked(&mut inner, &active);
                inner.probe_next = Some(ProbeNext::Associating(active));
            }
            _ => {}
        }
    }

    /// Common teardown before a reconnect copy replaces the active entry.
    fn prepare_reconnect_locked(
        &self,
        inner: &mut LinkInner,
        original: &Arc<BssEntry>,
    ) -> Arc<BssEntry> {
        debug_assert!(inner.active.is(original));
        self.pause_data_frames_locked(inner);
        if inner.link_up {
            inner.link_up = false;
            self.network.link_status(LinkStatus::down());
        }
        let had_session = {
            let mut join = original.join();
            let had = join.handshake_active;
            join.handshake_active = false;
            join.wipe_keys();
            had
        };
        if had_session {
            self.cipher.teardown(original);
        }
        let copy = original.copy_for_reconnect();
        // The copy replaces the original in the list; the original lives on
        // only through references already in flight.
        inner.bss_list.insert(copy.clone());
        inner.active.set(&copy);
        copy
    }

    fn prepare_reassociation_locked(&self, inner: &mut LinkInner, active: &Arc<BssEntry>) {
        self.pause_data_frames_locked(inner);
        if inner.link_up {
            inner.link_up = false;
            self.network.link_status(LinkStatus::down());
        }
        let had_session = {
            let mut join = active.join();
            let had = join.handshake_active;
            join.handshake_active = false;
            join.wipe_keys();
            had
        };
        if had_session {
            self.cipher.teardown(active);
        }
    }

    /// Deferred state-timer fire. The generation is re-checked under the
    /// link lock; a fire that lost the race to a reply or a cancel aborts
    /// silently.
    pub(crate) fn on_state_timeout(&self, generation: u64) {
        let mut inner = self.lock_inner();
        if generation == 0 || generation != inner.timer_generation {
            return;
        }
        inner.timer_generation = 0;
        match inner.state {
            LinkState::Authenticating => {
                warn!("authentication timed out");
                self.move_to_initialised_locked(&mut inner, DropReason::Failure);
            }
            LinkState::Associating => {
                warn!("association timed out");
                self.move_to_initialised_locked(&mut inner, DropReason::Failure);
            }
            LinkState::Associated => {
                let pending = inner
                    .active
                    .upgrade()
                    .map(|bss| bss.join().handshake_active)
                    .unwrap_or(false);
                if pending {
                    warn!("key handshake timed out");
                    self.move_to_initialised_locked(&mut inner, DropReason::Failure);
                }
            }
            _ => {}
        }
    }

    /// Enters Probing: pauses transmit and tells the hardware to accept
    /// foreign-BSSID beacons.
    pub(crate) fn enter_probing_locked(&self, inner: &mut LinkInner) -> Result<()> {
        debug_assert_ne!(inner.state, LinkState::Probing);
        self.pause_data_frames_locked(inner);
        let active = inner.active.upgrade();
        if let Err(e) = self.driver_set_state(LinkState::Probing, active.as_ref()) {
            // The probe never started; undo the pause.
            if inner.state.is_connected() {
                self.resume_data_frames_locked(inner);
            } else {
                inner.data_paused = false;
            }
            return Err(e);
        }
        inner.pre_probe_state = inner.state;
        inner.state = LinkState::Probing;
        Ok(())
    }

    /// Leaves Probing. A transition latched during the probe wins over the
    /// scan's own exit; otherwise the sweep's requested exit applies.
    pub(crate) fn exit_probing_locked(&self, inner: &mut LinkInner, next: ScanExit) -> Result<()> {
        debug_assert_eq!(inner.state, LinkState::Probing);
        inner.state = inner.pre_probe_state;

        if let Some(latched) = inner.probe_next.take() {
            return match latched {
                ProbeNext::Initialised(reason) => {
                    self.move_to_initialised_locked(inner, reason);
                    Ok(())
                }
                ProbeNext::Authenticating(bss) => self.begin_authenticating_locked(inner, bss),
                ProbeNext::Associating(bss) => self.begin_associating_locked(inner, bss),
            };
        }
        match next {
            ScanExit::Restore => {
                let active = inner.active.upgrade();
                if let Err(e) = self.driver_set_state(inner.state, active.as_ref()) {
                    warn!("driver refused probe restore: {}", e);
                    self.move_to_initialised_locked(inner, DropReason::Failure);
                    return Err(e);
                }
                if inner.state.is_connected() {
                    self.resume_data_frames_locked(inner);
                }
                Ok(())
            }
            ScanExit::Initialised => {
                self.move_to_initialised_locked(inner, DropReason::Failure);
                Ok(())
            }
            ScanExit::Join(bss) => self.begin_authenticating_locked(inner, bss),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::error::DriverStatus;
    use crate::frame::{MGMT_ASSOC_REQ, REASON_DISASSOC_LEAVING};
    use crate::test_utils::{
        assoc_response_frame, auth_response_frame, deauth_frame, disassoc_frame, eapol_frame,
        harness, join_network, ProbeResponseBuilder, AP_BSSID, STATION_MAC,
    };

    fn join_encrypted(h: &crate::test_utils::Harness) {
        join_network(h, b"secure", b"secret", true);
        h.link.process_received_frame(&eapol_frame(1), -40);
        h.link.process_received_frame(&eapol_frame(2), -40);
        assert_eq!(h.link.state(), LinkState::Encrypted);
    }

    #[test]
    fn deauth_rebuilds_state_and_reauthenticates() {
        let h = harness();
        join_encrypted(&h);
        let original = h.link.active_bss().unwrap();
        h.driver.clear();

        h.link.process_received_frame(&deauth_frame(7), -40);

        assert_eq!(h.link.state(), LinkState::Authenticating);
        let fresh = h.link.active_bss().unwrap();
        assert!(!Arc::ptr_eq(&original, &fresh));
        assert_eq!(fresh.bssid(), original.bssid());
        // The reconnect copy replaced the original in the list; only this
        // test still holds the original.
        assert_eq!(Arc::strong_count(&original), 1);
        assert!(original.join().keys.iter().all(|k| k.is_none()));
        {
            let join = fresh.join();
            assert!(join.keys.iter().all(|k| k.is_none()));
            assert!(!join.handshake_active);
            assert_eq!(join.passphrase, b"secret");
        }
        // A fresh authentication request is on the air and the timer armed.
        assert_eq!(h.driver.mgmt_frames(MGMT_AUTH).len(), 1);
        assert_ne!(h.link.lock_inner().timer_generation, 0);
        assert!(!h.network.last_status().unwrap().up);
        assert!(h.link.lock_inner().data_paused);
    }

    #[test]
    fn disassoc_reassociates_against_the_same_entry() {
        let h = harness();
        join_encrypted(&h);
        let entry = h.link.active_bss().unwrap();
        h.driver.clear();

        h.link.process_received_frame(&disassoc_frame(8), -40);

        assert_eq!(h.link.state(), LinkState::Associating);
        assert!(Arc::ptr_eq(&entry, &h.link.active_bss().unwrap()));
        // Keys are void until a new handshake completes.
        {
            let join = entry.join();
            assert!(join.keys.iter().all(|k| k.is_none()));
            assert!(!join.encrypt_data);
        }
        assert_eq!(h.driver.mgmt_frames(MGMT_ASSOC_REQ).len(), 1);
        assert!(!h.network.last_status().unwrap().up);
    }

    #[test]
    fn active_bss_drift_drops_to_initialised_before_update() {
        let h = harness();
        join_network(&h, b"open", b"", false);
        assert!(h.network.last_status().unwrap().up);

        // The AP's next beacon advertises a different rate count.
        let beacon = ProbeResponseBuilder::new(b"open")
            .rates(vec![crate::ie::SupportedRate::new(true, 2)])
            .as_beacon()
            .build();
        h.link.process_received_frame(&beacon, -40);

        assert_eq!(h.link.state(), LinkState::Initialised);
        assert!(h.link.active_bss().is_none());
        assert!(!h.network.last_status().unwrap().up);
        // The entry stays cached, with the updated parameters.
        let inner = h.link.lock_inner();
        let entry = inner.bss_list.lookup(&AP_BSSID).unwrap();
        assert_eq!(entry.params().rates.len(), 1);
    }

    #[test]
    fn auth_refusal_drops_to_initialised() {
        let h = harness();
        h.link.process_received_frame(&ProbeResponseBuilder::new(b"net").build(), -40);
        h.link
            .scan_worker(crate::scan::ScanRequest::broadcast_join(b"net", b"").unwrap());
        assert_eq!(h.link.state(), LinkState::Authenticating);

        h.link.process_received_frame(&auth_response_frame(17), -40);
        assert_eq!(h.link.state(), LinkState::Initialised);
        assert!(h.link.active_bss().is_none());
    }

    #[test]
    fn auth_reply_from_wrong_bssid_is_ignored() {
        let h = harness();
        h.link.process_received_frame(&ProbeResponseBuilder::new(b"net").build(), -40);
        h.link
            .scan_worker(crate::scan::ScanRequest::broadcast_join(b"net", b"").unwrap());

        let mut body = Vec::new();
        AuthBody { algorithm: AUTH_ALGORITHM_OPEN, txn_seq: 2, status: 0 }.write(&mut body);
        let stranger = [0xEE; 6];
        let reply = frame::encode_management(MGMT_AUTH, &STATION_MAC, &stranger, &stranger, 9, &body);
        h.link.process_received_frame(&reply, -40);

        // Still waiting on the real AP.
        assert_eq!(h.link.state(), LinkState::Authenticating);
    }

    #[test]
    fn assoc_refusal_drops_to_initialised() {
        let h = harness();
        h.link.process_received_frame(&ProbeResponseBuilder::new(b"net").build(), -40);
        h.link
            .scan_worker(crate::scan::ScanRequest::broadcast_join(b"net", b"").unwrap());
        h.link.process_received_frame(&auth_response_frame(0), -40);
        assert_eq!(h.link.state(), LinkState::Associating);

        h.link.process_received_frame(&assoc_response_frame(1, 0), -40);
        assert_eq!(h.link.state(), LinkState::Initialised);
    }

    #[test]
    fn stale_timer_fire_aborts_silently() {
        let h = harness();
        h.link.process_received_frame(&ProbeResponseBuilder::new(b"net").build(), -40);
        h.link
            .scan_worker(crate::scan::ScanRequest::broadcast_join(b"net", b"").unwrap());
        assert_eq!(h.link.state(), LinkState::Authenticating);

        let armed = h.link.lock_inner().timer_generation;
        assert_ne!(armed, 0);

        // A fire that lost the race to a cancel or re-arm does nothing.
        h.link.on_state_timeout(armed + 40);
        assert_eq!(h.link.state(), LinkState::Authenticating);

        // The genuine fire times the attempt out.
        h.link.on_state_timeout(armed);
        assert_eq!(h.link.state(), LinkState::Initialised);
    }

    #[test]
    fn handshake_timeout_drops_the_attempt() {
        let h = harness();
        join_network(&h, b"secure", b"secret", true);
        assert_eq!(h.link.state(), LinkState::Associated);
        let armed = h.link.lock_inner().timer_generation;
        h.link.on_state_timeout(armed);
        assert_eq!(h.link.state(), LinkState::Initialised);
        // Session torn down on the way out.
        assert_eq!(h.cipher.teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn auth_emit_failure_lands_in_initialised() {
        let h = harness();
        h.link.process_received_frame(&ProbeResponseBuilder::new(b"net").build(), -40);
        let entry = h.link.lock_inner().bss_list.lookup(&AP_BSSID).cloned().unwrap();

        h.driver.fail_send.store(true, Ordering::SeqCst);
        let mut inner = h.link.lock_inner();
        let outcome = h.link.begin_authenticating_locked(&mut inner, entry);
        assert_eq!(outcome, Err(Error::Driver(DriverStatus::Failed)));
        assert_eq!(inner.state, LinkState::Initialised);
        assert!(inner.active.upgrade().is_none());
    }

    #[test]
    fn transition_requested_while_probing_is_latched() {
        let h = harness();
        h.link.process_received_frame(&ProbeResponseBuilder::new(b"net").build(), -40);
        let entry = h.link.lock_inner().bss_list.lookup(&AP_BSSID).cloned().unwrap();

        let mut inner = h.link.lock_inner();
        h.link.enter_probing_locked(&mut inner).unwrap();
        assert_eq!(inner.state, LinkState::Probing);

        // While Probing, a transition request only latches.
        h.link.begin_authenticating_locked(&mut inner, entry.clone()).unwrap();
        assert_eq!(inner.state, LinkState::Probing);
        assert!(inner.probe_next.is_some());

        // The latched request wins over the sweep's own exit.
        h.link.exit_probing_locked(&mut inner, ScanExit::Initialised).unwrap();
        assert_eq!(inner.state, LinkState::Authenticating);
        assert!(inner.active.is(&entry));
    }

    #[test]
    fn explicit_leave_notifies_and_forgets_the_bss() {
        let h = harness();
        join_network(&h, b"open", b"", false);
        let entry = h.link.active_bss().unwrap();
        h.driver.clear();

        h.link.leave().unwrap();

        assert_eq!(h.link.state(), LinkState::Initialised);
        assert!(h.link.active_bss().is_none());
        // Gone from the list as well: only this test still holds it.
        assert_eq!(Arc::strong_count(&entry), 1);
        assert!(h.link.lock_inner().bss_list.lookup(&AP_BSSID).is_none());

        let frames = h.driver.mgmt_frames(MGMT_DISASSOC);
        assert_eq!(frames.len(), 1);
        let (_, body) = frame::parse_frame(&frames[0]).unwrap();
        assert_eq!(frame::parse_reason(body).unwrap(), REASON_DISASSOC_LEAVING);
        assert!(!h.network.last_status().unwrap().up);
    }
}
