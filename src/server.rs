//! Server side of the leasing protocol.
//!
//! A [`Server`] answers discovers with offers, turns requests into leases,
//! and forgets leases on release or expiry. It keeps one address database
//! per pool class (48/64 bit, unicast/multicast) and never trusts a
//! station's identity: every reservation and lease is keyed by a keyed
//! hash over the station's token, station id, and source address, so only
//! the station that was offered a block can commit or release it.

use std::hash::Hasher;

use rand::{rngs::StdRng, Rng, SeedableRng};
use siphasher::sip::SipHasher24;
use tracing::{debug, info};

use crate::addrset::{
    AddrInterval, AddrWidth, IntervalForm, AUTOASSIGN_UNICAST, PROBE_SOURCE_RANGE,
};
use crate::config::ServerConfig;
use crate::database::{EntryId, SetDatabase, SpanState};
use crate::packet::{MessageType, Packet, StatusCode, PROTOCOL_GROUP};
use crate::Action;

/// The four pool classes a request can fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolClass {
    Unicast,
    Multicast,
    Unicast64,
    Multicast64,
}

impl PoolClass {
    fn of(set: &AddrInterval) -> Self {
        match (set.is_multicast(), set.width == AddrWidth::Bits64) {
            (false, false) => PoolClass::Unicast,
            (true, false) => PoolClass::Multicast,
            (false, true) => PoolClass::Unicast64,
            (true, true) => PoolClass::Multicast64,
        }
    }
}

/// Per-class grant policy.
#[derive(Debug, Clone, Copy)]
struct PoolSpec {
    max: u64,
    lifetime: u16,
    /// Whether offers from this pool also carry a unicast source address
    /// for the station to use.
    send_client_addr: bool,
}

/// Address-leasing server.
pub struct Server {
    config: ServerConfig,
    unicast: Option<SetDatabase>,
    multicast: Option<SetDatabase>,
    unicast_64: Option<SetDatabase>,
    multicast_64: Option<SetDatabase>,
    key: (u64, u64),
}

fn build_db(pool: &AddrInterval) -> Option<SetDatabase> {
    if pool.size() == 0 {
        None
    } else {
        Some(SetDatabase::new(*pool))
    }
}

fn in_range(addr: u64, range: &AddrInterval) -> bool {
    let span = AddrInterval::from_count(addr, 1);
    AddrInterval::intersection(&span, range).is_some()
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let mut rng = StdRng::from_entropy();
        Self {
            unicast: build_db(&config.unicast_set),
            multicast: build_db(&config.multicast_set),
            unicast_64: build_db(&config.unicast_64_set),
            multicast_64: build_db(&config.multicast_64_set),
            key: (rng.gen(), rng.gen()),
            config,
        }
    }

    /// Installs the server address and joins the protocol group.
    pub fn start(&mut self) -> Vec<Action> {
        info!(
            addr = format_args!("{:012x}", self.config.src_addr),
            "server starting"
        );
        vec![Action::AddAddress(self.config.src_addr), Action::JoinGroup]
    }

    /// Decodes and validates a received frame, then answers it.
    /// Malformed or illegal frames are dropped.
    pub fn handle_frame(&mut self, data: &[u8]) -> Vec<Action> {
        match Packet::parse(data).and_then(|pkt| pkt.validate().map(|()| pkt)) {
            Ok(pkt) => self.handle_packet(&pkt),
            Err(err) => {
                debug!(%err, "dropping frame");
                Vec::new()
            }
        }
    }

    pub fn handle_packet(&mut self, pkt: &Packet) -> Vec<Action> {
        let mut actions = Vec::new();
        if pkt.dest == PROTOCOL_GROUP {
            match pkt.msg_type {
                MessageType::Discover => self.process_claim(pkt, &mut actions),
                // Stations announcing a self-assigned block are lured
                // into taking a served lease instead.
                MessageType::Announce if self.config.autoassign_objection => {
                    self.process_claim(pkt, &mut actions)
                }
                _ => {}
            }
        } else if pkt.dest == self.config.src_addr {
            match pkt.msg_type {
                MessageType::Request => self.process_request(pkt, &mut actions),
                MessageType::Release => self.process_release(pkt, &mut actions),
                _ => {}
            }
        }
        actions
    }

    /// Lets expired reservations and leases lapse.
    pub fn poll(&mut self) {
        for db in [
            &mut self.unicast,
            &mut self.multicast,
            &mut self.unicast_64,
            &mut self.multicast_64,
        ]
        .into_iter()
        .flatten()
        {
            db.poll();
        }
    }

    /// Seconds until the next reservation or lease expires.
    pub fn next_deadline(&mut self) -> Option<f64> {
        [
            &mut self.unicast,
            &mut self.multicast,
            &mut self.unicast_64,
            &mut self.multicast_64,
        ]
        .into_iter()
        .flatten()
        .filter_map(SetDatabase::next_deadline)
        .min_by(f64::total_cmp)
    }

    /// Pretends `secs` seconds have passed.
    pub fn advance(&mut self, secs: f64) {
        for db in [
            &mut self.unicast,
            &mut self.multicast,
            &mut self.unicast_64,
            &mut self.multicast_64,
        ]
        .into_iter()
        .flatten()
        {
            db.advance(secs);
        }
    }

    // ---- pool plumbing ----

    fn db_mut(&mut self, class: PoolClass) -> Option<&mut SetDatabase> {
        match class {
            PoolClass::Unicast => self.unicast.as_mut(),
            PoolClass::Multicast => self.multicast.as_mut(),
            PoolClass::Unicast64 => self.unicast_64.as_mut(),
            PoolClass::Multicast64 => self.multicast_64.as_mut(),
        }
    }

    /// Grant policy for a class, or `None` when the class is not served.
    fn spec(&self, class: PoolClass) -> Option<PoolSpec> {
        let (pool, max, lifetime) = match class {
            PoolClass::Unicast => (
                &self.unicast,
                self.config.max_unicast,
                self.config.unicast_lifetime,
            ),
            PoolClass::Multicast => (
                &self.multicast,
                self.config.max_multicast,
                self.config.multicast_lifetime,
            ),
            PoolClass::Unicast64 => (
                &self.unicast_64,
                self.config.max_unicast_64,
                self.config.unicast_64_lifetime,
            ),
            PoolClass::Multicast64 => (
                &self.multicast_64,
                self.config.max_multicast_64,
                self.config.multicast_64_lifetime,
            ),
        };
        if pool.is_none() || max == 0 {
            return None;
        }
        Some(PoolSpec {
            max,
            lifetime,
            // A 48-bit unicast grant already contains usable source
            // addresses; every other class needs one on the side.
            send_client_addr: class != PoolClass::Unicast,
        })
    }

    fn default_class(&self) -> PoolClass {
        match (self.config.default_multicast, self.config.default_64) {
            (false, false) => PoolClass::Unicast,
            (true, false) => PoolClass::Multicast,
            (false, true) => PoolClass::Unicast64,
            (true, true) => PoolClass::Multicast64,
        }
    }

    /// Keyed hash binding a grant to the station that asked for it.
    /// Reservations leave out the source address, since a discovering
    /// station probes from a throwaway one.
    fn security_tag(&self, token: u16, station_id: Option<&[u8]>, src_addr: u64) -> u64 {
        let mut hasher = SipHasher24::new_with_keys(self.key.0, self.key.1);
        if src_addr != 0 {
            hasher.write_u64(src_addr);
        }
        hasher.write_u16(token);
        if let Some(id) = station_id {
            hasher.write(id);
        }
        hasher.finish()
    }

    // ---- claims ----

    fn process_claim(&mut self, pkt: &Packet, actions: &mut Vec<Action>) {
        let tag = self.security_tag(pkt.token, pkt.station_id(), 0);
        let (class, wanted) = match pkt.addr_set() {
            Some(set) => (PoolClass::of(set), set.size()),
            None => (self.default_class(), self.config.max_default),
        };
        let Some(spec) = self.spec(class) else {
            debug!(?class, "claim for an unserved class");
            return;
        };
        let wanted = wanted.min(spec.max);
        let reserve_lifetime = self.config.reserve_lifetime;
        let (offer_entry, offered) = {
            let Some(db) = self.db_mut(class) else { return };
            let Some(entry) = db.reserve(wanted, tag, reserve_lifetime) else {
                debug!(?class, wanted, "no free block to offer");
                return;
            };
            (entry, db.entry_span(entry))
        };
        let mut client_addr = None;
        if spec.send_client_addr && in_range(pkt.src, &PROBE_SOURCE_RANGE) {
            let reserved = self.unicast.as_mut().and_then(|db| {
                db.reserve(1, tag, reserve_lifetime)
                    .map(|e| db.entry_span(e).first_addr())
            });
            match reserved {
                Some(addr) => client_addr = Some(addr),
                None => {
                    // Without a source address the offer is useless.
                    if let Some(db) = self.db_mut(class) {
                        db.release(offer_entry);
                    }
                    return;
                }
            }
        }
        debug!(set = %offered, "offering");
        self.send_offer(pkt, offered, spec.lifetime, client_addr, actions);
    }

    fn send_offer(
        &self,
        pkt: &Packet,
        offered: AddrInterval,
        lifetime: u16,
        client_addr: Option<u64>,
        actions: &mut Vec<Action>,
    ) {
        let mut offer = Packet::new(
            MessageType::Offer,
            pkt.src,
            self.config.src_addr,
            pkt.token,
            StatusCode::NoCode,
        );
        offer.add_lifetime(lifetime);
        let mut span = offered;
        if span.size() > 0xffff {
            span.align_to_mask(IntervalForm::Mask);
        }
        offer.add_addr_set(span);
        if let Some(id) = pkt.station_id() {
            offer.add_station_id(id);
        }
        if let Some(net) = &self.config.network_id {
            offer.add_network_id(net.as_bytes());
        }
        if let Some(addr) = client_addr {
            offer.add_client_addr(addr, AddrWidth::Bits48);
        }
        if let Some(vendor) = &self.config.vendor {
            offer.add_vendor(vendor.as_bytes());
        }
        actions.push(Action::Send(offer));
    }

    // ---- requests ----

    fn process_request(&mut self, pkt: &Packet, actions: &mut Vec<Action>) {
        let Some(requested) = pkt.addr_set().copied() else {
            return;
        };
        let reserved_tag = self.security_tag(pkt.token, pkt.station_id(), 0);
        let assigned_tag = self.security_tag(pkt.token, pkt.station_id(), pkt.src);
        let class = PoolClass::of(&requested);
        let spec = self.spec(class);
        // Probe addresses are throwaway and self-assignable unicast space
        // is not ours to lease against.
        if spec.is_none()
            || in_range(pkt.src, &AUTOASSIGN_UNICAST)
            || in_range(pkt.src, &PROBE_SOURCE_RANGE)
        {
            self.send_ack(pkt, StatusCode::FailOther, None, 0, actions);
            return;
        }
        let Some(spec) = spec else { return };

        // A source address inside the unicast pool must be one we handed
        // out to this very station.
        let mut pending_src: Option<EntryId> = None;
        let src_span = AddrInterval::from_count(pkt.src, 1);
        if in_range(pkt.src, &self.config.unicast_set) {
            let Some(db) = self.unicast.as_mut() else {
                return;
            };
            let status = db.status(&src_span);
            let owned = (status.state == SpanState::Reserved && status.tag == reserved_tag)
                || (status.state == SpanState::Assigned && status.tag == assigned_tag);
            if !owned {
                self.send_ack(pkt, StatusCode::FailOther, None, 0, actions);
                return;
            }
            // Unless the source address is part of the requested block it
            // needs its own lease.
            if AddrInterval::intersection(&src_span, &requested).is_none() {
                pending_src = status.entry;
            }
        }

        let mut requested = requested;
        let mut ack_status = StatusCode::AssignOk;
        if requested.size() > spec.max {
            if !self.config.alternate_set {
                self.send_ack(pkt, StatusCode::FailTooLarge, None, 0, actions);
                return;
            }
            requested.set_size(spec.max);
            ack_status = StatusCode::AlternateSet;
        }

        let status = {
            let Some(db) = self.db_mut(class) else { return };
            db.status(&requested)
        };
        let renewal_ok = pkt.renewal() && self.config.accept_renewal;
        let grantable = status.state == SpanState::Free
            || (status.state == SpanState::Reserved && status.tag == reserved_tag)
            || (status.state == SpanState::Assigned && status.tag == assigned_tag && renewal_ok);

        if grantable {
            let Some(container) = status.entry else { return };
            self.commit_src(pending_src, &src_span, assigned_tag, spec.lifetime);
            if let Some(db) = self.db_mut(class) {
                db.commit_at(container, &requested, assigned_tag, spec.lifetime);
            }
            info!(set = %requested, "lease granted");
            self.send_ack(pkt, ack_status, Some(requested), spec.lifetime, actions);
        } else if status.state == SpanState::Assigned && status.tag == assigned_tag {
            // A retransmitted request is answered without refreshing the
            // lease.
            self.send_ack(pkt, ack_status, Some(requested), status.lifetime, actions);
        } else if self.config.alternate_set {
            let granted = {
                let Some(db) = self.db_mut(class) else { return };
                db.commit(requested.size(), assigned_tag, spec.lifetime)
                    .map(|e| db.entry_span(e))
            };
            match granted {
                Some(span) => {
                    self.commit_src(pending_src, &src_span, assigned_tag, spec.lifetime);
                    info!(set = %span, "alternate lease granted");
                    self.send_ack(
                        pkt,
                        StatusCode::AlternateSet,
                        Some(span),
                        spec.lifetime,
                        actions,
                    );
                }
                None => self.send_ack(pkt, StatusCode::FailConflict, None, 0, actions),
            }
        } else {
            self.send_ack(pkt, StatusCode::FailConflict, None, 0, actions);
        }
    }

    /// Turns the reservation holding a station's source address into a
    /// lease alongside the main grant.
    fn commit_src(
        &mut self,
        pending: Option<EntryId>,
        src_span: &AddrInterval,
        tag: u64,
        lifetime: u16,
    ) {
        if let (Some(entry), Some(db)) = (pending, self.unicast.as_mut()) {
            db.commit_at(entry, src_span, tag, lifetime);
        }
    }

    fn send_ack(
        &self,
        pkt: &Packet,
        status: StatusCode,
        set: Option<AddrInterval>,
        lifetime: u16,
        actions: &mut Vec<Action>,
    ) {
        let mut ack = Packet::new(
            MessageType::Ack,
            pkt.src,
            self.config.src_addr,
            pkt.token,
            status,
        );
        if let Some(id) = pkt.station_id() {
            ack.add_station_id(id);
        }
        if let Some(mut span) = set {
            if span.size() > 0xffff {
                span.align_to_mask(IntervalForm::Mask);
            }
            ack.add_addr_set(span);
            ack.add_lifetime(lifetime);
        }
        actions.push(Action::Send(ack));
    }

    // ---- releases ----

    fn process_release(&mut self, pkt: &Packet, _actions: &mut Vec<Action>) {
        let Some(released) = pkt.addr_set().copied() else {
            return;
        };
        let assigned_tag = self.security_tag(pkt.token, pkt.station_id(), pkt.src);
        let class = PoolClass::of(&released);
        if self.spec(class).is_none() {
            return;
        }
        let freed = {
            let Some(db) = self.db_mut(class) else { return };
            let status = db.status(&released);
            if status.state == SpanState::Assigned
                && status.tag == assigned_tag
                && status.identical
            {
                if let Some(entry) = status.entry {
                    db.release(entry);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if !freed {
            debug!(set = %released, "ignoring release of a foreign lease");
            return;
        }
        info!(set = %released, "lease released");
        // The source address lease, when separate, goes with it.
        if let Some(db) = self.unicast.as_mut() {
            let src_span = AddrInterval::from_count(pkt.src, 1);
            let status = db.status(&src_span);
            if status.state == SpanState::Assigned
                && status.tag == assigned_tag
                && status.identical
            {
                if let Some(entry) = status.entry {
                    db.release(entry);
                }
            }
        }
    }
}
