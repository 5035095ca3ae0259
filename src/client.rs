//! Client side of the leasing protocol.
//!
//! A [`Client`] negotiates a block of link-layer addresses with a server:
//! it probes the network with discover frames, requests the best offer it
//! collected, and holds the resulting lease while it remains bound. When
//! no server answers and the claim lies in a self-assignable range, the
//! client picks a block itself and defends it against later claimants.
//!
//! The state machine is purely reactive. Feed it received frames with
//! [`Client::handle_frame`] and elapsed time with [`Client::poll`]; both
//! return the [`Action`]s the caller must carry out (frames to transmit,
//! interface addresses to install or remove, group membership changes).

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::addrset::{
    AddrInterval, IntervalForm, AUTOASSIGN_MULTICAST, AUTOASSIGN_MULTICAST_64, AUTOASSIGN_UNICAST,
    AUTOASSIGN_UNICAST_64, MAX_AUTOASSIGN_UNICAST, PROBE_SOURCE_RANGE,
};
use crate::config::ClientConfig;
use crate::database::SetDatabase;
use crate::packet::{MessageType, Packet, StatusCode, PROTOCOL_GROUP};
use crate::timer::TimerQueue;
use crate::Action;

/// How many discover frames are sent before giving up on servers.
const DISCOVER_ATTEMPTS: u32 = 3;
/// How many request frames are sent before returning to discovery.
const REQUEST_ATTEMPTS: u32 = 3;
/// Lifetime of a self-assigned block, in seconds.
const SELF_ASSIGNMENT_LIFETIME: f64 = 1800.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientTimer {
    /// Discover response collection window.
    Discovery,
    /// Ack wait after a request.
    Request,
    /// Periodic announce while defending.
    Announcement,
    /// Lifetime of a self-assigned block.
    SelfLease,
    /// Lifetime of a server-granted lease.
    BoundLease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Discovery,
    Requesting,
    Bound,
    Defending,
}

/// Address-leasing client state machine.
pub struct Client {
    config: ClientConfig,
    db: SetDatabase,
    timers: TimerQueue<ClientTimer>,
    rng: StdRng,
    state: State,
    token: u16,
    group_joined: bool,
    /// Whether the source address was configured rather than leased.
    preassigned: bool,
    src_addr: u64,
    server_addr: u64,
    assigned_set: Option<AddrInterval>,
    // Discovery bookkeeping.
    disc_count: u32,
    disc_src: u64,
    discovery_set: Option<AddrInterval>,
    offer: Option<Packet>,
    change_discovery: bool,
    // Requesting bookkeeping.
    req_count: u32,
    req_server: u64,
    req_src: u64,
    request_pkt: Option<Packet>,
}

/// Clamps `set` to at most `max` addresses, switching to mask form when
/// the result is too large for a count parameter.
fn adjust_set(set: &mut AddrInterval, max: u64) {
    let size = set.size().min(max);
    set.set_size(size);
    if size > 0xffff {
        set.align_to_mask(IntervalForm::Mask);
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let mut rng = StdRng::from_entropy();
        let token = rng.gen();
        let db = SetDatabase::new(config.claim_set);
        Self {
            config,
            db,
            timers: TimerQueue::new(),
            rng,
            state: State::Idle,
            token,
            group_joined: false,
            preassigned: false,
            src_addr: 0,
            server_addr: 0,
            assigned_set: None,
            disc_count: 0,
            disc_src: 0,
            discovery_set: None,
            offer: None,
            change_discovery: false,
            req_count: 0,
            req_server: 0,
            req_src: 0,
            request_pkt: None,
        }
    }

    /// The set currently held, either server-granted or self-assigned.
    pub fn assigned_set(&self) -> Option<AddrInterval> {
        self.assigned_set
    }

    pub fn src_addr(&self) -> u64 {
        self.src_addr
    }

    pub fn server_addr(&self) -> u64 {
        self.server_addr
    }

    pub fn token(&self) -> u16 {
        self.token
    }

    pub fn is_bound(&self) -> bool {
        self.state == State::Bound
    }

    pub fn is_defending(&self) -> bool {
        self.state == State::Defending
    }

    /// Begins negotiation. With a preassigned address and a known server
    /// the discovery phase is skipped entirely.
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.src_addr = self.config.preassigned_addr.unwrap_or(0);
        self.preassigned = self.src_addr != 0;
        if self.preassigned {
            actions.push(Action::AddAddress(self.src_addr));
        }
        self.server_addr = self.config.known_server.unwrap_or(0);
        if self.server_addr != 0 && self.preassigned {
            let claim = self.config.claim_set;
            let server = self.server_addr;
            let src = self.src_addr;
            self.start_requesting(server, src, claim, false, &mut actions);
        } else {
            self.start_discovery(&mut actions);
        }
        actions
    }

    /// Terminates the client, releasing a held lease first.
    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == State::Bound {
            self.send_release(true, &mut actions);
        }
        self.clean_current(&mut actions);
        self.state = State::Idle;
        actions
    }

    /// Decodes and validates a received frame, then runs it through the
    /// state machine. Malformed or illegal frames are dropped.
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
        match self.state {
            State::Discovery => self.discovery_handle(pkt),
            State::Requesting => self.requesting_handle(pkt, &mut actions),
            State::Defending => self.defending_handle(pkt, &mut actions),
            State::Bound | State::Idle => {}
        }
        actions
    }

    /// Fires expired timers and lets recorded foreign claims lapse.
    pub fn poll(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.db.poll();
        for timer in self.timers.pop_expired() {
            match timer {
                ClientTimer::Discovery => self.discovery_timeout(&mut actions),
                ClientTimer::Request => self.request_timeout(&mut actions),
                ClientTimer::Announcement => self.send_announce(&mut actions),
                ClientTimer::SelfLease => {
                    info!("self-assigned lease expired");
                    self.restart(&mut actions);
                }
                ClientTimer::BoundLease => self.lease_timeout(&mut actions),
            }
        }
        actions
    }

    /// Seconds until the next timer fires, for the caller's event loop.
    pub fn next_deadline(&mut self) -> Option<f64> {
        match (self.timers.next_deadline(), self.db.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Pretends `secs` seconds have passed.
    pub fn advance(&mut self, secs: f64) {
        self.timers.advance(secs);
        self.db.advance(secs);
    }

    // ---- shared helpers ----

    fn join_group(&mut self, actions: &mut Vec<Action>) {
        if !self.group_joined {
            actions.push(Action::JoinGroup);
            self.group_joined = true;
        }
    }

    fn leave_group(&mut self, actions: &mut Vec<Action>) {
        if self.group_joined {
            actions.push(Action::LeaveGroup);
            self.group_joined = false;
        }
    }

    /// A frame without a station id is acceptable to everyone; a frame
    /// carrying one is only for the station it names.
    fn station_id_matches(&self, received: Option<&[u8]>) -> bool {
        match received {
            None => true,
            Some(id) => self
                .config
                .station_id
                .as_ref()
                .is_some_and(|own| own.as_bytes() == id),
        }
    }

    /// Whether an offered or acked set satisfies the configured claim:
    /// enough addresses, same multicast-ness, same width.
    fn valid_set(&self, pkt: &Packet) -> bool {
        let Some(set) = pkt.addr_set() else {
            return false;
        };
        let claim = self.config.claim_set;
        set.size() >= self.config.min_claim
            && set.is_multicast() == claim.is_multicast()
            && set.width == claim.width
    }

    /// A usable offer additionally has to tell a multicast claimant which
    /// source address to use, unless one is preassigned.
    fn valid_offer(&self, pkt: &Packet) -> bool {
        self.valid_set(pkt)
            && (!self.config.claim_set.is_multicast()
                || self.preassigned
                || pkt.client_addr().is_some())
    }

    fn clean_current(&mut self, actions: &mut Vec<Action>) {
        match self.state {
            State::Discovery => self.clean_discovery(actions),
            State::Requesting => self.clean_requesting(actions),
            State::Defending => self.clean_defending(actions),
            State::Bound => {
                self.timers.cancel(ClientTimer::BoundLease);
            }
            State::Idle => {}
        }
    }

    /// Drops all negotiation state and begins again with a fresh token.
    /// Recorded foreign claims are kept.
    fn restart(&mut self, actions: &mut Vec<Action>) {
        debug!("restarting negotiation");
        self.clean_current(actions);
        if !self.preassigned && self.src_addr != 0 {
            actions.push(Action::RemoveAddress(self.src_addr));
            self.src_addr = 0;
        }
        self.assigned_set = None;
        self.token = self.token.wrapping_add(1);
        self.server_addr = self.config.known_server.unwrap_or(0);
        if self.server_addr != 0 && self.preassigned {
            let claim = self.config.claim_set;
            let server = self.server_addr;
            let src = self.src_addr;
            self.start_requesting(server, src, claim, false, actions);
        } else {
            self.server_addr = 0;
            self.start_discovery(actions);
        }
    }

    // ---- discovery ----

    fn start_discovery(&mut self, actions: &mut Vec<Action>) {
        let min = self.config.min_claim;
        let max = self.config.max_claim;
        let random = self.config.random_assign;
        let mut set = self.db.best_free(min, max, random);
        if let Some(ref mut span) = set {
            if span.size() > 0xffff {
                span.align_to_mask(IntervalForm::Mask);
            }
        }
        debug!(set = ?set.map(|s| s.to_string()), "discovery started");
        self.state = State::Discovery;
        self.disc_count = DISCOVER_ATTEMPTS;
        self.discovery_set = set;
        self.offer = None;
        self.change_discovery = false;
        self.join_group(actions);
        self.send_discover(actions);
    }

    fn clean_discovery(&mut self, actions: &mut Vec<Action>) {
        if self.disc_src != 0 && !self.preassigned {
            actions.push(Action::RemoveAddress(self.disc_src));
        }
        self.disc_src = 0;
        self.offer = None;
        self.discovery_set = None;
        self.change_discovery = false;
        self.timers.cancel(ClientTimer::Discovery);
    }

    /// Source address for probe frames. A preassigned address is used
    /// directly; otherwise a fresh random probe address is installed for
    /// every discover.
    fn discovery_src(&mut self, actions: &mut Vec<Action>) -> u64 {
        if self.preassigned {
            self.disc_src = self.src_addr;
            return self.disc_src;
        }
        if self.disc_src != 0 {
            actions.push(Action::RemoveAddress(self.disc_src));
        }
        let probe = AddrInterval::random_within(&PROBE_SOURCE_RANGE, 1, &mut self.rng);
        self.disc_src = probe.first_addr();
        actions.push(Action::AddAddress(self.disc_src));
        self.disc_src
    }

    fn send_discover(&mut self, actions: &mut Vec<Action>) {
        let src = self.discovery_src(actions);
        let mut pkt = Packet::new(
            MessageType::Discover,
            PROTOCOL_GROUP,
            src,
            self.token,
            StatusCode::NoCode,
        );
        if let Some(set) = self.discovery_set {
            if set.size() > 0 {
                pkt.add_addr_set(set);
            }
        }
        if let Some(id) = &self.config.station_id {
            pkt.add_station_id(id.as_bytes());
        }
        if let Some(vendor) = &self.config.vendor {
            pkt.add_vendor(vendor.as_bytes());
        }
        actions.push(Action::Send(pkt));
        let timeout = 0.5 + self.rng.gen_range(0.0..0.1);
        self.timers.schedule(ClientTimer::Discovery, timeout);
    }

    fn discovery_handle(&mut self, pkt: &Packet) {
        if pkt.dest == PROTOCOL_GROUP {
            if pkt.msg_type != MessageType::Announce {
                return;
            }
        } else if pkt.msg_type != MessageType::Announce
            && (pkt.dest != self.disc_src || !self.station_id_matches(pkt.station_id()))
        {
            return;
        }
        match pkt.msg_type {
            MessageType::Offer if pkt.token == self.token => self.store_offer(pkt),
            MessageType::Announce => {
                let set = pkt.addr_set().copied();
                self.record_foreign_claim(set, pkt.lifetime());
            }
            MessageType::Defend => {
                let set = pkt.conflict_set().copied();
                self.record_foreign_claim(set, pkt.lifetime());
            }
            _ => {}
        }
    }

    /// Records someone else's claim in the local database. When it
    /// overlaps the set being probed, the probe is rebased on the next
    /// timeout.
    fn record_foreign_claim(&mut self, set: Option<AddrInterval>, lifetime: Option<u16>) {
        let Some(set) = set else { return };
        self.db.exclude(&set, lifetime.unwrap_or(0));
        if let Some(probe) = self.discovery_set {
            if AddrInterval::intersection(&set, &probe).is_some() {
                self.change_discovery = true;
            }
        }
    }

    /// Keeps the best offer seen so far: the largest usable set wins,
    /// ties go to the longer lifetime.
    fn store_offer(&mut self, pkt: &Packet) {
        let Some(set) = pkt.addr_set() else { return };
        let offered = set.size().min(self.config.max_claim);
        let better = match &self.offer {
            None => true,
            Some(held) => {
                let held_size = held.addr_set().map_or(0, AddrInterval::size);
                held_size < offered
                    || (held_size == offered
                        && held.lifetime().unwrap_or(0) < pkt.lifetime().unwrap_or(0))
            }
        };
        if better && self.valid_offer(pkt) {
            debug!(server = format_args!("{:012x}", pkt.src), "offer stored");
            self.offer = Some(pkt.clone());
        }
    }

    fn discovery_timeout(&mut self, actions: &mut Vec<Action>) {
        if let Some(offer) = self.offer.take() {
            let server = offer.src;
            let mut src = self.disc_src;
            let offered = match offer.addr_set() {
                Some(set) => *set,
                None => {
                    self.restart(actions);
                    return;
                }
            };
            if !self.preassigned {
                src = offer.client_addr().unwrap_or(0);
                if src == 0 && !offered.is_multicast() {
                    src = offered.first_addr();
                }
            }
            self.clean_discovery(actions);
            self.start_requesting(server, src, offered, false, actions);
            return;
        }
        if self.change_discovery {
            self.restart(actions);
            return;
        }
        self.disc_count -= 1;
        if self.disc_count > 0 {
            self.send_discover(actions);
            return;
        }
        if self.self_assignable() {
            self.self_assign(actions);
        } else {
            self.restart(actions);
        }
    }

    /// Whether the probed set lies in a range stations may take without a
    /// server. Outside the unicast range this is only allowed with a
    /// preassigned source address.
    fn self_assignable(&self) -> bool {
        let Some(probe) = self.discovery_set else {
            return false;
        };
        let overlaps =
            |range: &AddrInterval| AddrInterval::intersection(&probe, range).is_some();
        overlaps(&AUTOASSIGN_UNICAST)
            || (self.preassigned
                && (overlaps(&AUTOASSIGN_MULTICAST)
                    || overlaps(&AUTOASSIGN_UNICAST_64)
                    || overlaps(&AUTOASSIGN_MULTICAST_64)))
    }

    fn self_assign(&mut self, actions: &mut Vec<Action>) {
        let Some(mut assigned) = self.discovery_set else {
            self.restart(actions);
            return;
        };
        let mut size = self.config.max_claim;
        if !assigned.is_multicast() {
            size = size.min(MAX_AUTOASSIGN_UNICAST);
        }
        if self.config.random_assign {
            assigned = AddrInterval::random_within(&assigned, size, &mut self.rng);
        } else {
            adjust_set(&mut assigned, size);
        }
        info!(set = %assigned, "self-assigning");
        self.clean_discovery(actions);
        self.start_defending(assigned, actions);
    }

    // ---- requesting ----

    fn start_requesting(
        &mut self,
        server: u64,
        src: u64,
        mut set: AddrInterval,
        renewal: bool,
        actions: &mut Vec<Action>,
    ) {
        self.leave_group(actions);
        adjust_set(&mut set, self.config.max_claim);
        let mut pkt = Packet::new(
            MessageType::Request,
            server,
            src,
            self.token,
            StatusCode::NoCode,
        );
        pkt.add_addr_set(set);
        if let Some(id) = &self.config.station_id {
            pkt.add_station_id(id.as_bytes());
        }
        if renewal {
            pkt.set_renewal();
        } else if !self.preassigned {
            actions.push(Action::AddAddress(src));
        }
        self.state = State::Requesting;
        self.req_count = REQUEST_ATTEMPTS;
        self.req_server = server;
        self.req_src = src;
        self.request_pkt = Some(pkt);
        self.send_request(actions);
    }

    fn clean_requesting(&mut self, actions: &mut Vec<Action>) {
        if self.req_src != 0 && !self.preassigned {
            actions.push(Action::RemoveAddress(self.req_src));
        }
        self.req_src = 0;
        self.req_server = 0;
        self.request_pkt = None;
        self.timers.cancel(ClientTimer::Request);
    }

    fn send_request(&mut self, actions: &mut Vec<Action>) {
        if let Some(pkt) = &self.request_pkt {
            actions.push(Action::Send(pkt.clone()));
        }
        let timeout = 0.5 + self.rng.gen_range(0.0..0.1);
        self.timers.schedule(ClientTimer::Request, timeout);
    }

    fn requesting_handle(&mut self, pkt: &Packet, actions: &mut Vec<Action>) {
        if pkt.msg_type != MessageType::Ack
            || pkt.dest != self.req_src
            || pkt.src != self.req_server
            || pkt.token != self.token
            || !self.station_id_matches(pkt.station_id())
        {
            return;
        }
        let lifetime = pkt.lifetime().unwrap_or(0);
        let granted = matches!(pkt.status, StatusCode::AssignOk | StatusCode::AlternateSet)
            && lifetime > 0
            && pkt.addr_set().is_some();
        if !granted {
            warn!(status = ?pkt.status, "request rejected");
            self.restart(actions);
            return;
        }
        self.src_addr = self.req_src;
        self.server_addr = self.req_server;
        self.assigned_set = pkt.addr_set().copied();
        let acceptable = self.valid_set(pkt);
        // The granted address must survive the requesting cleanup.
        self.req_src = 0;
        self.clean_requesting(actions);
        self.start_bound(lifetime, acceptable, actions);
    }

    fn request_timeout(&mut self, actions: &mut Vec<Action>) {
        self.req_count -= 1;
        if self.req_count > 0 {
            self.send_request(actions);
        } else {
            debug!("no ack received");
            self.restart(actions);
        }
    }

    // ---- bound ----

    fn start_bound(&mut self, lifetime: u16, acceptable: bool, actions: &mut Vec<Action>) {
        self.state = State::Bound;
        if !acceptable {
            info!("granted set does not satisfy the claim, releasing");
            self.send_release(false, actions);
            return;
        }
        if let Some(set) = self.assigned_set {
            info!(set = %set, lifetime, "lease bound");
        }
        let mut secs = lifetime;
        // Renew one second early so the server still holds the lease.
        if self.config.renewal && secs > 1 {
            secs -= 1;
        }
        self.timers.schedule(ClientTimer::BoundLease, f64::from(secs));
    }

    fn lease_timeout(&mut self, actions: &mut Vec<Action>) {
        if self.config.renewal {
            let server = self.server_addr;
            let src = self.src_addr;
            if let Some(set) = self.assigned_set {
                self.start_requesting(server, src, set, true, actions);
                return;
            }
        }
        self.restart(actions);
    }

    fn send_release(&mut self, terminate: bool, actions: &mut Vec<Action>) {
        let mut pkt = Packet::new(
            MessageType::Release,
            self.server_addr,
            self.src_addr,
            self.token,
            StatusCode::NoCode,
        );
        if let Some(set) = self.assigned_set {
            pkt.add_addr_set(set);
        }
        if let Some(id) = &self.config.station_id {
            pkt.add_station_id(id.as_bytes());
        }
        actions.push(Action::Send(pkt));
        if !terminate {
            self.restart(actions);
        }
    }

    // ---- defending ----

    fn start_defending(&mut self, set: AddrInterval, actions: &mut Vec<Action>) {
        self.state = State::Defending;
        if !self.preassigned {
            let src = AddrInterval::random_within(&set, 1, &mut self.rng);
            self.src_addr = src.first_addr();
            actions.push(Action::AddAddress(self.src_addr));
        }
        self.assigned_set = Some(set);
        self.timers
            .schedule(ClientTimer::SelfLease, SELF_ASSIGNMENT_LIFETIME);
        self.join_group(actions);
        self.send_announce(actions);
    }

    fn clean_defending(&mut self, actions: &mut Vec<Action>) {
        if self.src_addr != 0 && !self.preassigned {
            actions.push(Action::RemoveAddress(self.src_addr));
            self.src_addr = 0;
        }
        self.assigned_set = None;
        self.timers.cancel(ClientTimer::SelfLease);
        self.timers.cancel(ClientTimer::Announcement);
    }

    fn send_announce(&mut self, actions: &mut Vec<Action>) {
        let Some(set) = self.assigned_set else { return };
        let remaining = self
            .timers
            .remaining(ClientTimer::SelfLease)
            .unwrap_or(0.0);
        let mut pkt = Packet::new(
            MessageType::Announce,
            PROTOCOL_GROUP,
            self.src_addr,
            self.token,
            StatusCode::NoCode,
        );
        pkt.add_addr_set(set);
        pkt.add_lifetime((remaining + 0.5) as u16);
        if let Some(id) = &self.config.station_id {
            pkt.add_station_id(id.as_bytes());
        }
        actions.push(Action::Send(pkt));
        let interval = 30.0 + self.rng.gen_range(0.0..2.0);
        self.timers.schedule(ClientTimer::Announcement, interval);
    }

    fn defending_handle(&mut self, pkt: &Packet, actions: &mut Vec<Action>) {
        if pkt.dest == PROTOCOL_GROUP {
            match pkt.msg_type {
                MessageType::Announce => {
                    let Some(foreign) = pkt.addr_set().copied() else {
                        return;
                    };
                    self.db.exclude(&foreign, pkt.lifetime().unwrap_or(0));
                    let held = self.assigned_set.unwrap_or_default();
                    if let Some(conflict) = AddrInterval::intersection(&foreign, &held) {
                        self.process_conflict(foreign, conflict, pkt.src, pkt.station_id(), actions);
                    }
                }
                MessageType::Discover => {
                    let Some(claimed) = pkt.addr_set().copied() else {
                        return;
                    };
                    let held = self.assigned_set.unwrap_or_default();
                    if let Some(conflict) = AddrInterval::intersection(&claimed, &held) {
                        self.send_defend(claimed, conflict, pkt.src, pkt.station_id(), actions);
                    }
                }
                _ => {}
            }
            return;
        }
        if pkt.dest != self.src_addr || !self.station_id_matches(pkt.station_id()) {
            return;
        }
        match pkt.msg_type {
            MessageType::Defend => {
                let Some(foreign) = pkt.conflict_set().copied() else {
                    return;
                };
                self.db.exclude(&foreign, pkt.lifetime().unwrap_or(0));
                let held = self.assigned_set.unwrap_or_default();
                if let Some(conflict) = AddrInterval::intersection(&foreign, &held) {
                    self.process_conflict(foreign, conflict, pkt.src, None, actions);
                }
            }
            MessageType::Offer if pkt.token == self.token => {
                if !self.valid_offer(pkt) {
                    return;
                }
                let Some(offered) = pkt.addr_set().copied() else {
                    return;
                };
                let server = pkt.src;
                let mut src = self.src_addr;
                if !self.preassigned {
                    src = pkt.client_addr().unwrap_or(0);
                    if src == 0 && !offered.is_multicast() {
                        src = offered.first_addr();
                    }
                }
                info!(server = format_args!("{server:012x}"), "server appeared, requesting");
                self.clean_defending(actions);
                self.start_requesting(server, src, offered, false, actions);
            }
            _ => {}
        }
    }

    /// Resolves an overlap between the defended block and a foreign
    /// claim: keep the part left of the conflict if large enough,
    /// otherwise shrink to the minimum claim and defend the rest, and
    /// when even that is impossible give the block up.
    fn process_conflict(
        &mut self,
        foreign: AddrInterval,
        conflict: AddrInterval,
        peer: u64,
        station_id: Option<&[u8]>,
        actions: &mut Vec<Action>,
    ) {
        let Some(mut held) = self.assigned_set else {
            return;
        };
        let min = self.config.min_claim;
        let left = conflict.first_addr().saturating_sub(held.first_addr());
        if left >= min {
            adjust_set(&mut held, left);
            info!(set = %held, "shrinking defended block");
            self.assigned_set = Some(held);
            return;
        }
        if min < held.size() {
            adjust_set(&mut held, min);
            info!(set = %held, "shrinking defended block to minimum");
            self.assigned_set = Some(held);
            if let Some(remaining) = AddrInterval::intersection(&foreign, &held) {
                self.send_defend(foreign, remaining, peer, station_id, actions);
            }
            return;
        }
        info!("defended block lost");
        self.restart(actions);
    }

    /// Tells a claimant which part of its set is already taken. The
    /// first set parameter is the claimant's own, the second the
    /// conflicting sub-block.
    fn send_defend(
        &mut self,
        claimed: AddrInterval,
        conflict: AddrInterval,
        peer: u64,
        station_id: Option<&[u8]>,
        actions: &mut Vec<Action>,
    ) {
        let remaining = self
            .timers
            .remaining(ClientTimer::SelfLease)
            .unwrap_or(0.0);
        let mut pkt = Packet::new(
            MessageType::Defend,
            peer,
            self.src_addr,
            self.token,
            StatusCode::NoCode,
        );
        if let Some(id) = station_id {
            pkt.add_station_id(id);
        }
        pkt.add_lifetime(remaining as u16);
        pkt.add_addr_set(claimed);
        pkt.add_conflict_set(conflict);
        actions.push(Action::Send(pkt));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrset::AddrWidth;

    const SERVER: u64 = 0x0202_0000_0001;
    const PEER: u64 = 0x0202_0000_0666;

    fn config() -> ClientConfig {
        ClientConfig {
            interface: "test0".into(),
            ..ClientConfig::default()
        }
    }

    fn sent(actions: &[Action]) -> Vec<&Packet> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(pkt) => Some(pkt),
                _ => None,
            })
            .collect()
    }

    fn offer(client: &Client, discover: &Packet, set: AddrInterval, lifetime: u16) -> Packet {
        let mut pkt = Packet::new(
            MessageType::Offer,
            discover.src,
            SERVER,
            client.token(),
            StatusCode::NoCode,
        );
        pkt.add_lifetime(lifetime);
        pkt.add_addr_set(set);
        pkt
    }

    fn run_discovery(client: &mut Client) -> Packet {
        let actions = client.start();
        assert!(actions.iter().any(|a| matches!(a, Action::JoinGroup)));
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MessageType::Discover);
        frames[0].clone()
    }

    #[test]
    fn test_discovery_to_bound() {
        let mut client = Client::new(config());
        let discover = run_discovery(&mut client);
        assert_eq!(discover.dest, PROTOCOL_GROUP);

        let granted = AddrInterval::from_count(0x0a00_0000_0100, 16);
        client.handle_packet(&offer(&client, &discover, granted, 60));
        client.advance(1.0);
        let actions = client.poll();

        // The offered block's first address becomes the source address.
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        let request = frames[0];
        assert_eq!(request.msg_type, MessageType::Request);
        assert_eq!(request.dest, SERVER);
        assert_eq!(request.src, granted.first_addr());
        assert_eq!(request.addr_set(), Some(&granted));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::AddAddress(addr) if *addr == granted.first_addr())));

        let mut ack = Packet::new(
            MessageType::Ack,
            request.src,
            SERVER,
            client.token(),
            StatusCode::AssignOk,
        );
        ack.add_addr_set(granted);
        ack.add_lifetime(60);
        client.handle_packet(&ack);
        assert!(client.is_bound());
        assert_eq!(client.assigned_set(), Some(granted));
        assert_eq!(client.server_addr(), SERVER);
    }

    #[test]
    fn test_larger_offer_wins() {
        let mut client = Client::new(config());
        let discover = run_discovery(&mut client);

        let small = AddrInterval::from_count(0x0a00_0000_0100, 4);
        let large = AddrInterval::from_count(0x0a00_0000_0200, 16);
        client.handle_packet(&offer(&client, &discover, small, 600));
        let mut better = offer(&client, &discover, large, 60);
        better.src = PEER;
        client.handle_packet(&better);

        client.advance(1.0);
        let actions = client.poll();
        let frames = sent(&actions);
        assert_eq!(frames[0].dest, PEER);
        assert_eq!(frames[0].addr_set(), Some(&large));
    }

    #[test]
    fn test_wrong_token_offer_ignored() {
        let mut client = Client::new(config());
        let discover = run_discovery(&mut client);

        let mut stale = offer(
            &client,
            &discover,
            AddrInterval::from_count(0x0a00_0000_0100, 16),
            60,
        );
        stale.token = client.token().wrapping_add(1);
        client.handle_packet(&stale);

        client.advance(1.0);
        let actions = client.poll();
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MessageType::Discover);
    }

    #[test]
    fn test_self_assignment_after_exhaustion() {
        let mut client = Client::new(config());
        run_discovery(&mut client);

        client.advance(1.0);
        assert_eq!(sent(&client.poll())[0].msg_type, MessageType::Discover);
        client.advance(1.0);
        assert_eq!(sent(&client.poll())[0].msg_type, MessageType::Discover);
        client.advance(1.0);
        let actions = client.poll();

        assert!(client.is_defending());
        let held = client.assigned_set().expect("self-assigned block");
        assert_eq!(held.size(), MAX_AUTOASSIGN_UNICAST);
        assert!(AddrInterval::intersection(&held, &AUTOASSIGN_UNICAST).is_some());
        assert!(client.src_addr() >= held.first_addr() && client.src_addr() <= held.last_addr());
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        let announce = frames[0];
        assert_eq!(announce.msg_type, MessageType::Announce);
        assert_eq!(announce.dest, PROTOCOL_GROUP);
        assert_eq!(announce.addr_set(), Some(&held));
        assert!(announce.lifetime().unwrap_or(0) > 1700);
    }

    #[test]
    fn test_foreign_claim_rebases_discovery() {
        let mut client = Client::new(config());
        run_discovery(&mut client);
        let token = client.token();

        // Someone already defends a block inside the whole claim range.
        let mut announce = Packet::new(
            MessageType::Announce,
            PROTOCOL_GROUP,
            PEER,
            0,
            StatusCode::NoCode,
        );
        announce.add_addr_set(AddrInterval::from_count(0x0a00_0000_0000, 64));
        announce.add_lifetime(600);
        client.handle_packet(&announce);

        client.advance(1.0);
        let actions = client.poll();
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MessageType::Discover);
        assert_eq!(client.token(), token.wrapping_add(1));
    }

    fn defend_with(min: u64, max: u64) -> Client {
        let mut cfg = config();
        cfg.min_claim = min;
        cfg.max_claim = max;
        cfg.random_assign = false;
        let mut client = Client::new(cfg);
        client.start();
        for _ in 0..3 {
            client.advance(1.0);
            client.poll();
        }
        assert!(client.is_defending());
        client
    }

    #[test]
    fn test_defend_shrinks_on_partial_conflict() {
        let mut client = defend_with(1, 16);
        let held = client.assigned_set().expect("defending a block");
        assert_eq!(held.size(), 16);

        let mut announce = Packet::new(
            MessageType::Announce,
            PROTOCOL_GROUP,
            PEER,
            0,
            StatusCode::NoCode,
        );
        announce.add_addr_set(AddrInterval::from_count(held.first_addr() + 8, 16));
        announce.add_lifetime(600);
        client.handle_packet(&announce);

        let shrunk = client.assigned_set().expect("still defending");
        assert_eq!(shrunk.first_addr(), held.first_addr());
        assert_eq!(shrunk.size(), 8);
    }

    #[test]
    fn test_defend_sends_conflict_to_claimant() {
        let mut client = defend_with(8, 16);
        let held = client.assigned_set().expect("defending a block");

        let mut announce = Packet::new(
            MessageType::Announce,
            PROTOCOL_GROUP,
            PEER,
            0,
            StatusCode::NoCode,
        );
        let foreign = AddrInterval::from_count(held.first_addr() + 4, 16);
        announce.add_addr_set(foreign);
        announce.add_lifetime(600);
        let actions = client.handle_packet(&announce);

        // Left part is below the minimum, so the block shrinks to the
        // minimum and the remaining overlap is defended.
        let shrunk = client.assigned_set().expect("still defending");
        assert_eq!(shrunk.size(), 8);
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        let defend = frames[0];
        assert_eq!(defend.msg_type, MessageType::Defend);
        assert_eq!(defend.dest, PEER);
        assert_eq!(defend.addr_set(), Some(&foreign));
        let conflict = defend.conflict_set().expect("conflict sub-block");
        assert_eq!(conflict.first_addr(), held.first_addr() + 4);
        assert_eq!(conflict.last_addr(), shrunk.last_addr());
    }

    #[test]
    fn test_unresolvable_conflict_restarts() {
        let mut client = defend_with(16, 16);
        let held = client.assigned_set().expect("defending a block");
        let token = client.token();

        let mut announce = Packet::new(
            MessageType::Announce,
            PROTOCOL_GROUP,
            PEER,
            0,
            StatusCode::NoCode,
        );
        announce.add_addr_set(held);
        announce.add_lifetime(600);
        let actions = client.handle_packet(&announce);

        assert!(!client.is_defending());
        assert_eq!(client.token(), token.wrapping_add(1));
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MessageType::Discover);
    }

    #[test]
    fn test_defending_answers_discover() {
        let mut client = defend_with(1, 16);
        let held = client.assigned_set().expect("defending a block");

        let mut discover = Packet::new(
            MessageType::Discover,
            PROTOCOL_GROUP,
            PEER,
            7,
            StatusCode::NoCode,
        );
        discover.add_addr_set(held);
        let actions = client.handle_packet(&discover);

        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        let defend = frames[0];
        assert_eq!(defend.msg_type, MessageType::Defend);
        assert_eq!(defend.dest, PEER);
        assert_eq!(defend.conflict_set(), Some(&held));
        // The claim is unaffected, only the claimant is warned.
        assert_eq!(client.assigned_set(), Some(held));
    }

    #[test]
    fn test_announce_repeats() {
        let mut client = defend_with(1, 16);
        client.advance(33.0);
        let actions = client.poll();
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MessageType::Announce);
    }

    fn bind(client: &mut Client, lifetime: u16) -> AddrInterval {
        let discover = run_discovery(client);
        let granted = AddrInterval::from_count(0x0a00_0000_0100, 16);
        client.handle_packet(&offer(client, &discover, granted, lifetime));
        client.advance(1.0);
        let actions = client.poll();
        let request = sent(&actions)[0].clone();
        let mut ack = Packet::new(
            MessageType::Ack,
            request.src,
            SERVER,
            client.token(),
            StatusCode::AssignOk,
        );
        ack.add_addr_set(granted);
        ack.add_lifetime(lifetime);
        client.handle_packet(&ack);
        assert!(client.is_bound());
        granted
    }

    #[test]
    fn test_bound_renewal() {
        let mut cfg = config();
        cfg.renewal = true;
        let mut client = Client::new(cfg);
        let granted = bind(&mut client, 10);
        let src = client.src_addr();

        client.advance(9.5);
        let actions = client.poll();
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        let renewal = frames[0];
        assert_eq!(renewal.msg_type, MessageType::Request);
        assert!(renewal.renewal());
        assert_eq!(renewal.src, src);
        assert_eq!(renewal.addr_set(), Some(&granted));
        // A renewal keeps the installed address.
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::AddAddress(_) | Action::RemoveAddress(_))));
    }

    #[test]
    fn test_lease_expiry_without_renewal_restarts() {
        let mut client = Client::new(config());
        bind(&mut client, 5);
        let src = client.src_addr();

        client.advance(6.0);
        let actions = client.poll();
        assert!(!client.is_bound());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::RemoveAddress(addr) if *addr == src)));
        assert_eq!(sent(&actions)[0].msg_type, MessageType::Discover);
    }

    #[test]
    fn test_release_on_stop() {
        let mut client = Client::new(config());
        let granted = bind(&mut client, 60);

        let actions = client.stop();
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        let release = frames[0];
        assert_eq!(release.msg_type, MessageType::Release);
        assert_eq!(release.dest, SERVER);
        assert_eq!(release.addr_set(), Some(&granted));
    }

    #[test]
    fn test_preassigned_known_server_skips_discovery() {
        let mut cfg = config();
        cfg.preassigned_addr = Some(0x0a00_00ff_0001);
        cfg.known_server = Some(SERVER);
        let mut client = Client::new(cfg);

        let actions = client.start();
        let frames = sent(&actions);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MessageType::Request);
        assert_eq!(frames[0].dest, SERVER);
        assert_eq!(frames[0].src, 0x0a00_00ff_0001);
    }

    #[test]
    fn test_station_id_gates_unicast_frames() {
        let mut cfg = config();
        cfg.station_id = Some("station-a".into());
        let mut client = Client::new(cfg);
        let discover = run_discovery(&mut client);
        assert_eq!(discover.station_id(), Some("station-a".as_bytes()));

        let granted = AddrInterval::from_count(0x0a00_0000_0100, 16);
        let mut wrong = offer(&client, &discover, granted, 60);
        wrong.add_station_id(b"station-b");
        client.handle_packet(&wrong);

        client.advance(1.0);
        let actions = client.poll();
        // The mismatched offer was dropped, so discovery continues.
        assert_eq!(sent(&actions)[0].msg_type, MessageType::Discover);
    }

    #[test]
    fn test_multicast_claim_needs_client_addr() {
        let mut cfg = config();
        cfg.claim_set = AddrInterval::from_count(0x0b00_0000_0000, 1 << 16);
        cfg.max_claim = 64;
        let mut client = Client::new(cfg);
        let discover = run_discovery(&mut client);

        let granted = AddrInterval::from_count(0x0b00_0000_0100, 64);
        client.handle_packet(&offer(&client, &discover, granted, 60));
        client.advance(1.0);
        let actions = client.poll();
        // Without a client address the offer is unusable for a multicast
        // claim, so the probe is repeated instead of a request.
        let retry = sent(&actions)[0].clone();
        assert_eq!(retry.msg_type, MessageType::Discover);

        let mut usable = offer(&client, &retry, granted, 60);
        usable.add_client_addr(0x0a00_0000_4242, AddrWidth::Bits48);
        client.handle_packet(&usable);
        client.advance(1.0);
        let actions = client.poll();
        let request = sent(&actions)[0];
        assert_eq!(request.msg_type, MessageType::Request);
        assert_eq!(request.src, 0x0a00_0000_4242);
    }
}
