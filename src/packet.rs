//! Wire codec for the address-leasing protocol.
//!
//! Frames ride directly on Ethernet with a dedicated ethertype. Layout:
//!
//! ```text
//! 0        6        12     14      15       16        18      20       21      22
//! +--------+--------+------+-------+--------+---------+-------+--------+-------+----
//! | dest   | src    | type | sub   | ver/msg| control | token | st/len | len   | params
//! | 6 B    | 6 B    | 2 B  | 1 B   | 1 B    | 2 B     | 2 B   | 1 B    | 1 B   |
//! +--------+--------+------+-------+--------+---------+-------+--------+-------+----
//! ```
//!
//! `ver/msg` packs a 3-bit version over a 5-bit message type. `st/len` packs
//! a 4-bit status code over the high nibble of the 12-bit body length; the
//! length counts the 8-byte protocol header plus all parameter bytes.
//!
//! Parameters are type-length-value, at most six per frame, each with an id
//! byte and a total-length byte (body + 2). [`Packet::parse`] rejects
//! anything structurally wrong; [`Packet::validate`] enforces the
//! per-message legality table on top of that.

use crate::addrset::{AddrInterval, AddrWidth, IntervalForm};
use crate::error::{Error, Result};

/// Ethertype carried by every protocol frame.
pub const ETHERTYPE: u16 = 0x33ff;

/// Subtype byte following the ethertype.
pub const SUBTYPE: u8 = 0;

/// Multicast group address servers and discovering clients listen on.
pub const PROTOCOL_GROUP: u64 = 0x0180_c2ab_cdef;

/// Smallest possible frame: Ethernet header plus protocol header.
pub const MIN_PKT_SIZE: usize = ETH_HDR_SIZE + HEADER_SIZE;

/// Largest possible frame: every parameter present at its maximum length.
pub const MAX_PKT_SIZE: usize = MIN_PKT_SIZE + 4 + 18 + 2 * 255 + 10 + 255;

/// Maximum number of parameters in one frame.
pub const MAX_PARAMS: usize = 6;

const ETH_HDR_SIZE: usize = 2 * 6 + 2;
const HEADER_SIZE: usize = 8;

// Control word bits. The low six bits mirror the slap class bits of the
// carried address set (see `addrset`).
pub const CW_SLAP_MASK: u16 = 0x37;
pub const CW_SERVER: u16 = 1 << 6;
pub const CW_SET_PROVIDED: u16 = 1 << 7;
pub const CW_STATION_ID: u16 = 1 << 8;
pub const CW_NETWORK_ID: u16 = 1 << 9;
pub const CW_CODE_FIELD: u16 = 1 << 10;
pub const CW_VENDOR: u16 = 1 << 11;
pub const CW_RENEWAL: u16 = 1 << 12;

/// Protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Ack = 4,
    Release = 5,
    Defend = 6,
    Announce = 7,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Ack),
            5 => Some(Self::Release),
            6 => Some(Self::Defend),
            7 => Some(Self::Announce),
            _ => None,
        }
    }
}

/// Status codes carried in the high nibble of the status/length byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    NoCode = 0,
    AssignOk = 1,
    AlternateSet = 2,
    FailConflict = 3,
    FailDisallowed = 4,
    FailTooLarge = 5,
    FailOther = 6,
}

impl StatusCode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NoCode),
            1 => Some(Self::AssignOk),
            2 => Some(Self::AlternateSet),
            3 => Some(Self::FailConflict),
            4 => Some(Self::FailDisallowed),
            5 => Some(Self::FailTooLarge),
            6 => Some(Self::FailOther),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::FailConflict | Self::FailDisallowed | Self::FailTooLarge | Self::FailOther
        )
    }
}

/// One decoded frame parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    StationId(Vec<u8>),
    AddrSet(AddrInterval),
    NetworkId(Vec<u8>),
    Lifetime(u16),
    ClientAddr(AddrInterval),
    Vendor(Vec<u8>),
}

impl Param {
    fn id(&self) -> u8 {
        match self {
            Param::StationId(_) => 1,
            Param::AddrSet(_) => 2,
            Param::NetworkId(_) => 3,
            Param::Lifetime(_) => 4,
            Param::ClientAddr(_) => 5,
            Param::Vendor(_) => 6,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Param::StationId(id) | Param::NetworkId(id) => id.len(),
            Param::AddrSet(set) => match set.form {
                IntervalForm::Count => set.addr_len() + 2,
                IntervalForm::Mask => set.addr_len() * 2,
            },
            Param::Lifetime(_) => 2,
            Param::ClientAddr(set) => set.addr_len(),
            Param::Vendor(var) => var.len(),
        }
    }
}

/// A protocol frame: Ethernet addresses, protocol header, and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub dest: u64,
    pub src: u64,
    pub version: u8,
    pub msg_type: MessageType,
    pub control_word: u16,
    pub token: u16,
    pub status: StatusCode,
    params: Vec<Param>,
}

fn read_uint(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn write_uint(buf: &mut Vec<u8>, value: u64, nbytes: usize) {
    for i in (0..nbytes).rev() {
        buf.push((value >> (8 * i)) as u8);
    }
}

impl Packet {
    /// Starts a frame of the given type. Offers and acks carry the server
    /// bit; a non-zero status sets the code-field bit.
    pub fn new(
        msg_type: MessageType,
        dest: u64,
        src: u64,
        token: u16,
        status: StatusCode,
    ) -> Self {
        let mut control_word = 0u16;
        if msg_type == MessageType::Offer || msg_type == MessageType::Ack {
            control_word |= CW_SERVER;
        }
        if status != StatusCode::NoCode {
            control_word |= CW_CODE_FIELD;
        }
        Self {
            dest,
            src,
            version: 0,
            msg_type,
            control_word,
            token,
            status,
            params: Vec::new(),
        }
    }

    /// Appends an address set and records its presence and slap class in
    /// the control word.
    pub fn add_addr_set(&mut self, set: AddrInterval) {
        self.control_word |= CW_SET_PROVIDED | u16::from(set.slap_class());
        self.params.push(Param::AddrSet(set));
    }

    /// Appends the conflicting sub-block of a defend frame. The control
    /// word already describes the held set, so it is left untouched.
    pub fn add_conflict_set(&mut self, set: AddrInterval) {
        self.params.push(Param::AddrSet(set));
    }

    pub fn add_station_id(&mut self, id: &[u8]) {
        self.control_word |= CW_STATION_ID;
        self.params.push(Param::StationId(id.to_vec()));
    }

    pub fn add_network_id(&mut self, id: &[u8]) {
        self.control_word |= CW_NETWORK_ID;
        self.params.push(Param::NetworkId(id.to_vec()));
    }

    pub fn add_lifetime(&mut self, lifetime: u16) {
        self.params.push(Param::Lifetime(lifetime));
    }

    pub fn add_client_addr(&mut self, addr: u64, width: AddrWidth) {
        self.params
            .push(Param::ClientAddr(AddrInterval::from_count_with(
                addr, 1, width,
            )));
    }

    pub fn add_vendor(&mut self, var: &[u8]) {
        self.control_word |= CW_VENDOR;
        self.params.push(Param::Vendor(var.to_vec()));
    }

    pub fn set_renewal(&mut self) {
        self.control_word |= CW_RENEWAL;
    }

    pub fn renewal(&self) -> bool {
        self.control_word & CW_RENEWAL != 0
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// The first address set, if the set-provided bit confirms one.
    pub fn addr_set(&self) -> Option<&AddrInterval> {
        if self.control_word & CW_SET_PROVIDED == 0 {
            return None;
        }
        self.nth_addr_set(0)
    }

    /// The second address set of a defend frame (the conflicting block).
    pub fn conflict_set(&self) -> Option<&AddrInterval> {
        if self.control_word & CW_SET_PROVIDED == 0 {
            return None;
        }
        self.nth_addr_set(1)
    }

    fn nth_addr_set(&self, index: usize) -> Option<&AddrInterval> {
        self.params
            .iter()
            .filter_map(|p| match p {
                Param::AddrSet(set) => Some(set),
                _ => None,
            })
            .nth(index)
    }

    pub fn client_addr(&self) -> Option<u64> {
        self.params.iter().find_map(|p| match p {
            Param::ClientAddr(set) => Some(set.first_addr()),
            _ => None,
        })
    }

    pub fn lifetime(&self) -> Option<u16> {
        self.params.iter().find_map(|p| match p {
            Param::Lifetime(secs) => Some(*secs),
            _ => None,
        })
    }

    pub fn station_id(&self) -> Option<&[u8]> {
        if self.control_word & CW_STATION_ID == 0 {
            return None;
        }
        self.params.iter().find_map(|p| match p {
            Param::StationId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn network_id(&self) -> Option<&[u8]> {
        if self.control_word & CW_NETWORK_ID == 0 {
            return None;
        }
        self.params.iter().find_map(|p| match p {
            Param::NetworkId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn vendor(&self) -> Option<&[u8]> {
        if self.control_word & CW_VENDOR == 0 {
            return None;
        }
        self.params.iter().find_map(|p| match p {
            Param::Vendor(var) => Some(var.as_slice()),
            _ => None,
        })
    }

    /// Decodes one frame. Fails on truncation, a foreign ethertype or
    /// subtype, an unknown message type or status nibble, a length field
    /// that disagrees with the frame, or any malformed parameter.
    pub fn parse(data: &[u8]) -> Result<Packet> {
        if data.len() < MIN_PKT_SIZE {
            return Err(Error::InvalidPacket(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        if data.len() > MAX_PKT_SIZE {
            return Err(Error::InvalidPacket(format!(
                "frame too long: {} bytes",
                data.len()
            )));
        }

        let dest = read_uint(&data[0..6]);
        let src = read_uint(&data[6..12]);
        let ethertype = read_uint(&data[12..14]) as u16;
        if ethertype != ETHERTYPE || data[14] != SUBTYPE {
            return Err(Error::InvalidPacket(format!(
                "not a leasing frame: ethertype {ethertype:#06x} subtype {}",
                data[14]
            )));
        }

        let version = data[15] >> 5;
        let msg_type = MessageType::from_u8(data[15] & 0x1f).ok_or_else(|| {
            Error::InvalidPacket(format!("unknown message type {}", data[15] & 0x1f))
        })?;
        let control_word = read_uint(&data[16..18]) as u16;
        let token = read_uint(&data[18..20]) as u16;
        let status = StatusCode::from_u8(data[20] >> 4)
            .ok_or_else(|| Error::InvalidPacket(format!("unknown status {}", data[20] >> 4)))?;
        let length = (usize::from(data[20] & 0x0f) << 8) | usize::from(data[21]);

        let body = &data[MIN_PKT_SIZE..];
        if length != body.len() + HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "length field {} does not match frame body {}",
                length,
                body.len()
            )));
        }

        let mut params = Vec::new();
        let mut rest = body;
        while params.len() < MAX_PARAMS && rest.len() >= 2 {
            let (param, tail) = Self::parse_param(rest)?;
            params.push(param);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(Error::InvalidPacket(format!(
                "{} trailing bytes after parameters",
                rest.len()
            )));
        }

        Ok(Packet {
            dest,
            src,
            version,
            msg_type,
            control_word,
            token,
            status,
            params,
        })
    }

    fn parse_param(data: &[u8]) -> Result<(Param, &[u8])> {
        let id = data[0];
        let wire_len = usize::from(data[1]);
        if wire_len < 2 || wire_len > data.len() {
            return Err(Error::InvalidPacket(format!(
                "parameter {id} length {wire_len} exceeds remaining {} bytes",
                data.len()
            )));
        }
        let body = &data[2..wire_len];
        let param = match id {
            1 | 3 => {
                if body.len() < 2 {
                    return Err(Error::InvalidPacket(format!(
                        "identifier parameter body too short: {} bytes",
                        body.len()
                    )));
                }
                if id == 1 {
                    Param::StationId(body.to_vec())
                } else {
                    Param::NetworkId(body.to_vec())
                }
            }
            2 => match body.len() {
                8 | 10 => {
                    let addr_len = body.len() - 2;
                    let addr = read_uint(&body[..addr_len]);
                    let count = read_uint(&body[addr_len..]) as u16;
                    let width = if addr_len == 6 {
                        AddrWidth::Bits48
                    } else {
                        AddrWidth::Bits64
                    };
                    Param::AddrSet(AddrInterval::from_count_with(addr, u64::from(count), width))
                }
                12 | 16 => {
                    let addr_len = body.len() / 2;
                    let addr = read_uint(&body[..addr_len]);
                    let mask = read_uint(&body[addr_len..]);
                    let width = if addr_len == 6 {
                        AddrWidth::Bits48
                    } else {
                        AddrWidth::Bits64
                    };
                    Param::AddrSet(AddrInterval::from_mask(addr, mask, width))
                }
                other => {
                    return Err(Error::InvalidPacket(format!(
                        "address set body length {other} not in {{8, 10, 12, 16}}"
                    )));
                }
            },
            4 => {
                if body.len() != 2 {
                    return Err(Error::InvalidPacket(format!(
                        "lifetime body length {} is not 2",
                        body.len()
                    )));
                }
                Param::Lifetime(read_uint(body) as u16)
            }
            5 => {
                let width = match body.len() {
                    6 => AddrWidth::Bits48,
                    8 => AddrWidth::Bits64,
                    other => {
                        return Err(Error::InvalidPacket(format!(
                            "client address body length {other} not in {{6, 8}}"
                        )));
                    }
                };
                Param::ClientAddr(AddrInterval::from_count_with(read_uint(body), 1, width))
            }
            6 => {
                if body.len() < 2 {
                    return Err(Error::InvalidPacket(format!(
                        "vendor parameter body too short: {} bytes",
                        body.len()
                    )));
                }
                Param::Vendor(body.to_vec())
            }
            other => {
                return Err(Error::InvalidPacket(format!("unknown parameter id {other}")));
            }
        };
        Ok((param, &data[wire_len..]))
    }

    /// Serializes the frame to raw bytes.
    pub fn encode(&self) -> Vec<u8> {
        let body_len: usize = self.params.iter().map(|p| p.body_len() + 2).sum();
        let length = HEADER_SIZE + body_len;
        let mut buf = Vec::with_capacity(MIN_PKT_SIZE + body_len);

        write_uint(&mut buf, self.dest, 6);
        write_uint(&mut buf, self.src, 6);
        write_uint(&mut buf, u64::from(ETHERTYPE), 2);
        buf.push(SUBTYPE);
        buf.push((self.version << 5) | self.msg_type as u8);
        write_uint(&mut buf, u64::from(self.control_word), 2);
        write_uint(&mut buf, u64::from(self.token), 2);
        buf.push(((self.status as u8) << 4) | ((length >> 8) as u8 & 0x0f));
        buf.push(length as u8);

        for param in &self.params {
            buf.push(param.id());
            buf.push((param.body_len() + 2) as u8);
            match param {
                Param::StationId(id) | Param::NetworkId(id) => buf.extend_from_slice(id),
                Param::AddrSet(set) => {
                    write_uint(&mut buf, set.first_addr(), set.addr_len());
                    match set.form {
                        IntervalForm::Count => write_uint(&mut buf, set.size() & 0xffff, 2),
                        IntervalForm::Mask => write_uint(&mut buf, set.mask(), set.addr_len()),
                    }
                }
                Param::Lifetime(secs) => write_uint(&mut buf, u64::from(*secs), 2),
                Param::ClientAddr(set) => {
                    write_uint(&mut buf, set.first_addr(), set.addr_len())
                }
                Param::Vendor(var) => buf.extend_from_slice(var),
            }
        }
        buf
    }

    /// Checks the per-message legality table: which control bits and
    /// parameters each message type must and must not carry.
    pub fn validate(&self) -> Result<()> {
        let cw = self.control_word;
        let mut counts = [0usize; 7];
        for param in &self.params {
            counts[usize::from(param.id())] += 1;
            match param {
                Param::StationId(_) if cw & CW_STATION_ID == 0 => {
                    return Err(Error::InvalidPacket(
                        "station id present without its control bit".into(),
                    ));
                }
                Param::NetworkId(_) if cw & CW_NETWORK_ID == 0 => {
                    return Err(Error::InvalidPacket(
                        "network id present without its control bit".into(),
                    ));
                }
                Param::Vendor(_) if cw & CW_VENDOR == 0 => {
                    return Err(Error::InvalidPacket(
                        "vendor data present without its control bit".into(),
                    ));
                }
                Param::AddrSet(set) => {
                    let want = CW_SET_PROVIDED | u16::from(set.slap_class());
                    if cw & (CW_SET_PROVIDED | CW_SLAP_MASK) != want {
                        return Err(Error::InvalidPacket(
                            "address set disagrees with control word class bits".into(),
                        ));
                    }
                }
                _ => {}
            }
        }

        let sets = counts[2];
        if sets > 2 || (sets == 2 && self.msg_type != MessageType::Defend) {
            return Err(Error::InvalidPacket(format!(
                "{sets} address sets not allowed for {:?}",
                self.msg_type
            )));
        }
        for (id, &count) in counts.iter().enumerate() {
            if id != 2 && count > 1 {
                return Err(Error::InvalidPacket(format!(
                    "parameter {id} repeated {count} times"
                )));
            }
        }

        // Per-message bit and parameter requirements.
        let client_free = [MessageType::Discover, MessageType::Offer];
        let (forbidden, required, lifetimes) = match self.msg_type {
            MessageType::Discover => (
                CW_SERVER | CW_NETWORK_ID | CW_CODE_FIELD | CW_RENEWAL,
                0,
                0..=0,
            ),
            MessageType::Offer => (
                CW_CODE_FIELD | CW_RENEWAL,
                CW_SERVER | CW_SET_PROVIDED,
                1..=1,
            ),
            MessageType::Request => (
                CW_SERVER | CW_NETWORK_ID | CW_CODE_FIELD,
                CW_SET_PROVIDED,
                0..=0,
            ),
            MessageType::Ack => (CW_RENEWAL, CW_SERVER | CW_CODE_FIELD, 0..=1),
            MessageType::Release => (
                CW_SERVER | CW_NETWORK_ID | CW_CODE_FIELD | CW_RENEWAL,
                CW_SET_PROVIDED,
                0..=0,
            ),
            MessageType::Defend | MessageType::Announce => (
                CW_SERVER | CW_NETWORK_ID | CW_CODE_FIELD | CW_RENEWAL,
                CW_SET_PROVIDED,
                1..=1,
            ),
        };
        if cw & forbidden != 0 {
            return Err(Error::InvalidPacket(format!(
                "forbidden control bits for {:?}: {:#06x}",
                self.msg_type,
                cw & forbidden
            )));
        }
        if cw & required != required {
            return Err(Error::InvalidPacket(format!(
                "missing control bits for {:?}: {:#06x}",
                self.msg_type,
                required & !cw
            )));
        }
        if !lifetimes.contains(&counts[4]) {
            return Err(Error::InvalidPacket(format!(
                "{} lifetime parameters not allowed for {:?}",
                counts[4], self.msg_type
            )));
        }
        if counts[5] > 0 && !client_free.contains(&self.msg_type) {
            return Err(Error::InvalidPacket(format!(
                "client address not allowed for {:?}",
                self.msg_type
            )));
        }
        if self.msg_type == MessageType::Defend && sets != 2 {
            return Err(Error::InvalidPacket(format!(
                "defend carries {sets} address sets instead of 2"
            )));
        }
        Ok(())
    }
}
