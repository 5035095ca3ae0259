//! Client and server configuration.
//!
//! Both configurations are plain JSON files. [`ClientConfig::load_or_create`]
//! and [`ServerConfig::load_or_create`] write a default file on first run so
//! there is always something to edit.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::addrset::AddrInterval;
use crate::error::{Error, Result};

/// Configuration of a leasing client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Network interface to negotiate on.
    pub interface: String,
    /// Source address configured out of band instead of leased.
    pub preassigned_addr: Option<u64>,
    /// Range of addresses the client wants a block from.
    pub claim_set: AddrInterval,
    /// Smallest usable block.
    pub min_claim: u64,
    /// Largest block worth requesting.
    pub max_claim: u64,
    /// Server to contact directly, skipping discovery. Requires a
    /// preassigned source address.
    pub known_server: Option<u64>,
    /// Whether leases are renewed in place instead of re-negotiated.
    pub renewal: bool,
    /// Place self-assigned blocks at a random position instead of the
    /// start of the free range.
    pub random_assign: bool,
    /// Identity echoed by servers so stations behind a proxy can tell
    /// answers apart.
    pub station_id: Option<String>,
    pub vendor: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            preassigned_addr: None,
            claim_set: AddrInterval::from_count(0x0a00_0000_0000, 1 << 40),
            min_claim: 1,
            max_claim: 16,
            known_server: None,
            renewal: false,
            random_assign: true,
            station_id: None,
            vendor: None,
        }
    }
}

impl ClientConfig {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ClientConfig = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = ClientConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(Error::InvalidConfig(
                "interface must be specified".to_string(),
            ));
        }

        let claim = self.claim_set.size();
        if claim > 0 && claim < self.max_claim {
            return Err(Error::InvalidConfig(
                "claim_set is smaller than max_claim".to_string(),
            ));
        }

        if self.min_claim > self.max_claim {
            return Err(Error::InvalidConfig(
                "min_claim must not exceed max_claim".to_string(),
            ));
        }

        if self.known_server.is_some() && self.preassigned_addr.is_none() {
            return Err(Error::InvalidConfig(
                "known_server requires preassigned_addr".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration of a leasing server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Network interface to serve on.
    pub interface: String,
    /// The server's own link-layer address.
    pub src_addr: u64,
    /// Pool of assignable 48-bit unicast addresses.
    pub unicast_set: AddrInterval,
    /// Pool of assignable 48-bit multicast addresses.
    pub multicast_set: AddrInterval,
    /// Pool of assignable 64-bit unicast addresses.
    pub unicast_64_set: AddrInterval,
    /// Pool of assignable 64-bit multicast addresses.
    pub multicast_64_set: AddrInterval,
    /// Largest block granted per class; zero disables the class.
    pub max_unicast: u64,
    pub max_multicast: u64,
    pub max_unicast_64: u64,
    pub max_multicast_64: u64,
    /// Largest block offered to a claimless discover.
    pub max_default: u64,
    /// Lease lifetime in seconds per class.
    pub unicast_lifetime: u16,
    pub multicast_lifetime: u16,
    pub unicast_64_lifetime: u16,
    pub multicast_64_lifetime: u16,
    /// How long an offered block stays reserved for its station.
    pub reserve_lifetime: u16,
    /// Whether holders may renew an assigned block in place.
    pub accept_renewal: bool,
    /// Class used for claimless discovers.
    pub default_multicast: bool,
    pub default_64: bool,
    /// Answer announces of self-assigned blocks with an offer.
    pub autoassign_objection: bool,
    /// Grant a different block when the requested one is taken or too
    /// large.
    pub alternate_set: bool,
    pub network_id: Option<String>,
    pub vendor: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            src_addr: 0,
            unicast_set: AddrInterval::from_count(0, 0),
            multicast_set: AddrInterval::from_count(0, 0),
            unicast_64_set: AddrInterval::from_count(0, 0),
            multicast_64_set: AddrInterval::from_count(0, 0),
            max_unicast: 1,
            max_multicast: 0,
            max_unicast_64: 0,
            max_multicast_64: 0,
            max_default: 1,
            unicast_lifetime: 60,
            multicast_lifetime: 60,
            unicast_64_lifetime: 60,
            multicast_64_lifetime: 60,
            reserve_lifetime: 3,
            accept_renewal: false,
            default_multicast: false,
            default_64: false,
            autoassign_objection: true,
            alternate_set: true,
            network_id: None,
            vendor: None,
        }
    }
}

impl ServerConfig {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ServerConfig = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = ServerConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(Error::InvalidConfig(
                "interface must be specified".to_string(),
            ));
        }

        if self.src_addr == 0 {
            return Err(Error::InvalidConfig(
                "src_addr must be specified".to_string(),
            ));
        }

        if self.unicast_set.size() == 0 {
            return Err(Error::InvalidConfig(
                "unicast_set must not be empty".to_string(),
            ));
        }

        let pools = [
            ("unicast_set", self.unicast_set, self.max_unicast),
            ("multicast_set", self.multicast_set, self.max_multicast),
            ("unicast_64_set", self.unicast_64_set, self.max_unicast_64),
            (
                "multicast_64_set",
                self.multicast_64_set,
                self.max_multicast_64,
            ),
        ];
        for (name, pool, max) in pools {
            if pool.size() < max {
                return Err(Error::InvalidConfig(format!(
                    "{name} is smaller than its largest grant"
                )));
            }
        }

        let default_pool = match (self.default_multicast, self.default_64) {
            (false, false) => self.unicast_set,
            (true, false) => self.multicast_set,
            (false, true) => self.unicast_64_set,
            (true, true) => self.multicast_64_set,
        };
        if default_pool.size() == 0 || default_pool.size() < self.max_default {
            return Err(Error::InvalidConfig(
                "the default pool cannot cover max_default".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientConfig {
        ClientConfig {
            interface: "eth0".to_string(),
            ..Default::default()
        }
    }

    fn server() -> ServerConfig {
        ServerConfig {
            interface: "eth0".to_string(),
            src_addr: 0x0202_0000_0001,
            unicast_set: AddrInterval::from_count(0x0a00_0000_0000, 256),
            max_unicast: 16,
            max_default: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_client_defaults_valid_with_interface() {
        assert!(client().validate().is_ok());
        assert!(ClientConfig::default().validate().is_err());
    }

    #[test]
    fn test_client_min_above_max() {
        let config = ClientConfig {
            min_claim: 32,
            ..client()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_claim_smaller_than_max() {
        let config = ClientConfig {
            claim_set: AddrInterval::from_count(0x0a00_0000_0000, 8),
            min_claim: 1,
            max_claim: 16,
            ..client()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_known_server_needs_preassigned() {
        let config = ClientConfig {
            known_server: Some(0x0202_0000_0001),
            ..client()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            known_server: Some(0x0202_0000_0001),
            preassigned_addr: Some(0x0a00_00ff_0001),
            ..client()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_valid() {
        assert!(server().validate().is_ok());
        assert!(ServerConfig::default().validate().is_err());
    }

    #[test]
    fn test_server_pool_below_grant() {
        let config = ServerConfig {
            max_unicast: 1024,
            ..server()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_default_pool_must_exist() {
        let config = ServerConfig {
            default_multicast: true,
            ..server()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = server();
        let text = serde_json::to_string_pretty(&config).expect("serialize");
        let back: ServerConfig = serde_json::from_str(&text).expect("parse");
        assert_eq!(back.unicast_set, config.unicast_set);
        assert_eq!(back.max_unicast, config.max_unicast);
        assert_eq!(back.src_addr, config.src_addr);
    }
}
