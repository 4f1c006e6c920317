use crate::error::Error;
use ipnetwork::IpNetwork;
use lazy_static::lazy_static;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use trust_dns_proto::rr::Name;

pub type SharedConfig = Arc<Config>;

/// The domain served when none is configured.
pub const DEFAULT_DOMAIN: &str = "default.service.arpa.";

/// Default range for randomly selected unicast-mode ports.
pub const DEFAULT_UDP_PORT_MIN: u16 = 53535;
pub const DEFAULT_UDP_PORT_MAX: u16 = 53554;

/// Fixed port used in anycast address mode.
pub const ANYCAST_PORT: u16 = 53;

const DEFAULT_MIN_LEASE: u32 = 30; // 30 seconds.
const DEFAULT_MAX_LEASE: u32 = 27 * 3600; // 27 hours (in seconds).
const DEFAULT_MIN_KEY_LEASE: u32 = 30; // 30 seconds.
const DEFAULT_MAX_KEY_LEASE: u32 = 189 * 3600; // 189 hours (in seconds).

/// How the server picks the address/port it advertises.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMode {
    /// A random port in the configured range, advertised explicitly.
    Unicast,
    /// Port 53 behind an anycast address, advertised with a sequence number.
    Anycast,
}

impl Default for AddressMode {
    fn default() -> Self {
        AddressMode::Unicast
    }
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_domain")]
    pub domain: Name,
    #[serde(default)]
    pub address_mode: AddressMode,
    #[serde(default)]
    pub anycast_sequence_number: u8,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    #[serde(default = "default_udp_port_min")]
    pub udp_port_min: u16,
    #[serde(default = "default_udp_port_max")]
    pub udp_port_max: u16,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout: Duration,
    pub api_bind_addr: Option<SocketAddr>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_api_timeout")]
    pub api_timeout: Duration,
}

fn default_domain() -> Name {
    // NB: unwrap is safe, the default domain is a well-formed constant.
    Name::from_ascii(DEFAULT_DOMAIN).unwrap()
}

fn default_listen_addr() -> IpAddr {
    IpAddr::from_str("::").unwrap()
}

fn default_udp_port_min() -> u16 {
    DEFAULT_UDP_PORT_MIN
}

fn default_udp_port_max() -> u16 {
    DEFAULT_UDP_PORT_MAX
}

fn default_handler_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            domain: default_domain(),
            address_mode: AddressMode::default(),
            anycast_sequence_number: 0,
            listen_addr: default_listen_addr(),
            udp_port_min: DEFAULT_UDP_PORT_MIN,
            udp_port_max: DEFAULT_UDP_PORT_MAX,
            ttl: TtlConfig::default(),
            lease: LeaseConfig::default(),
            handler_timeout: default_handler_timeout(),
            api_bind_addr: None,
            api_timeout: default_api_timeout(),
        }
    }
}

lazy_static! {
    // NOTE(XXX): Once the "ip" feature has stabilized we can use
    //            Ipv6Addr.is_unicast_link_local[0]. Presently this feature is
    //            unstable so we home-roll. See also RFC 4291 §2.5.6[1].
    // [0]: https://doc.rust-lang.org/std/net/struct.Ipv6Addr.html#method.is_unicast_link_local
    // [1]: https://www.rfc-editor.org/rfc/rfc4291#section-2.5.6
    static ref IPV6_LINK_LOCAL_NETWORK: IpNetwork = IpNetwork::from_str("fe80::/10").unwrap();
}

/// Whether an address may appear in a host's registered address set.
/// Link-local, loopback, multicast and unspecified addresses are filtered out
/// of incoming registrations.
pub(crate) fn is_registrable_address(addr: &Ipv6Addr) -> bool {
    !addr.is_loopback()
        && !addr.is_multicast()
        && !addr.is_unspecified()
        && !IPV6_LINK_LOCAL_NETWORK.contains(IpAddr::V6(*addr))
}

impl Config {
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let mut conf: Config = serde_json::from_reader(reader)?;
        if !conf.domain.is_fqdn() {
            conf.domain.set_fqdn(true);
        }
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.domain.is_root() {
            return Err(Error::InvalidArgs("domain must not be the root".into()));
        }
        if !self.ttl.is_valid() {
            return Err(Error::InvalidArgs("TTL range is not valid".into()));
        }
        if !self.lease.is_valid() {
            return Err(Error::InvalidArgs(
                "LEASE or KEY-LEASE range is not valid".into(),
            ));
        }
        if self.udp_port_min > self.udp_port_max {
            return Err(Error::InvalidArgs("invalid UDP port range".into()));
        }
        Ok(())
    }
}

/// TTL bounds applied to every granted record TTL.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlConfig {
    pub min_ttl: u32,
    pub max_ttl: u32,
}

impl Default for TtlConfig {
    fn default() -> Self {
        TtlConfig {
            min_ttl: DEFAULT_MIN_LEASE,
            max_ttl: DEFAULT_MAX_LEASE,
        }
    }
}

impl TtlConfig {
    pub fn is_valid(&self) -> bool {
        self.min_ttl <= self.max_ttl
    }

    /// The effective TTL for a record whose owner was granted `lease`
    /// seconds. A requested TTL of zero falls back to the lease interval, and
    /// the result never exceeds the lease.
    pub fn grant_ttl(&self, lease: u32, requested_ttl: u32) -> u32 {
        let ttl = if requested_ttl == 0 {
            lease
        } else {
            requested_ttl
        };
        ttl.clamp(self.min_ttl, self.max_ttl).min(lease)
    }
}

/// LEASE and KEY-LEASE bounds applied to every granted lease.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub min_lease: u32,
    pub max_lease: u32,
    pub min_key_lease: u32,
    pub max_key_lease: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            min_lease: DEFAULT_MIN_LEASE,
            max_lease: DEFAULT_MAX_LEASE,
            min_key_lease: DEFAULT_MIN_KEY_LEASE,
            max_key_lease: DEFAULT_MAX_KEY_LEASE,
        }
    }
}

impl LeaseConfig {
    pub fn is_valid(&self) -> bool {
        self.min_lease > 0
            && self.min_lease <= self.max_lease
            && self.min_key_lease > 0
            && self.min_key_lease <= self.max_key_lease
            && self.min_lease <= self.min_key_lease
            && self.max_lease <= self.max_key_lease
    }

    /// Clamp a requested LEASE. A requested zero is honored as zero: it
    /// signals deletion, not a lease grant.
    pub fn grant_lease(&self, requested: u32) -> u32 {
        if requested == 0 {
            0
        } else {
            requested.clamp(self.min_lease, self.max_lease)
        }
    }

    /// Clamp a requested KEY-LEASE. Zero releases the name entirely.
    pub fn grant_key_lease(&self, requested: u32) -> u32 {
        if requested == 0 {
            0
        } else {
            requested.clamp(self.min_key_lease, self.max_key_lease)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_lease_clamps_to_range() {
        let config = LeaseConfig::default();
        assert_eq!(config.grant_lease(1), DEFAULT_MIN_LEASE);
        assert_eq!(config.grant_lease(3600), 3600);
        assert_eq!(config.grant_lease(u32::MAX), DEFAULT_MAX_LEASE);
        assert_eq!(config.grant_key_lease(u32::MAX), DEFAULT_MAX_KEY_LEASE);
    }

    #[test]
    fn grant_lease_honors_zero() {
        let config = LeaseConfig::default();
        assert_eq!(config.grant_lease(0), 0);
        assert_eq!(config.grant_key_lease(0), 0);
    }

    #[test]
    fn lease_config_validity() {
        assert!(LeaseConfig::default().is_valid());
        let inverted = LeaseConfig {
            min_lease: 60,
            max_lease: 30,
            ..LeaseConfig::default()
        };
        assert!(!inverted.is_valid());
        let zero_min = LeaseConfig {
            min_lease: 0,
            ..LeaseConfig::default()
        };
        assert!(!zero_min.is_valid());
        let key_below_lease = LeaseConfig {
            min_lease: 30,
            max_lease: 3600,
            min_key_lease: 30,
            max_key_lease: 600,
        };
        assert!(!key_below_lease.is_valid());
    }

    #[test]
    fn grant_ttl_bounded_by_lease() {
        let config = TtlConfig {
            min_ttl: 30,
            max_ttl: 7200,
        };
        // Requested TTL clamped into range, then capped by the lease.
        assert_eq!(config.grant_ttl(3600, 120), 120);
        assert_eq!(config.grant_ttl(3600, 1), 30);
        assert_eq!(config.grant_ttl(3600, 86400), 3600);
        // A requested zero falls back to the lease.
        assert_eq!(config.grant_ttl(3600, 0), 3600);
        assert_eq!(config.grant_ttl(86400, 0), 7200);
        // A lease below the TTL floor still caps the grant.
        assert_eq!(config.grant_ttl(10, 0), 10);
        assert_eq!(config.grant_ttl(10, 50), 10);
    }

    #[test]
    fn link_local_addresses_are_not_registrable() {
        let link_local = Ipv6Addr::from_str("fe80::1").unwrap();
        let routable = Ipv6Addr::from_str("2001:db8::1").unwrap();
        assert!(!is_registrable_address(&link_local));
        assert!(!is_registrable_address(&Ipv6Addr::LOCALHOST));
        assert!(is_registrable_address(&routable));
    }
}
