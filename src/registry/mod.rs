//! The in-memory SRP registry: the ordered set of registered hosts.
//!
//! The registry is owned by the server core and mutated only by the commit
//! engine and the lease timer. Everything here is volatile; no state
//! survives a restart.

pub mod host;

use serde::Serialize;
use std::net::Ipv6Addr;
use trust_dns_proto::rr::Name;

pub use host::{Host, Service, ServiceDescription};

/// Filter for iterating services: base vs. sub-type, active vs. deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceFlags(u8);

impl ServiceFlags {
    /// Include base services (not a sub-type).
    pub const BASE_TYPE: ServiceFlags = ServiceFlags(1 << 0);
    /// Include sub-type services.
    pub const SUB_TYPE: ServiceFlags = ServiceFlags(1 << 1);
    /// Include active (not deleted) services.
    pub const ACTIVE: ServiceFlags = ServiceFlags(1 << 2);
    /// Include deleted services.
    pub const DELETED: ServiceFlags = ServiceFlags(1 << 3);
    /// Any service, of any type and state.
    pub const ANY: ServiceFlags = ServiceFlags(0b1111);
    /// Any service that is not deleted.
    pub const ANY_ACTIVE: ServiceFlags =
        ServiceFlags(Self::BASE_TYPE.0 | Self::SUB_TYPE.0 | Self::ACTIVE.0);

    pub fn contains(self, other: ServiceFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for ServiceFlags {
    type Output = ServiceFlags;

    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

/// Registry change notifications, consumed by the companion DNS-SD
/// responder (and anything else watching the event stream).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    HostAdded {
        host: Name,
    },
    HostUpdated {
        host: Name,
    },
    /// `name_retained` is true while the key lease still reserves the name.
    HostRemoved {
        host: Name,
        name_retained: bool,
    },
    ServiceAdded {
        host: Name,
        service: Name,
        instance: Name,
    },
    ServiceUpdated {
        host: Name,
        service: Name,
        instance: Name,
    },
    ServiceRemoved {
        host: Name,
        service: Name,
        instance: Name,
        name_retained: bool,
    },
    HostLeaseExpired {
        host: Name,
    },
    HostKeyLeaseExpired {
        host: Name,
    },
    ServiceLeaseExpired {
        host: Name,
        service: Name,
        instance: Name,
    },
    ServiceKeyLeaseExpired {
        host: Name,
        service: Name,
        instance: Name,
    },
}

/// The ordered collection of registered hosts. Host names are unique under
/// case-insensitive DNS comparison; insertion order is preserved and governs
/// expiry processing order.
#[derive(Debug, Default)]
pub struct Registry {
    hosts: Vec<Host>,
}

impl Registry {
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn find(&self, full_name: &Name) -> Option<&Host> {
        self.hosts.iter().find(|h| h.full_name == *full_name)
    }

    pub(crate) fn find_index(&self, full_name: &Name) -> Option<usize> {
        self.hosts.iter().position(|h| h.full_name == *full_name)
    }

    pub(crate) fn host_mut(&mut self, index: usize) -> &mut Host {
        &mut self.hosts[index]
    }

    pub(crate) fn insert(&mut self, host: Host) {
        debug_assert!(self.find(&host.full_name).is_none());
        self.hosts.push(host);
    }

    pub(crate) fn remove(&mut self, full_name: &Name) -> Option<Host> {
        self.find_index(full_name).map(|i| self.hosts.remove(i))
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Host {
        self.hosts.remove(index)
    }

    pub(crate) fn drain(&mut self) -> Vec<Host> {
        std::mem::take(&mut self.hosts)
    }

    /// Whether committing `staged` would collide with a name another key
    /// owns: the host name itself, or any service instance name of the
    /// staged host that a different host holds live under a different key.
    pub fn has_name_conflicts_with(&self, staged: &Host) -> bool {
        for host in &self.hosts {
            if host.full_name == staged.full_name {
                if host.key_record != staged.key_record {
                    return true;
                }
                continue;
            }
            if host.key_record == staged.key_record {
                continue;
            }
            for service in staged.services() {
                let instance = staged.description_of(service).instance_name();
                if host.has_service_instance(instance) {
                    return true;
                }
            }
        }
        false
    }
}

/// A serializable copy of one host, handed to the update handler and served
/// by the observability API.
#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub full_name: String,
    pub addresses: Vec<Ipv6Addr>,
    pub deleted: bool,
    pub ttl: u32,
    pub lease: u32,
    pub key_lease: u32,
    pub services: Vec<ServiceSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub service_name: String,
    pub instance_name: String,
    pub sub_type: bool,
    pub deleted: bool,
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub ttl: u32,
    /// Raw TXT RDATA, base64-encoded.
    pub txt_data: String,
}

impl HostSnapshot {
    pub fn of(host: &Host) -> Self {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        HostSnapshot {
            full_name: host.full_name().to_string(),
            addresses: host.addresses().to_vec(),
            deleted: host.is_deleted(),
            ttl: host.ttl(),
            lease: host.lease(),
            key_lease: host.key_lease(),
            services: host
                .services_matching(ServiceFlags::ANY)
                .map(|(service, description)| ServiceSnapshot {
                    service_name: service.service_name().to_string(),
                    instance_name: description.instance_name().to_string(),
                    sub_type: service.is_sub_type(),
                    deleted: service.is_deleted(),
                    priority: description.priority(),
                    weight: description.weight(),
                    port: description.port(),
                    ttl: description.ttl(),
                    txt_data: STANDARD.encode(description.txt_data()),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::KeyRecord;
    use std::str::FromStr;
    use std::time::Instant;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn key(fill: u8) -> KeyRecord {
        KeyRecord {
            flags: 0,
            protocol: 3,
            algorithm: 13,
            public_key: [fill; 64],
        }
    }

    fn test_host(full_name: &str, key_fill: u8) -> Host {
        let mut host = Host::new(name(full_name), Instant::now());
        host.key_record = Some(key(key_fill));
        host.lease = 3600;
        host.key_lease = 7200;
        host
    }

    #[test]
    fn find_is_case_insensitive_and_case_preserving() {
        let mut registry = Registry::default();
        registry.insert(test_host("Alpha.default.service.arpa.", 1));

        let found = registry.find(&name("alpha.DEFAULT.service.arpa.")).unwrap();
        assert_eq!(found.full_name().to_string(), "Alpha.default.service.arpa.");
    }

    #[test]
    fn conflict_same_name_different_key() {
        let mut registry = Registry::default();
        registry.insert(test_host("alpha.default.service.arpa.", 1));

        let same_key = test_host("alpha.default.service.arpa.", 1);
        assert!(!registry.has_name_conflicts_with(&same_key));

        let other_key = test_host("alpha.default.service.arpa.", 2);
        assert!(registry.has_name_conflicts_with(&other_key));
    }

    #[test]
    fn conflict_instance_owned_by_other_key() {
        let now = Instant::now();
        let mut owner = test_host("alpha.default.service.arpa.", 1);
        let instance = name("inst1._foo._tcp.default.service.arpa.");
        owner.add_service(name("_foo._tcp.default.service.arpa."), &instance, false, now);

        let mut registry = Registry::default();
        registry.insert(owner);

        let mut rival = test_host("beta.default.service.arpa.", 2);
        rival.add_service(name("_foo._tcp.default.service.arpa."), &instance, false, now);
        assert!(registry.has_name_conflicts_with(&rival));

        // The same key owner may move the instance between its hosts.
        let mut sibling = test_host("gamma.default.service.arpa.", 1);
        sibling.add_service(name("_foo._tcp.default.service.arpa."), &instance, false, now);
        assert!(!registry.has_name_conflicts_with(&sibling));
    }

    #[test]
    fn deleted_instances_do_not_conflict() {
        let now = Instant::now();
        let mut owner = test_host("alpha.default.service.arpa.", 1);
        let instance = name("inst1._foo._tcp.default.service.arpa.");
        let i = owner.add_service(name("_foo._tcp.default.service.arpa."), &instance, false, now);
        owner.services[i].is_deleted = true;

        let mut registry = Registry::default();
        registry.insert(owner);

        let mut rival = test_host("beta.default.service.arpa.", 2);
        rival.add_service(name("_foo._tcp.default.service.arpa."), &instance, false, now);
        assert!(!registry.has_name_conflicts_with(&rival));
    }

    #[test]
    fn sub_types_share_one_description() {
        let now = Instant::now();
        let mut host = test_host("alpha.default.service.arpa.", 1);
        let instance = name("inst1._foo._tcp.default.service.arpa.");
        host.add_service(name("_foo._tcp.default.service.arpa."), &instance, false, now);
        host.add_service(
            name("_bar._sub._foo._tcp.default.service.arpa."),
            &instance,
            true,
            now,
        );

        assert_eq!(host.services().len(), 2);
        assert_eq!(host.descriptions.len(), 1);

        let base = host
            .find_service(&name("_foo._tcp.default.service.arpa."), &instance)
            .unwrap();
        let sub = host
            .find_service(&name("_bar._sub._foo._tcp.default.service.arpa."), &instance)
            .unwrap();
        assert_eq!(base.description, sub.description);
    }

    #[test]
    fn removing_last_service_prunes_description() {
        let now = Instant::now();
        let mut host = test_host("alpha.default.service.arpa.", 1);
        let inst1 = name("inst1._foo._tcp.default.service.arpa.");
        let inst2 = name("inst2._foo._tcp.default.service.arpa.");
        host.add_service(name("_foo._tcp.default.service.arpa."), &inst1, false, now);
        host.add_service(name("_foo._tcp.default.service.arpa."), &inst2, false, now);

        host.remove_service(0);
        assert_eq!(host.services().len(), 1);
        assert_eq!(host.descriptions.len(), 1);
        // The surviving service still points at its (re-indexed) description.
        let survivor = &host.services()[0];
        assert_eq!(
            host.description_of(survivor).instance_name(),
            &inst2
        );
    }

    #[test]
    fn service_flags_filtering() {
        let now = Instant::now();
        let mut host = test_host("alpha.default.service.arpa.", 1);
        let instance = name("inst1._foo._tcp.default.service.arpa.");
        host.add_service(name("_foo._tcp.default.service.arpa."), &instance, false, now);
        let sub = host.add_service(
            name("_bar._sub._foo._tcp.default.service.arpa."),
            &instance,
            true,
            now,
        );
        host.services[sub].is_deleted = true;

        let base_active: Vec<_> = host
            .services_matching(ServiceFlags::BASE_TYPE | ServiceFlags::ACTIVE)
            .collect();
        assert_eq!(base_active.len(), 1);

        let deleted: Vec<_> = host
            .services_matching(
                ServiceFlags::BASE_TYPE | ServiceFlags::SUB_TYPE | ServiceFlags::DELETED,
            )
            .collect();
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].0.is_sub_type());

        assert_eq!(host.services_matching(ServiceFlags::ANY).count(), 2);
    }
}
