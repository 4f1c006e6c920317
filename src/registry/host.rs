//! Host and service entities of the SRP registry.
//!
//! A [`Host`] owns its [`Service`] records; base services and their
//! sub-type aliases share one [`ServiceDescription`], referenced by index
//! into the owning host's description table. A description never outlives
//! its last referring service: commits prune unreferenced entries.

use crate::error::Error;
use crate::proto::KeyRecord;
use crate::registry::ServiceFlags;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};
use trust_dns_proto::rr::Name;

/// Shared per-instance data: the SRV/TXT resources and timing of one service
/// instance, backing the base service and all of its sub-types.
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    pub(crate) instance_name: Name,
    pub(crate) txt_data: Vec<u8>,
    pub(crate) priority: u16,
    pub(crate) weight: u16,
    pub(crate) port: u16,
    pub(crate) ttl: u32,
    pub(crate) lease: u32,
    pub(crate) key_lease: u32,
    pub(crate) update_time: Instant,
    // Staging flags, only meaningful while a parsed update is in flight.
    pub(crate) touched: bool,
    pub(crate) srv_seen: bool,
    pub(crate) txt_seen: bool,
}

impl ServiceDescription {
    pub(crate) fn new(instance_name: Name, now: Instant) -> Self {
        ServiceDescription {
            instance_name,
            txt_data: Vec::new(),
            priority: 0,
            weight: 0,
            port: 0,
            ttl: 0,
            lease: 0,
            key_lease: 0,
            update_time: now,
            touched: false,
            srv_seen: false,
            txt_seen: false,
        }
    }

    pub fn instance_name(&self) -> &Name {
        &self.instance_name
    }

    pub fn txt_data(&self) -> &[u8] {
        &self.txt_data
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn weight(&self) -> u16 {
        self.weight
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn lease(&self) -> u32 {
        self.lease
    }

    pub fn key_lease(&self) -> u32 {
        self.key_lease
    }

    pub fn expire_time(&self) -> Instant {
        self.update_time + Duration::from_secs(u64::from(self.lease))
    }

    pub fn key_expire_time(&self) -> Instant {
        self.update_time + Duration::from_secs(u64::from(self.key_lease))
    }

    /// Keep at most the record TTL seen so far, requiring it nonzero.
    pub(crate) fn process_ttl(&mut self, ttl: u32) -> Result<(), Error> {
        if ttl == 0 {
            return Err(Error::FormErr);
        }
        if self.ttl == 0 || ttl < self.ttl {
            self.ttl = ttl;
        }
        Ok(())
    }

    pub(crate) fn clear_resources(&mut self) {
        self.txt_data.clear();
        self.priority = 0;
        self.weight = 0;
        self.port = 0;
    }

    pub(crate) fn take_resources_from(&mut self, other: &ServiceDescription) {
        self.txt_data = other.txt_data.clone();
        self.priority = other.priority;
        self.weight = other.weight;
        self.port = other.port;
        self.ttl = other.ttl;
        self.lease = other.lease;
        self.key_lease = other.key_lease;
        self.update_time = other.update_time;
    }
}

/// A base service or a sub-type alias owned by a host.
#[derive(Debug, Clone)]
pub struct Service {
    pub(crate) service_name: Name,
    /// Index of the shared description in the owning host's table.
    pub(crate) description: usize,
    pub(crate) is_sub_type: bool,
    pub(crate) is_deleted: bool,
    pub(crate) is_committed: bool,
    pub(crate) update_time: Instant,
}

impl Service {
    pub fn service_name(&self) -> &Name {
        &self.service_name
    }

    pub fn is_sub_type(&self) -> bool {
        self.is_sub_type
    }

    /// A deleted service retains its name for future use; it is guaranteed
    /// that all services are deleted when the host is.
    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn matches_flags(&self, flags: ServiceFlags) -> bool {
        let type_flag = if self.is_sub_type {
            ServiceFlags::SUB_TYPE
        } else {
            ServiceFlags::BASE_TYPE
        };
        let state_flag = if self.is_deleted {
            ServiceFlags::DELETED
        } else {
            ServiceFlags::ACTIVE
        };
        flags.contains(type_flag) && flags.contains(state_flag)
    }
}

/// A change applied while merging a staged host into an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MergeChange {
    Added { service: Name, instance: Name },
    Updated { service: Name, instance: Name },
    Deleted { service: Name, instance: Name },
}

/// One registered host name, its addresses and key, and the services it
/// hosts. Built as a staged object by the update parser; only commits (and
/// the lease timer) mutate live instances.
#[derive(Debug, Clone)]
pub struct Host {
    pub(crate) full_name: Name,
    pub(crate) addresses: Vec<Ipv6Addr>,
    pub(crate) key_record: Option<KeyRecord>,
    pub(crate) ttl: u32,
    pub(crate) lease: u32,
    pub(crate) key_lease: u32,
    pub(crate) update_time: Instant,
    pub(crate) services: Vec<Service>,
    pub(crate) descriptions: Vec<ServiceDescription>,
}

impl Host {
    pub(crate) fn new(full_name: Name, now: Instant) -> Self {
        Host {
            full_name,
            addresses: Vec::new(),
            key_record: None,
            ttl: 0,
            lease: 0,
            key_lease: 0,
            update_time: now,
            services: Vec::new(),
            descriptions: Vec::new(),
        }
    }

    pub fn full_name(&self) -> &Name {
        &self.full_name
    }

    pub fn addresses(&self) -> &[Ipv6Addr] {
        &self.addresses
    }

    pub fn key_record(&self) -> Option<&KeyRecord> {
        self.key_record.as_ref()
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn lease(&self) -> u32 {
        self.lease
    }

    pub fn key_lease(&self) -> u32 {
        self.key_lease
    }

    /// A host with `lease == 0` has been deleted but retains its name (and
    /// key) until the KEY-LEASE elapses.
    pub fn is_deleted(&self) -> bool {
        self.lease == 0
    }

    pub fn expire_time(&self) -> Instant {
        self.update_time + Duration::from_secs(u64::from(self.lease))
    }

    pub fn key_expire_time(&self) -> Instant {
        self.update_time + Duration::from_secs(u64::from(self.key_lease))
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn description_of(&self, service: &Service) -> &ServiceDescription {
        &self.descriptions[service.description]
    }

    /// Iterate services matching `flags`, with their shared descriptions.
    pub fn services_matching(
        &self,
        flags: ServiceFlags,
    ) -> impl Iterator<Item = (&Service, &ServiceDescription)> {
        self.services
            .iter()
            .filter(move |s| s.matches_flags(flags))
            .map(|s| (s, &self.descriptions[s.description]))
    }

    /// Keep at most the record TTL seen so far, requiring it nonzero.
    pub(crate) fn process_ttl(&mut self, ttl: u32) -> Result<(), Error> {
        if ttl == 0 {
            return Err(Error::FormErr);
        }
        if self.ttl == 0 || ttl < self.ttl {
            self.ttl = ttl;
        }
        Ok(())
    }

    pub(crate) fn add_address(&mut self, address: Ipv6Addr) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }

    pub(crate) fn find_service_index(
        &self,
        service_name: &Name,
        instance_name: &Name,
    ) -> Option<usize> {
        self.services.iter().position(|s| {
            s.service_name == *service_name
                && self.descriptions[s.description].instance_name == *instance_name
        })
    }

    pub fn find_service(&self, service_name: &Name, instance_name: &Name) -> Option<&Service> {
        self.find_service_index(service_name, instance_name)
            .map(|i| &self.services[i])
    }

    pub(crate) fn find_description_index(&self, instance_name: &Name) -> Option<usize> {
        self.descriptions
            .iter()
            .position(|d| d.instance_name == *instance_name)
    }

    /// Whether any live (non-deleted) service uses `instance_name`.
    pub fn has_service_instance(&self, instance_name: &Name) -> bool {
        self.services.iter().any(|s| {
            !s.is_deleted && self.descriptions[s.description].instance_name == *instance_name
        })
    }

    fn ensure_description(&mut self, instance_name: &Name, now: Instant) -> usize {
        if let Some(i) = self.find_description_index(instance_name) {
            return i;
        }
        self.descriptions
            .push(ServiceDescription::new(instance_name.clone(), now));
        self.descriptions.len() - 1
    }

    /// Add a service under this host, reusing the shared description of the
    /// instance if one exists. Returns the service index.
    pub(crate) fn add_service(
        &mut self,
        service_name: Name,
        instance_name: &Name,
        is_sub_type: bool,
        now: Instant,
    ) -> usize {
        if let Some(i) = self.find_service_index(&service_name, instance_name) {
            return i;
        }
        let description = self.ensure_description(instance_name, now);
        self.services.push(Service {
            service_name,
            description,
            is_sub_type,
            is_deleted: false,
            is_committed: false,
            update_time: now,
        });
        self.services.len() - 1
    }

    /// Stage a deleted copy of another host's service, so that removals of
    /// services the client did not re-list are still observable downstream.
    pub(crate) fn add_copy_of_service_as_deleted(
        &mut self,
        service_name: &Name,
        instance_name: &Name,
        is_sub_type: bool,
        now: Instant,
    ) {
        if self.find_service_index(service_name, instance_name).is_some() {
            return;
        }
        let i = self.add_service(service_name.clone(), instance_name, is_sub_type, now);
        self.services[i].is_deleted = true;
    }

    /// Mark every service deleted, returning the (service, instance) names
    /// that were live until now.
    pub(crate) fn mark_all_services_deleted(&mut self, now: Instant) -> Vec<(Name, Name)> {
        let mut newly_deleted = Vec::new();
        for service in &mut self.services {
            if !service.is_deleted {
                service.is_deleted = true;
                service.update_time = now;
                newly_deleted.push((
                    service.service_name.clone(),
                    self.descriptions[service.description].instance_name.clone(),
                ));
            }
        }
        newly_deleted
    }

    pub(crate) fn mark_committed(&mut self) {
        for service in &mut self.services {
            service.is_committed = true;
        }
    }

    /// Remove the service at `index` entirely (name released), pruning its
    /// description if nothing else refers to it.
    pub(crate) fn remove_service(&mut self, index: usize) -> (Name, Name) {
        let service = self.services.remove(index);
        let instance = self.descriptions[service.description].instance_name.clone();
        self.prune_unreferenced_descriptions();
        (service.service_name, instance)
    }

    /// Drop descriptions no service refers to, remapping indices.
    pub(crate) fn prune_unreferenced_descriptions(&mut self) {
        let mut referenced = vec![false; self.descriptions.len()];
        for service in &self.services {
            referenced[service.description] = true;
        }
        if referenced.iter().all(|r| *r) {
            return;
        }
        let mut remap = vec![usize::MAX; self.descriptions.len()];
        let mut kept = Vec::with_capacity(self.descriptions.len());
        for (i, description) in self.descriptions.drain(..).enumerate() {
            if referenced[i] {
                remap[i] = kept.len();
                kept.push(description);
            }
        }
        self.descriptions = kept;
        for service in &mut self.services {
            service.description = remap[service.description];
        }
    }

    /// Merge a staged host into this (existing) one: addresses, key and
    /// timing are replaced wholesale; services merge in by instance name.
    /// Services the update did not mention survive, unless named by an
    /// explicit instance deletion.
    pub(crate) fn merge_services_and_resources_from(
        &mut self,
        staged: Host,
        deleted_instances: &[Name],
    ) -> Vec<MergeChange> {
        let Host {
            addresses,
            key_record,
            ttl,
            lease,
            key_lease,
            update_time,
            services: staged_services,
            descriptions: staged_descriptions,
            ..
        } = staged;

        self.addresses = addresses;
        self.key_record = key_record;
        self.ttl = ttl;
        self.lease = lease;
        self.key_lease = key_lease;
        self.update_time = update_time;

        let mut changes = Vec::new();
        for staged_service in staged_services {
            let staged_description = &staged_descriptions[staged_service.description];
            let instance = staged_description.instance_name.clone();
            match self.find_service_index(&staged_service.service_name, &instance) {
                Some(i) => {
                    let description = self.services[i].description;
                    self.descriptions[description].take_resources_from(staged_description);
                    let was_deleted = self.services[i].is_deleted;
                    self.services[i].is_deleted = staged_service.is_deleted;
                    self.services[i].is_committed = true;
                    self.services[i].update_time = staged_service.update_time;
                    if staged_service.is_deleted {
                        if !was_deleted {
                            changes.push(MergeChange::Deleted {
                                service: staged_service.service_name,
                                instance,
                            });
                        }
                    } else {
                        changes.push(MergeChange::Updated {
                            service: staged_service.service_name,
                            instance,
                        });
                    }
                }
                None => {
                    let description =
                        self.ensure_description(&instance, staged_service.update_time);
                    self.descriptions[description].take_resources_from(staged_description);
                    self.services.push(Service {
                        service_name: staged_service.service_name.clone(),
                        description,
                        is_sub_type: staged_service.is_sub_type,
                        is_deleted: staged_service.is_deleted,
                        is_committed: true,
                        update_time: staged_service.update_time,
                    });
                    if !staged_service.is_deleted {
                        changes.push(MergeChange::Added {
                            service: staged_service.service_name,
                            instance,
                        });
                    }
                }
            }
        }

        // Explicit per-instance deletions cover services the update did not
        // re-declare with a PTR.
        for instance in deleted_instances {
            for i in 0..self.services.len() {
                let description = self.services[i].description;
                if self.descriptions[description].instance_name == *instance
                    && !self.services[i].is_deleted
                {
                    self.services[i].is_deleted = true;
                    self.services[i].update_time = update_time;
                    changes.push(MergeChange::Deleted {
                        service: self.services[i].service_name.clone(),
                        instance: instance.clone(),
                    });
                }
            }
        }

        self.prune_unreferenced_descriptions();
        changes
    }
}
