//! The SRP server core.
//!
//! [`Server`] is the single-owner state machine behind the daemon: the
//! lifecycle controller, the update pipeline (parse → verify → grant →
//! handler → commit), the outstanding-update table, and the lease timer.
//! It performs no I/O itself: every entry point takes the current time and
//! leaves its side effects (datagrams to send, handler invocations,
//! registry events) in an action queue the runtime drains. That keeps the
//! whole pipeline serialized, since one task drives it, and directly
//! testable.

pub(crate) mod parser;
pub mod runtime;

use crate::config::{AddressMode, Config, LeaseConfig, TtlConfig, ANYCAST_PORT};
use crate::error::Error;
use crate::proto::{self, UpdateLease};
use crate::registry::host::MergeChange;
use crate::registry::{Host, HostSnapshot, Registry, RegistryEvent};
use parser::StagedUpdate;
use rand::Rng;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use trust_dns_proto::op::{Header, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::Name;
use trust_dns_proto::serialize::binary::{BinDecodable, BinDecoder};

/// The ID of one service update transaction.
pub type UpdateId = u32;

/// SRP server lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Server is disabled.
    Disabled,
    /// Server is enabled and running.
    Running,
    /// Server is enabled but stopped (e.g. its socket could not be bound).
    Stopped,
}

/// External service-update handler, consulted before every commit.
///
/// The handler MUST eventually report back through
/// [`ServerHandle::report_update_result`][runtime::ServerHandle::report_update_result]
/// (or, when driving the core directly,
/// [`Server::handle_service_update_result`]); otherwise the update fails
/// once the handler timeout elapses.
#[async_trait::async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn on_update(&self, id: UpdateId, host: HostSnapshot);
}

pub type DynUpdateHandler = Arc<dyn UpdateHandler>;

/// Side effects produced by a core entry point, drained by the runtime.
#[derive(Debug)]
pub enum Action {
    /// Send a DNS response datagram.
    Send { dst: SocketAddr, payload: Vec<u8> },
    /// Invoke the registered update handler.
    CallHandler { id: UpdateId, host: HostSnapshot },
    /// Advertise the server's address mode and port (network-data
    /// publisher collaborator).
    Publish {
        mode: AddressMode,
        port: u16,
        sequence_number: u8,
    },
    /// Withdraw the advertisement.
    Unpublish,
    /// Registry change notification.
    Event(RegistryEvent),
}

/// Per-RCODE totals of responses sent.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ResponseCounters {
    pub success: u64,
    pub server_failure: u64,
    pub format_error: u64,
    pub name_exists: u64,
    pub refused: u64,
    pub other: u64,
}

/// Everything a commit needs besides the staged host: where to reply, and
/// the config snapshot taken when the update arrived.
#[derive(Debug, Clone)]
struct CommitContext {
    header: Header,
    reply_to: Option<SocketAddr>,
    ttl_config: TtlConfig,
    lease_config: LeaseConfig,
}

/// One in-flight external-handler consultation.
struct UpdateTransaction {
    id: UpdateId,
    expire_time: Instant,
    staged: StagedUpdate,
    context: CommitContext,
}

/// The SRP server core state machine. See the module docs for the driving
/// model.
pub struct Server {
    state: State,
    domain: Name,
    address_mode: AddressMode,
    anycast_sequence_number: u8,
    udp_port_min: u16,
    udp_port_max: u16,
    port: u16,
    auto_enable: bool,
    ttl_config: TtlConfig,
    lease_config: LeaseConfig,
    handler: Option<DynUpdateHandler>,
    handler_timeout: Duration,
    registry: Registry,
    outstanding: Vec<UpdateTransaction>,
    next_update_id: UpdateId,
    counters: ResponseCounters,
    actions: Vec<Action>,
}

impl Server {
    pub fn new(config: &Config) -> Self {
        Server {
            state: State::Disabled,
            domain: config.domain.clone(),
            address_mode: config.address_mode,
            anycast_sequence_number: config.anycast_sequence_number,
            udp_port_min: config.udp_port_min,
            udp_port_max: config.udp_port_max,
            port: 0,
            auto_enable: false,
            ttl_config: config.ttl,
            lease_config: config.lease,
            handler: None,
            handler_timeout: config.handler_timeout,
            registry: Registry::default(),
            outstanding: Vec::new(),
            next_update_id: 0,
            counters: ResponseCounters::default(),
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The port the server listens on, or 0 while not running.
    pub fn port(&self) -> u16 {
        if self.state == State::Running {
            self.port
        } else {
            0
        }
    }

    pub fn domain(&self) -> &Name {
        &self.domain
    }

    pub fn address_mode(&self) -> AddressMode {
        self.address_mode
    }

    pub fn counters(&self) -> &ResponseCounters {
        &self.counters
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn host_snapshots(&self) -> Vec<HostSnapshot> {
        self.registry.hosts().iter().map(HostSnapshot::of).collect()
    }

    pub fn is_auto_enable_mode(&self) -> bool {
        self.auto_enable
    }

    pub fn set_handler(&mut self, handler: DynUpdateHandler) {
        self.handler = Some(handler);
    }

    pub(crate) fn handler(&self) -> Option<DynUpdateHandler> {
        self.handler.clone()
    }

    // Configuration surface. All of these refuse to run while the server is
    // enabled: a running server works from the snapshot it started with.

    pub fn set_domain(&mut self, mut domain: Name) -> Result<(), Error> {
        self.check_disabled()?;
        if domain.is_root() {
            return Err(Error::InvalidArgs("domain must not be the root".into()));
        }
        if !domain.is_fqdn() {
            domain.set_fqdn(true);
        }
        self.domain = domain;
        Ok(())
    }

    pub fn set_address_mode(&mut self, mode: AddressMode) -> Result<(), Error> {
        self.check_disabled()?;
        self.address_mode = mode;
        Ok(())
    }

    pub fn set_anycast_sequence_number(&mut self, sequence_number: u8) -> Result<(), Error> {
        self.check_disabled()?;
        self.anycast_sequence_number = sequence_number;
        Ok(())
    }

    pub fn set_ttl_config(&mut self, ttl_config: TtlConfig) -> Result<(), Error> {
        self.check_disabled()?;
        if !ttl_config.is_valid() {
            return Err(Error::InvalidArgs("TTL range is not valid".into()));
        }
        self.ttl_config = ttl_config;
        Ok(())
    }

    pub fn set_lease_config(&mut self, lease_config: LeaseConfig) -> Result<(), Error> {
        self.check_disabled()?;
        if !lease_config.is_valid() {
            return Err(Error::InvalidArgs(
                "LEASE or KEY-LEASE range is not valid".into(),
            ));
        }
        self.lease_config = lease_config;
        Ok(())
    }

    fn check_disabled(&self) -> Result<(), Error> {
        if self.state == State::Disabled {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }

    // Lifecycle.

    /// Enable or disable the server. Explicit calls clear auto-enable mode.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.auto_enable = false;
        if enabled {
            self.enable();
        } else {
            self.disable();
        }
    }

    /// Let the border-routing collaborator drive enable/disable. Turning the
    /// mode off leaves the current state as it is.
    pub fn set_auto_enable_mode(&mut self, enabled: bool) {
        self.auto_enable = enabled;
    }

    /// Collaborator signal, honored only while auto-enable mode is on.
    pub fn handle_auto_enable_signal(&mut self, enable: bool) {
        if !self.auto_enable {
            return;
        }
        if enable {
            self.enable();
        } else {
            self.disable();
            self.auto_enable = true;
        }
    }

    fn enable(&mut self) {
        if self.state != State::Disabled {
            return;
        }
        self.state = State::Stopped;
        self.start();
    }

    fn start(&mut self) {
        if self.state != State::Stopped {
            return;
        }
        self.select_port();
        self.state = State::Running;
        info!(
            port = self.port,
            mode = ?self.address_mode,
            domain = %self.domain,
            "SRP server started"
        );
        self.actions.push(Action::Publish {
            mode: self.address_mode,
            port: self.port,
            sequence_number: self.anycast_sequence_number,
        });
    }

    /// Move `Running` → `Stopped` without wiping state, e.g. when the
    /// socket is lost or a network precondition no longer holds.
    pub fn stop_running(&mut self) {
        if self.state != State::Running {
            return;
        }
        self.state = State::Stopped;
        warn!("SRP server stopped");
        self.actions.push(Action::Unpublish);
    }

    fn disable(&mut self) {
        if self.state == State::Disabled {
            return;
        }

        // Abort outstanding transactions; clients see ServFail and retry
        // once the server is back.
        let aborted: Vec<UpdateTransaction> = self.outstanding.drain(..).collect();
        for transaction in aborted {
            self.send_response(&transaction.context, ResponseCode::ServFail, None, false);
        }

        // The registry is volatile: removing every host notifies the
        // handler and the event stream so downstream consumers churn too.
        let removed = self.registry.drain();
        for mut host in removed {
            host.lease = 0;
            let host_name = host.full_name().clone();
            for (service, description) in
                host.services_matching(crate::registry::ServiceFlags::ANY_ACTIVE)
            {
                self.actions.push(Action::Event(RegistryEvent::ServiceRemoved {
                    host: host_name.clone(),
                    service: service.service_name().clone(),
                    instance: description.instance_name().clone(),
                    name_retained: false,
                }));
            }
            self.actions.push(Action::Event(RegistryEvent::HostRemoved {
                host: host_name,
                name_retained: false,
            }));
            self.notify_handler(&host);
        }

        self.port = 0;
        self.state = State::Disabled;
        self.actions.push(Action::Unpublish);
        info!("SRP server disabled");
    }

    fn select_port(&mut self) {
        match self.address_mode {
            AddressMode::Anycast => self.port = ANYCAST_PORT,
            AddressMode::Unicast => {
                let mut port = rand::thread_rng().gen_range(self.udp_port_min..=self.udp_port_max);
                // Do not reuse the previous port across restarts: clients may
                // still hold it.
                if port == self.port && self.udp_port_max > self.udp_port_min {
                    port = if port == self.udp_port_max {
                        self.udp_port_min
                    } else {
                        port + 1
                    };
                }
                self.port = port;
            }
        }
    }

    // Update pipeline.

    fn allocate_id(&mut self) -> UpdateId {
        let id = self.next_update_id;
        self.next_update_id = self.next_update_id.wrapping_add(1);
        id
    }

    /// Process one inbound datagram. `src` is `None` for updates arriving
    /// through a replication path; those get no response.
    pub fn handle_message(&mut self, message: &[u8], src: Option<SocketAddr>, now: Instant) {
        if self.state != State::Running {
            return;
        }
        let mut decoder = BinDecoder::new(message);
        let Ok(header) = Header::read(&mut decoder) else {
            return;
        };
        // Never answer responses or foreign opcodes: anything else risks
        // reply loops.
        if header.message_type() != MessageType::Query || header.op_code() != OpCode::Update {
            debug!(id = header.id(), "dropping non-update message");
            return;
        }

        let context = CommitContext {
            header: header.clone(),
            reply_to: src,
            ttl_config: self.ttl_config,
            lease_config: self.lease_config,
        };
        match parser::parse_update(message, &self.domain, now) {
            Ok(staged) => self.handle_update(staged, context, now),
            Err(err) => {
                debug!(id = header.id(), %err, "rejecting update");
                self.send_response(&context, err.response_code(), None, false);
            }
        }
    }

    fn handle_update(&mut self, mut staged: StagedUpdate, context: CommitContext, now: Instant) {
        // One in-flight update per host name; concurrent clients retry.
        if self
            .outstanding
            .iter()
            .any(|t| t.staged.host.full_name() == staged.host.full_name())
        {
            debug!(host = %staged.host.full_name(), "update already outstanding for host");
            self.send_response(&context, ResponseCode::ServFail, None, false);
            return;
        }

        // A host removal carries deleted copies of the live services the
        // client did not re-list, so every removal is observable.
        if staged.host.lease() == 0 {
            if let Some(existing) = self.registry.find(staged.host.full_name()) {
                let live: Vec<(Name, Name, bool)> = existing
                    .services_matching(crate::registry::ServiceFlags::ANY_ACTIVE)
                    .map(|(service, description)| {
                        (
                            service.service_name().clone(),
                            description.instance_name().clone(),
                            service.is_sub_type(),
                        )
                    })
                    .collect();
                for (service_name, instance_name, is_sub_type) in live {
                    staged.host.add_copy_of_service_as_deleted(
                        &service_name,
                        &instance_name,
                        is_sub_type,
                        now,
                    );
                }
            }
        }

        if self.handler.is_none() {
            self.commit_update(Ok(()), staged, context, now);
            return;
        }

        let id = self.allocate_id();
        let snapshot = HostSnapshot::of(&staged.host);
        debug!(id, host = %staged.host.full_name(), "deferring update to handler");
        self.outstanding.push(UpdateTransaction {
            id,
            expire_time: now + self.handler_timeout,
            staged,
            context,
        });
        self.actions.push(Action::CallHandler { id, host: snapshot });
    }

    /// Receive the verdict of the external handler for transaction `id`.
    /// Unknown ids (already timed out, or aborted by a disable) are dropped.
    pub fn handle_service_update_result(
        &mut self,
        id: UpdateId,
        result: Result<(), Error>,
        now: Instant,
    ) {
        let Some(index) = self.outstanding.iter().position(|t| t.id == id) else {
            debug!(id, "no outstanding update matching handler result");
            return;
        };
        let transaction = self.outstanding.remove(index);
        let context = transaction.context.clone();
        self.commit_update(result, transaction.staged, context, now);
    }

    /// Fail every transaction whose handler deadline elapsed.
    pub fn handle_outstanding_updates_timer(&mut self, now: Instant) {
        while let Some(index) = self
            .outstanding
            .iter()
            .position(|t| t.expire_time <= now)
        {
            let transaction = self.outstanding.remove(index);
            warn!(id = transaction.id, "update handler timed out");
            let context = transaction.context.clone();
            self.commit_update(
                Err(Error::ResponseTimeout),
                transaction.staged,
                context,
                now,
            );
        }
    }

    /// Commit or reject a staged update against the live registry.
    fn commit_update(
        &mut self,
        result: Result<(), Error>,
        staged: StagedUpdate,
        context: CommitContext,
        now: Instant,
    ) {
        let StagedUpdate {
            mut host,
            deleted_instances,
            ..
        } = staged;

        if let Err(err) = result {
            // Handler verdicts: NotAuth passes through, anything else (and a
            // timeout) is a server failure. The staged host is discarded.
            let code = match err {
                Error::NotAuth => ResponseCode::NotAuth,
                _ => ResponseCode::ServFail,
            };
            debug!(host = %host.full_name(), %err, "discarding staged update");
            self.send_response(&context, code, None, false);
            return;
        }

        // Grant leases and TTLs from the config snapshot taken at receive
        // time.
        let granted_lease = context.lease_config.grant_lease(host.lease);
        let granted_key_lease = context.lease_config.grant_key_lease(host.key_lease);
        host.lease = granted_lease;
        host.key_lease = granted_key_lease;
        host.ttl = context.ttl_config.grant_ttl(granted_lease, host.ttl);
        host.update_time = now;
        for description in &mut host.descriptions {
            description.ttl = context.ttl_config.grant_ttl(granted_lease, description.ttl);
            description.lease = granted_lease;
            description.key_lease = granted_key_lease;
        }

        if self.registry.has_name_conflicts_with(&host) {
            warn!(host = %host.full_name(), "name conflict with another key owner");
            self.send_response(&context, ResponseCode::NotAuth, None, true);
            return;
        }

        self.reclaim_instances_from_other_hosts(&host);

        let host_name = host.full_name().clone();
        let granted = UpdateLease {
            lease: granted_lease,
            key_lease: granted_key_lease,
        };

        if granted_lease > 0 {
            match self.registry.find_index(&host_name) {
                None => {
                    host.mark_committed();
                    info!(host = %host_name, lease = granted_lease, "host registered");
                    for (service, description) in
                        host.services_matching(crate::registry::ServiceFlags::ANY_ACTIVE)
                    {
                        self.actions.push(Action::Event(RegistryEvent::ServiceAdded {
                            host: host_name.clone(),
                            service: service.service_name().clone(),
                            instance: description.instance_name().clone(),
                        }));
                    }
                    self.actions.push(Action::Event(RegistryEvent::HostAdded {
                        host: host_name.clone(),
                    }));
                    self.registry.insert(host);
                }
                Some(index) => {
                    info!(host = %host_name, lease = granted_lease, "host updated");
                    let changes = self
                        .registry
                        .host_mut(index)
                        .merge_services_and_resources_from(host, &deleted_instances);
                    for change in changes {
                        self.actions.push(Action::Event(match change {
                            MergeChange::Added { service, instance } => {
                                RegistryEvent::ServiceAdded {
                                    host: host_name.clone(),
                                    service,
                                    instance,
                                }
                            }
                            MergeChange::Updated { service, instance } => {
                                RegistryEvent::ServiceUpdated {
                                    host: host_name.clone(),
                                    service,
                                    instance,
                                }
                            }
                            MergeChange::Deleted { service, instance } => {
                                RegistryEvent::ServiceRemoved {
                                    host: host_name.clone(),
                                    service,
                                    instance,
                                    name_retained: true,
                                }
                            }
                        }));
                    }
                    self.actions.push(Action::Event(RegistryEvent::HostUpdated {
                        host: host_name.clone(),
                    }));
                }
            }
        } else if granted_key_lease == 0 {
            // LEASE and KEY-LEASE both zero: release the name entirely.
            if let Some(removed) = self.registry.remove(&host_name) {
                info!(host = %host_name, "host removed, name released");
                for (service, description) in
                    removed.services_matching(crate::registry::ServiceFlags::ANY)
                {
                    self.actions.push(Action::Event(RegistryEvent::ServiceRemoved {
                        host: host_name.clone(),
                        service: service.service_name().clone(),
                        instance: description.instance_name().clone(),
                        name_retained: false,
                    }));
                }
                self.actions.push(Action::Event(RegistryEvent::HostRemoved {
                    host: host_name.clone(),
                    name_retained: false,
                }));
            }
        } else if let Some(index) = self.registry.find_index(&host_name) {
            // Delete but retain the name until the key lease elapses.
            info!(host = %host_name, key_lease = granted_key_lease, "host deleted, name retained");
            let existing = self.registry.host_mut(index);
            existing.lease = 0;
            existing.key_lease = granted_key_lease;
            existing.key_record = host.key_record.take();
            existing.update_time = now;
            for description in &mut existing.descriptions {
                description.lease = 0;
                description.key_lease = granted_key_lease;
                description.update_time = now;
            }
            let newly_deleted = existing.mark_all_services_deleted(now);
            for (service, instance) in newly_deleted {
                self.actions.push(Action::Event(RegistryEvent::ServiceRemoved {
                    host: host_name.clone(),
                    service,
                    instance,
                    name_retained: true,
                }));
            }
            self.actions.push(Action::Event(RegistryEvent::HostRemoved {
                host: host_name.clone(),
                name_retained: true,
            }));
        } else {
            // Removing a host that was never registered succeeds.
            debug!(host = %host_name, "removal of unknown host");
        }

        self.send_response(&context, ResponseCode::NoError, Some(granted), false);
    }

    /// Move service instances owned by other hosts of the same key to the
    /// updating host: the conflict check has already rejected foreign keys.
    fn reclaim_instances_from_other_hosts(&mut self, staged: &Host) {
        let instances: Vec<Name> = staged
            .services()
            .iter()
            .map(|s| staged.description_of(s).instance_name().clone())
            .collect();
        let staged_name = staged.full_name().clone();

        for host_index in 0..self.registry.len() {
            if self.registry.hosts()[host_index].full_name() == &staged_name {
                continue;
            }
            for instance in &instances {
                loop {
                    let host = self.registry.host_mut(host_index);
                    let Some(service_index) = host
                        .services()
                        .iter()
                        .position(|s| host.description_of(s).instance_name() == instance)
                    else {
                        break;
                    };
                    let (service, instance_name) = host.remove_service(service_index);
                    let host_name = host.full_name().clone();
                    info!(
                        host = %host_name,
                        instance = %instance_name,
                        "service instance moved to updating host"
                    );
                    self.actions.push(Action::Event(RegistryEvent::ServiceRemoved {
                        host: host_name,
                        service,
                        instance: instance_name,
                        name_retained: false,
                    }));
                }
            }
        }
    }

    fn notify_handler(&mut self, host: &Host) {
        if self.handler.is_none() {
            return;
        }
        let id = self.allocate_id();
        // Removals are not awaited: the registry moves on regardless of the
        // handler's verdict.
        self.actions.push(Action::CallHandler {
            id,
            host: HostSnapshot::of(host),
        });
    }

    fn send_response(
        &mut self,
        context: &CommitContext,
        code: ResponseCode,
        lease: Option<UpdateLease>,
        name_conflict: bool,
    ) {
        let Some(dst) = context.reply_to else {
            return;
        };
        match proto::encode_response(&context.header, code, lease) {
            Ok(payload) => {
                self.actions.push(Action::Send { dst, payload });
                self.record_response(code, name_conflict);
            }
            Err(err) => warn!(%err, "failed to encode response"),
        }
    }

    fn record_response(&mut self, code: ResponseCode, name_conflict: bool) {
        if name_conflict {
            self.counters.name_exists += 1;
            return;
        }
        match code {
            ResponseCode::NoError => self.counters.success += 1,
            ResponseCode::ServFail => self.counters.server_failure += 1,
            ResponseCode::FormErr => self.counters.format_error += 1,
            ResponseCode::Refused => self.counters.refused += 1,
            _ => self.counters.other += 1,
        }
    }

    // Lease timer.

    /// Sweep expired leases. Hosts are processed in registry insertion
    /// order, services in list order; a key lease is only acted on after a
    /// simultaneous lease expiry was observed.
    pub fn handle_lease_timer(&mut self, now: Instant) {
        let mut events: Vec<RegistryEvent> = Vec::new();
        let mut removed_hosts: Vec<Host> = Vec::new();

        let mut i = 0;
        while i < self.registry.len() {
            {
                let host = self.registry.host_mut(i);
                if !host.is_deleted() && host.expire_time() <= now {
                    let host_name = host.full_name().clone();
                    info!(host = %host_name, "host LEASE expired");
                    for (service, instance) in host.mark_all_services_deleted(now) {
                        events.push(RegistryEvent::ServiceLeaseExpired {
                            host: host_name.clone(),
                            service,
                            instance,
                        });
                    }
                    host.lease = 0;
                    events.push(RegistryEvent::HostLeaseExpired { host: host_name });
                }
            }

            let key_expired = {
                let host = &self.registry.hosts()[i];
                host.is_deleted() && host.key_expire_time() <= now
            };
            if key_expired {
                let host = self.registry.remove_at(i);
                let host_name = host.full_name().clone();
                info!(host = %host_name, "host KEY-LEASE expired, name released");
                for (service, description) in
                    host.services_matching(crate::registry::ServiceFlags::ANY)
                {
                    events.push(RegistryEvent::ServiceKeyLeaseExpired {
                        host: host_name.clone(),
                        service: service.service_name().clone(),
                        instance: description.instance_name().clone(),
                    });
                }
                events.push(RegistryEvent::HostKeyLeaseExpired { host: host_name });
                removed_hosts.push(host);
                continue;
            }

            {
                let host = self.registry.host_mut(i);
                let host_name = host.full_name().clone();
                let host_deleted = host.is_deleted();
                let mut j = 0;
                while j < host.services.len() {
                    let description = host.services[j].description;
                    let lease_expired = !host_deleted
                        && !host.services[j].is_deleted
                        && host.descriptions[description].expire_time() <= now;
                    if lease_expired {
                        host.services[j].is_deleted = true;
                        host.services[j].update_time = now;
                        events.push(RegistryEvent::ServiceLeaseExpired {
                            host: host_name.clone(),
                            service: host.services[j].service_name.clone(),
                            instance: host.descriptions[description].instance_name.clone(),
                        });
                    }
                    let key_expired = host.services[j].is_deleted
                        && host.descriptions[description].key_expire_time() <= now;
                    if key_expired {
                        let (service, instance) = host.remove_service(j);
                        events.push(RegistryEvent::ServiceKeyLeaseExpired {
                            host: host_name.clone(),
                            service,
                            instance,
                        });
                        continue;
                    }
                    j += 1;
                }
            }
            i += 1;
        }

        for event in events {
            self.actions.push(Action::Event(event));
        }
        for host in removed_hosts {
            self.notify_handler(&host);
        }
    }

    /// The next instant the lease timer must fire, if anything is pending.
    pub fn next_lease_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut consider = |t: Instant| {
            deadline = Some(match deadline {
                Some(existing) if existing <= t => existing,
                _ => t,
            });
        };
        for host in self.registry.hosts() {
            consider(host.key_expire_time());
            if !host.is_deleted() {
                consider(host.expire_time());
            }
            for service in host.services() {
                let description = host.description_of(service);
                if service.is_deleted() {
                    consider(description.key_expire_time());
                } else if !host.is_deleted() {
                    consider(description.expire_time());
                }
            }
        }
        deadline
    }

    /// The earliest outstanding-update deadline, if any are in flight.
    pub fn next_update_deadline(&self) -> Option<Instant> {
        self.outstanding.iter().map(|t| t.expire_time).min()
    }

    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}
