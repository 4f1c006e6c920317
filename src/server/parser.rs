//! Update parsing: one DNS UPDATE message in, one staged host out.
//!
//! The staged host represents the complete post-update picture of the
//! single name the message targets; the live registry is never touched
//! here. Validation walks the sections in order (header, zone,
//! host description, service discovery, service description, additional)
//! and finishes by verifying the SIG(0) signature against the staged
//! host's KEY.

use crate::config::is_registrable_address;
use crate::error::Error;
use crate::proto::{
    decoder_at, read_name, read_records, read_u16, read_update_lease, sig0, sub_type_base_name,
    KeyRecord, SigRecord, SrvRdata, WireRecord, CLASS_ANY, CLASS_IN, CLASS_NONE, TYPE_KEY,
    TYPE_OPT, TYPE_PTR, TYPE_SIG, TYPE_SOA, TYPE_SRV, TYPE_TXT, TYPE_AAAA,
};
use crate::registry::host::Host;
use std::net::Ipv6Addr;
use std::time::Instant;
use tracing::debug;
use trust_dns_proto::op::{Header, MessageType, OpCode};
use trust_dns_proto::rr::Name;
use trust_dns_proto::serialize::binary::{BinDecodable, BinDecoder};

/// The outcome of parsing one update message.
pub(crate) struct StagedUpdate {
    pub host: Host,
    /// Instance names the update explicitly deleted without re-declaring a
    /// PTR; commits apply these against services the message did not list.
    pub deleted_instances: Vec<Name>,
    pub header: Header,
}

pub(crate) fn parse_update(
    message: &[u8],
    domain: &Name,
    now: Instant,
) -> Result<StagedUpdate, Error> {
    let mut decoder = BinDecoder::new(message);
    let header = Header::read(&mut decoder).map_err(|_| Error::FormErr)?;
    if header.message_type() != MessageType::Query || header.op_code() != OpCode::Update {
        return Err(Error::FormErr);
    }
    if header.query_count() != 1 {
        return Err(Error::FormErr);
    }

    process_zone_section(&mut decoder, domain)?;

    if header.answer_count() != 0 {
        // Prerequisites are not part of SRP.
        return Err(Error::NotImp);
    }

    let update_records = read_records(&mut decoder, header.name_server_count())?;
    let additional_records = read_records(&mut decoder, header.additional_count())?;

    let mut host = process_host_description(message, &update_records, domain, now)?;
    process_service_discovery(message, &update_records, domain, &mut host, now)?;
    let (cleared, host_delete) =
        process_service_description(message, &update_records, &mut host, now)?;
    process_additional_section(message, &additional_records, &header, &mut host)?;

    // "Delete all RRsets" naming the host, with no replacing AAAA, is a
    // full host delete whatever lease the client asked for.
    if host_delete && host.addresses.is_empty() {
        host.lease = 0;
    }

    let deleted_instances = resolve_cleared_instances(&mut host, cleared);
    validate_staged(&host)?;

    Ok(StagedUpdate {
        host,
        deleted_instances,
        header,
    })
}

fn process_zone_section(decoder: &mut BinDecoder<'_>, domain: &Name) -> Result<(), Error> {
    let zone_name = read_name(decoder)?;
    let zone_type = read_u16(decoder)?;
    let zone_class = read_u16(decoder)?;
    if zone_type != TYPE_SOA || zone_class != CLASS_IN {
        return Err(Error::FormErr);
    }
    if zone_name != *domain {
        return Err(Error::NotAuth);
    }
    Ok(())
}

/// Claim the single host name targeted by the update. AAAA and KEY records
/// both claim it; a second distinct name is malformed.
fn claim_host_name(
    host_name: &mut Option<Name>,
    name: &Name,
    domain: &Name,
) -> Result<(), Error> {
    match host_name {
        Some(existing) if *existing == *name => Ok(()),
        Some(_) => Err(Error::FormErr),
        None => {
            if !domain.zone_of(name) || *name == *domain {
                return Err(Error::NotAuth);
            }
            *host_name = Some(name.clone());
            Ok(())
        }
    }
}

fn process_host_description(
    message: &[u8],
    records: &[WireRecord],
    domain: &Name,
    now: Instant,
) -> Result<Host, Error> {
    let mut host_name: Option<Name> = None;
    let mut addresses: Vec<Ipv6Addr> = Vec::new();
    let mut key_record: Option<KeyRecord> = None;
    let mut ttl: u32 = 0;

    for record in records {
        if record.dns_class == CLASS_ANY {
            // Only the "delete all RRsets" form may carry CLASS_ANY; which
            // name it applies to is resolved once all names are known.
            if !record.is_delete_all_rrsets() {
                return Err(Error::FormErr);
            }
            continue;
        }
        match record.record_type {
            TYPE_AAAA => {
                if record.dns_class != CLASS_IN {
                    return Err(Error::FormErr);
                }
                claim_host_name(&mut host_name, &record.name, domain)?;
                if record.ttl == 0 {
                    return Err(Error::FormErr);
                }
                if ttl == 0 || record.ttl < ttl {
                    ttl = record.ttl;
                }
                let rdata = record.rdata(message);
                let octets: [u8; 16] = rdata.try_into().map_err(|_| Error::FormErr)?;
                let address = Ipv6Addr::from(octets);
                if is_registrable_address(&address) {
                    if !addresses.contains(&address) {
                        addresses.push(address);
                    }
                } else {
                    debug!(%address, "ignoring non-registrable host address");
                }
            }
            TYPE_KEY => {
                if record.dns_class != CLASS_IN {
                    return Err(Error::FormErr);
                }
                claim_host_name(&mut host_name, &record.name, domain)?;
                if record.ttl > 0 && (ttl == 0 || record.ttl < ttl) {
                    ttl = record.ttl;
                }
                let parsed = KeyRecord::parse(record.rdata(message))?;
                match &key_record {
                    Some(existing) if *existing != parsed => return Err(Error::NotAuth),
                    _ => key_record = Some(parsed),
                }
            }
            _ => {}
        }
    }

    // A complete host description instruction names the host and its key.
    let host_name = host_name.ok_or(Error::FormErr)?;
    let key_record = key_record.ok_or(Error::FormErr)?;

    let mut host = Host::new(host_name, now);
    host.addresses = addresses;
    host.key_record = Some(key_record);
    host.ttl = ttl;
    Ok(host)
}

fn process_service_discovery(
    message: &[u8],
    records: &[WireRecord],
    domain: &Name,
    host: &mut Host,
    now: Instant,
) -> Result<(), Error> {
    for record in records {
        if record.record_type != TYPE_PTR || record.dns_class == CLASS_ANY {
            continue;
        }
        // CLASS_NONE with TTL 0 is "delete an RR from an RRset": the
        // service is deleted but retains its name.
        let delete = record.dns_class == CLASS_NONE;
        if delete {
            if record.ttl != 0 {
                return Err(Error::FormErr);
            }
        } else if record.dns_class != CLASS_IN {
            return Err(Error::FormErr);
        }

        let service_name = record.name.clone();
        if !domain.zone_of(&service_name) || service_name == *domain {
            return Err(Error::NotAuth);
        }

        let rdata_start = usize::from(record.rdata_offset);
        let mut rdata = decoder_at(message, rdata_start)?;
        let instance_name = read_name(&mut rdata)?;
        if rdata.index() - rdata_start != usize::from(record.rdata_len) {
            return Err(Error::FormErr);
        }
        if !domain.zone_of(&instance_name) {
            return Err(Error::NotAuth);
        }

        let is_sub_type = sub_type_base_name(&service_name).is_some();
        let i = host.add_service(service_name, &instance_name, is_sub_type, now);
        if delete {
            host.services[i].is_deleted = true;
        }
    }

    // Every added sub-type must alias a base declared in this same update.
    for i in 0..host.services.len() {
        let service = &host.services[i];
        if !service.is_sub_type || service.is_deleted {
            continue;
        }
        let base_name = sub_type_base_name(&service.service_name).ok_or(Error::FormErr)?;
        let instance = host.descriptions[service.description].instance_name.clone();
        if host.find_service_index(&base_name, &instance).is_none() {
            return Err(Error::FormErr);
        }
    }
    Ok(())
}

/// Process SRV/TXT additions and "delete all RRsets" markers at instance
/// names. Returns the names the update cleared, for later resolution
/// against re-additions, and whether a delete-all named the host itself.
fn process_service_description(
    message: &[u8],
    records: &[WireRecord],
    host: &mut Host,
    now: Instant,
) -> Result<(Vec<Name>, bool), Error> {
    let mut cleared: Vec<Name> = Vec::new();
    let mut host_delete = false;
    for record in records {
        if record.is_delete_all_rrsets() {
            if record.name == host.full_name {
                // Applied once the additional section has been read, so the
                // delete wins over the requested lease.
                host_delete = true;
                continue;
            }
            if let Some(i) = host.find_description_index(&record.name) {
                let description = &mut host.descriptions[i];
                description.clear_resources();
                description.touched = true;
                description.srv_seen = false;
                description.update_time = now;
            }
            if !cleared.contains(&record.name) {
                cleared.push(record.name.clone());
            }
            continue;
        }
        match record.record_type {
            TYPE_SRV => {
                if record.dns_class != CLASS_IN {
                    return Err(Error::FormErr);
                }
                let srv = SrvRdata::parse(message, record)?;
                let i = host
                    .find_description_index(&record.name)
                    .ok_or(Error::FormErr)?;
                // The instance must ride on the host this update signs for.
                if srv.target != host.full_name {
                    return Err(Error::FormErr);
                }
                let description = &mut host.descriptions[i];
                if description.srv_seen {
                    return Err(Error::FormErr);
                }
                description.process_ttl(record.ttl)?;
                description.priority = srv.priority;
                description.weight = srv.weight;
                description.port = srv.port;
                description.update_time = now;
                description.touched = true;
                description.srv_seen = true;
            }
            TYPE_TXT => {
                if record.dns_class != CLASS_IN {
                    return Err(Error::FormErr);
                }
                let i = host
                    .find_description_index(&record.name)
                    .ok_or(Error::FormErr)?;
                let description = &mut host.descriptions[i];
                if description.txt_seen {
                    return Err(Error::FormErr);
                }
                description.process_ttl(record.ttl)?;
                description.txt_data = record.rdata(message).to_vec();
                description.update_time = now;
                description.touched = true;
                description.txt_seen = true;
            }
            _ => {}
        }
    }
    Ok((cleared, host_delete))
}

fn process_additional_section(
    message: &[u8],
    records: &[WireRecord],
    header: &Header,
    host: &mut Host,
) -> Result<(), Error> {
    // Exactly one OPT carrying the lease option, then the SIG(0) covering
    // everything before it.
    if records.len() != 2 {
        return Err(Error::FormErr);
    }
    let opt = &records[0];
    if opt.record_type != TYPE_OPT || !opt.name.is_root() {
        return Err(Error::FormErr);
    }
    let lease = read_update_lease(opt.rdata(message))?.ok_or(Error::FormErr)?;
    if lease.lease > lease.key_lease {
        return Err(Error::FormErr);
    }
    host.lease = lease.lease;
    host.key_lease = lease.key_lease;

    let sig_record = &records[1];
    if sig_record.record_type != TYPE_SIG {
        return Err(Error::FormErr);
    }
    let sig = SigRecord::parse(message, sig_record)?;
    if sig.signer_name != host.full_name {
        return Err(Error::NotAuth);
    }
    let key = host.key_record.as_ref().ok_or(Error::FormErr)?;
    sig0::verify_signature(key, message, header, &sig)
}

/// Resolve "delete all RRsets" markers at instance names. A cleared
/// instance that was not repopulated by an SRV in the same message is a
/// service deletion: staged services for it are marked deleted, and the
/// name is recorded so commits can delete services the update never listed.
fn resolve_cleared_instances(host: &mut Host, cleared: Vec<Name>) -> Vec<Name> {
    let mut deleted_instances = Vec::new();
    for instance in cleared {
        match host.find_description_index(&instance) {
            Some(i) if host.descriptions[i].srv_seen => {}
            Some(i) => {
                for service in &mut host.services {
                    if service.description == i {
                        service.is_deleted = true;
                    }
                }
                deleted_instances.push(instance);
            }
            None => deleted_instances.push(instance),
        }
    }
    deleted_instances
}

fn validate_staged(host: &Host) -> Result<(), Error> {
    // A registration needs at least one registrable address; a removal
    // (lease 0) does not.
    if host.lease > 0 && host.addresses.is_empty() {
        return Err(Error::FormErr);
    }
    for service in &host.services {
        if !service.is_deleted && !host.descriptions[service.description].srv_seen {
            return Err(Error::FormErr);
        }
    }
    Ok(())
}
