//! SRP-specific DNS wire helpers.
//!
//! The generic codec primitives (name decompression, header encoding) come
//! from `trust-dns-proto`; this module layers the record handling SRP needs
//! on top: a positional record walker that remembers where each RDATA lives
//! in the raw message (required to reconstruct SIG(0) coverage), views of
//! the KEY/SIG/SRV RDATA layouts, the EDNS UPDATE-LEASE option, and the
//! update-response encoding.

pub mod sig0;

use crate::error::Error;
use trust_dns_proto::op::{Header, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::Name;
use trust_dns_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncodable, BinEncoder};

/// EDNS option code of the SRP UPDATE-LEASE option.
pub const UPDATE_LEASE_OPT_CODE: u16 = 2;

/// DNSSEC algorithm number for ECDSA P-256 with SHA-256.
pub const ALGORITHM_ECDSA_P256_SHA256: u8 = 13;

/// Protocol field value required in KEY records (RFC 2535 §3.1.3).
pub const KEY_PROTOCOL_DNSSEC: u8 = 3;

pub const CLASS_IN: u16 = 1;
pub const CLASS_NONE: u16 = 254;
pub const CLASS_ANY: u16 = 255;

// Record types handled by the update parser. KEY and SIG are spelled out
// here because they are meta types the resolver-oriented codec does not
// model outside of its DNSSEC feature.
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_SIG: u16 = 24;
pub const TYPE_KEY: u16 = 25;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_OPT: u16 = 41;
pub const TYPE_ANY: u16 = 255;

/// Advertised maximum UDP payload, carried in the CLASS field of response
/// OPT records.
const EDNS_UDP_PAYLOAD: u16 = 1232;

/// Length of a public key in an ECDSA-P256 KEY record: the uncompressed
/// curve point without the SEC1 tag byte.
pub const ECDSA_P256_PUBLIC_KEY_LEN: usize = 64;

/// Length of an ECDSA-P256 signature (`r || s`).
pub const ECDSA_P256_SIGNATURE_LEN: usize = 64;

const KEY_RDATA_FIXED_LEN: usize = 4;

/// A decoder over `message`, positioned at `offset`.
///
/// Name decompression needs the decoder to span the whole message so that
/// compression pointers resolve; re-visiting a record therefore means
/// skipping up to its recorded offset.
pub(crate) fn decoder_at(message: &[u8], offset: usize) -> Result<BinDecoder<'_>, Error> {
    let mut decoder = BinDecoder::new(message);
    if offset > 0 {
        decoder.read_slice(offset).map_err(|_| Error::FormErr)?;
    }
    Ok(decoder)
}

pub(crate) fn read_u8(decoder: &mut BinDecoder<'_>) -> Result<u8, Error> {
    Ok(decoder.read_u8().map_err(|_| Error::FormErr)?.unverified())
}

pub(crate) fn read_u16(decoder: &mut BinDecoder<'_>) -> Result<u16, Error> {
    Ok(decoder.read_u16().map_err(|_| Error::FormErr)?.unverified())
}

pub(crate) fn read_u32(decoder: &mut BinDecoder<'_>) -> Result<u32, Error> {
    Ok(decoder.read_u32().map_err(|_| Error::FormErr)?.unverified())
}

pub(crate) fn read_name(decoder: &mut BinDecoder<'_>) -> Result<Name, Error> {
    Name::read(decoder).map_err(|_| Error::FormErr)
}

/// One resource record read from an update message, together with the
/// positions needed to re-visit its RDATA.
#[derive(Debug, Clone)]
pub struct WireRecord {
    pub name: Name,
    pub record_type: u16,
    pub dns_class: u16,
    pub ttl: u32,
    /// Offset of the owner name within the message.
    pub name_offset: u16,
    /// Offset of the RDATA within the message.
    pub rdata_offset: u16,
    pub rdata_len: u16,
}

impl WireRecord {
    /// Read the record at the decoder's position, leaving the decoder at the
    /// start of the next record.
    pub fn read(decoder: &mut BinDecoder<'_>) -> Result<Self, Error> {
        let name_offset = u16::try_from(decoder.index()).map_err(|_| Error::FormErr)?;
        let name = read_name(decoder)?;
        let record_type = read_u16(decoder)?;
        let dns_class = read_u16(decoder)?;
        let ttl = read_u32(decoder)?;
        let rdata_len = read_u16(decoder)?;
        let rdata_offset = u16::try_from(decoder.index()).map_err(|_| Error::FormErr)?;
        decoder
            .read_slice(usize::from(rdata_len))
            .map_err(|_| Error::FormErr)?;
        Ok(WireRecord {
            name,
            record_type,
            dns_class,
            ttl,
            name_offset,
            rdata_offset,
            rdata_len,
        })
    }

    pub fn rdata<'a>(&self, message: &'a [u8]) -> &'a [u8] {
        let start = usize::from(self.rdata_offset);
        &message[start..start + usize::from(self.rdata_len)]
    }

    /// "Delete all RRsets from a name" per RFC 2136 §2.5.3: CLASS=ANY,
    /// TYPE=ANY, TTL=0, empty RDATA.
    pub fn is_delete_all_rrsets(&self) -> bool {
        self.dns_class == CLASS_ANY
            && self.record_type == TYPE_ANY
            && self.ttl == 0
            && self.rdata_len == 0
    }
}

/// Read `count` records starting at the decoder's position.
pub(crate) fn read_records(
    decoder: &mut BinDecoder<'_>,
    count: u16,
) -> Result<Vec<WireRecord>, Error> {
    let mut records = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        records.push(WireRecord::read(decoder)?);
    }
    Ok(records)
}

/// An ECDSA-P256 KEY RDATA (RFC 2535 layout, restricted per SRP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: u8,
    pub public_key: [u8; ECDSA_P256_PUBLIC_KEY_LEN],
}

impl KeyRecord {
    pub fn parse(rdata: &[u8]) -> Result<Self, Error> {
        if rdata.len() < KEY_RDATA_FIXED_LEN {
            return Err(Error::FormErr);
        }
        let flags = u16::from_be_bytes([rdata[0], rdata[1]]);
        let protocol = rdata[2];
        let algorithm = rdata[3];
        if algorithm != ALGORITHM_ECDSA_P256_SHA256 {
            return Err(Error::NotImp);
        }
        if protocol != KEY_PROTOCOL_DNSSEC
            || rdata.len() != KEY_RDATA_FIXED_LEN + ECDSA_P256_PUBLIC_KEY_LEN
        {
            return Err(Error::FormErr);
        }
        let mut public_key = [0u8; ECDSA_P256_PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&rdata[KEY_RDATA_FIXED_LEN..]);
        Ok(KeyRecord {
            flags,
            protocol,
            algorithm,
            public_key,
        })
    }
}

/// A SIG(0) RDATA view, plus the message positions needed to reconstruct
/// the signature coverage.
#[derive(Debug, Clone)]
pub struct SigRecord {
    pub type_covered: u16,
    pub algorithm: u8,
    pub labels: u8,
    pub original_ttl: u32,
    pub expiration: u32,
    pub inception: u32,
    pub key_tag: u16,
    pub signer_name: Name,
    pub signature: Vec<u8>,
    /// Offset of the SIG record's owner name within the message.
    pub record_offset: u16,
    /// Offset of the SIG RDATA within the message.
    pub rdata_offset: u16,
    /// Length of the RDATA up to, and excluding, the signature field.
    pub covered_rdata_len: u16,
}

impl SigRecord {
    pub fn parse(message: &[u8], record: &WireRecord) -> Result<Self, Error> {
        let rdata_start = usize::from(record.rdata_offset);
        let mut decoder = decoder_at(message, rdata_start)?;
        let type_covered = read_u16(&mut decoder)?;
        let algorithm = read_u8(&mut decoder)?;
        let labels = read_u8(&mut decoder)?;
        let original_ttl = read_u32(&mut decoder)?;
        let expiration = read_u32(&mut decoder)?;
        let inception = read_u32(&mut decoder)?;
        let key_tag = read_u16(&mut decoder)?;
        let signer_name = read_name(&mut decoder)?;
        let covered = decoder.index() - rdata_start;
        let rdata_len = usize::from(record.rdata_len);
        if covered > rdata_len {
            return Err(Error::FormErr);
        }
        let signature = message[rdata_start + covered..rdata_start + rdata_len].to_vec();
        Ok(SigRecord {
            type_covered,
            algorithm,
            labels,
            original_ttl,
            expiration,
            inception,
            key_tag,
            signer_name,
            signature,
            record_offset: record.name_offset,
            rdata_offset: record.rdata_offset,
            covered_rdata_len: u16::try_from(covered).map_err(|_| Error::FormErr)?,
        })
    }
}

/// An SRV RDATA view.
#[derive(Debug, Clone)]
pub struct SrvRdata {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: Name,
}

impl SrvRdata {
    pub fn parse(message: &[u8], record: &WireRecord) -> Result<Self, Error> {
        let rdata_start = usize::from(record.rdata_offset);
        let mut decoder = decoder_at(message, rdata_start)?;
        let priority = read_u16(&mut decoder)?;
        let weight = read_u16(&mut decoder)?;
        let port = read_u16(&mut decoder)?;
        let target = read_name(&mut decoder)?;
        if decoder.index() - rdata_start != usize::from(record.rdata_len) {
            return Err(Error::FormErr);
        }
        Ok(SrvRdata {
            priority,
            weight,
            port,
            target,
        })
    }
}

/// The EDNS UPDATE-LEASE option: requested (or granted) LEASE and KEY-LEASE
/// intervals in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateLease {
    pub lease: u32,
    pub key_lease: u32,
}

/// Extract the UPDATE-LEASE option from OPT RDATA. The short form of the
/// option carries only the LEASE interval; KEY-LEASE then defaults to it.
pub fn read_update_lease(opt_rdata: &[u8]) -> Result<Option<UpdateLease>, Error> {
    let mut rest = opt_rdata;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::FormErr);
        }
        let code = u16::from_be_bytes([rest[0], rest[1]]);
        let len = usize::from(u16::from_be_bytes([rest[2], rest[3]]));
        rest = &rest[4..];
        if rest.len() < len {
            return Err(Error::FormErr);
        }
        let data = &rest[..len];
        rest = &rest[len..];
        if code != UPDATE_LEASE_OPT_CODE {
            continue;
        }
        return match data.len() {
            4 => {
                let lease = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                Ok(Some(UpdateLease {
                    lease,
                    key_lease: lease,
                }))
            }
            8 => Ok(Some(UpdateLease {
                lease: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                key_lease: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            })),
            _ => Err(Error::FormErr),
        };
    }
    Ok(None)
}

/// Encode a response to an update, echoing the request id. On success the
/// granted LEASE/KEY-LEASE pair is carried back in an OPT record.
pub fn encode_response(
    request: &Header,
    code: ResponseCode,
    lease: Option<UpdateLease>,
) -> Result<Vec<u8>, Error> {
    let mut header = Header::new();
    header.set_id(request.id());
    header.set_message_type(MessageType::Response);
    header.set_op_code(OpCode::Update);
    header.set_response_code(code);
    if lease.is_some() {
        header.set_additional_count(1);
    }

    let mut buf = Vec::with_capacity(64);
    {
        let mut encoder = BinEncoder::new(&mut buf);
        header.emit(&mut encoder)?;
        if let Some(lease) = lease {
            encoder.emit(0)?; // root owner name
            encoder.emit_u16(TYPE_OPT)?;
            encoder.emit_u16(EDNS_UDP_PAYLOAD)?;
            encoder.emit_u32(0)?; // extended RCODE and flags
            encoder.emit_u16(12)?; // RDLEN: one 8-byte option
            encoder.emit_u16(UPDATE_LEASE_OPT_CODE)?;
            encoder.emit_u16(8)?;
            encoder.emit_u32(lease.lease)?;
            encoder.emit_u32(lease.key_lease)?;
        }
    }
    Ok(buf)
}

/// For a `<sub>._sub.<base>` service name, the base service name.
pub fn sub_type_base_name(service_name: &Name) -> Option<Name> {
    let num_labels = usize::from(service_name.num_labels());
    if num_labels < 3 {
        return None;
    }
    let mut labels = service_name.iter();
    let _sub_label = labels.next()?;
    let marker = labels.next()?;
    if marker.eq_ignore_ascii_case(b"_sub") {
        Some(service_name.trim_to(num_labels - 2))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn update_lease_option_both_forms() {
        // Long form: LEASE and KEY-LEASE.
        let rdata = [0, 2, 0, 8, 0, 0, 0x0e, 0x10, 0, 0, 0x1c, 0x20];
        let lease = read_update_lease(&rdata).unwrap().unwrap();
        assert_eq!(lease.lease, 3600);
        assert_eq!(lease.key_lease, 7200);

        // Short form: KEY-LEASE defaults to LEASE.
        let rdata = [0, 2, 0, 4, 0, 0, 0x0e, 0x10];
        let lease = read_update_lease(&rdata).unwrap().unwrap();
        assert_eq!(lease.lease, 3600);
        assert_eq!(lease.key_lease, 3600);
    }

    #[test]
    fn update_lease_option_skips_foreign_options() {
        // A COOKIE option (code 10) ahead of the lease option.
        let rdata = [0, 10, 0, 2, 0xaa, 0xbb, 0, 2, 0, 4, 0, 0, 0, 60];
        let lease = read_update_lease(&rdata).unwrap().unwrap();
        assert_eq!(lease.lease, 60);
    }

    #[test]
    fn update_lease_option_absent_or_truncated() {
        assert!(read_update_lease(&[]).unwrap().is_none());
        assert!(read_update_lease(&[0, 10, 0, 2, 0xaa, 0xbb]).unwrap().is_none());
        assert!(read_update_lease(&[0, 2, 0, 8, 0]).is_err());
        assert!(read_update_lease(&[0, 2, 0, 3, 1, 2, 3]).is_err());
    }

    #[test]
    fn key_record_rejects_non_ecdsa() {
        let mut rdata = vec![0x02, 0x00, KEY_PROTOCOL_DNSSEC, 8];
        rdata.extend_from_slice(&[0u8; 64]);
        assert!(matches!(KeyRecord::parse(&rdata), Err(Error::NotImp)));

        rdata[3] = ALGORITHM_ECDSA_P256_SHA256;
        assert!(KeyRecord::parse(&rdata).is_ok());

        rdata.pop();
        assert!(matches!(KeyRecord::parse(&rdata), Err(Error::FormErr)));
    }

    #[test]
    fn sub_type_base_name_extraction() {
        let sub = Name::from_str("_printer._sub._ipps._tcp.default.service.arpa.").unwrap();
        let base = Name::from_str("_ipps._tcp.default.service.arpa.").unwrap();
        assert_eq!(sub_type_base_name(&sub), Some(base));

        let plain = Name::from_str("_ipps._tcp.default.service.arpa.").unwrap();
        assert_eq!(sub_type_base_name(&plain), None);
    }

    #[test]
    fn encode_response_carries_granted_lease() {
        let mut request = Header::new();
        request.set_id(0x1234);
        let payload = encode_response(
            &request,
            ResponseCode::NoError,
            Some(UpdateLease {
                lease: 3600,
                key_lease: 7200,
            }),
        )
        .unwrap();

        let mut decoder = trust_dns_proto::serialize::binary::BinDecoder::new(&payload);
        let header =
            <Header as trust_dns_proto::serialize::binary::BinDecodable>::read(&mut decoder)
                .unwrap();
        assert_eq!(header.id(), 0x1234);
        assert_eq!(header.additional_count(), 1);

        let opt = WireRecord::read(&mut decoder).unwrap();
        assert_eq!(opt.record_type, TYPE_OPT);
        let lease = read_update_lease(opt.rdata(&payload)).unwrap().unwrap();
        assert_eq!(lease.lease, 3600);
        assert_eq!(lease.key_lease, 7200);
    }
}
