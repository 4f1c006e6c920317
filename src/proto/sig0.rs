//! SIG(0) verification for SRP updates.
//!
//! The signature covers, per RFC 2931 §3: the SIG RDATA excluding the
//! signature field, followed by the update message with the SIG record
//! removed, i.e. the header with ARCOUNT decremented and the body up to the
//! SIG record's owner name. The digest is SHA-256 and the signature an
//! ECDSA-P256 `r || s` pair, carried against the host's KEY record.

use crate::error::Error;
use crate::proto::{
    KeyRecord, SigRecord, ALGORITHM_ECDSA_P256_SHA256, ECDSA_P256_SIGNATURE_LEN,
};
use p256::ecdsa::signature::DigestVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::EncodedPoint;
use sha2::{Digest, Sha256};
use trust_dns_proto::op::Header;
use trust_dns_proto::serialize::binary::{BinEncodable, BinEncoder};

const HEADER_LEN: usize = 12;

/// Verify the SIG(0) record of an update message against the host's KEY.
///
/// `dns_header` is the header as received; `message` the raw datagram. Any
/// failure is deterministic and maps to `NotAuth`.
pub fn verify_signature(
    key: &KeyRecord,
    message: &[u8],
    dns_header: &Header,
    sig: &SigRecord,
) -> Result<(), Error> {
    // SIG(0) covers no RRset and must use the same algorithm as the KEY.
    if sig.type_covered != 0 || sig.algorithm != ALGORITHM_ECDSA_P256_SHA256 {
        return Err(Error::NotAuth);
    }
    if sig.signature.len() != ECDSA_P256_SIGNATURE_LEN {
        return Err(Error::NotAuth);
    }
    let sig_record_start = usize::from(sig.record_offset);
    if sig_record_start < HEADER_LEN || sig_record_start > message.len() {
        return Err(Error::NotAuth);
    }

    // The header is hashed with the SIG record excluded from its count.
    let mut header = dns_header.clone();
    header.set_additional_count(header.additional_count().saturating_sub(1));
    let mut header_bytes = Vec::with_capacity(HEADER_LEN);
    {
        let mut encoder = BinEncoder::new(&mut header_bytes);
        header.emit(&mut encoder).map_err(|_| Error::NotAuth)?;
    }

    let rdata_start = usize::from(sig.rdata_offset);
    let covered_rdata = &message[rdata_start..rdata_start + usize::from(sig.covered_rdata_len)];

    let mut digest = Sha256::new();
    digest.update(covered_rdata);
    digest.update(&header_bytes);
    digest.update(&message[HEADER_LEN..sig_record_start]);

    let point = EncodedPoint::from_untagged_bytes(GenericArray::from_slice(&key.public_key));
    let verifying_key = VerifyingKey::from_encoded_point(&point).map_err(|_| Error::NotAuth)?;
    let signature =
        Signature::from_slice(&sig.signature).map_err(|_| Error::NotAuth)?;
    verifying_key
        .verify_digest(digest, &signature)
        .map_err(|_| Error::NotAuth)
}
