use std::net::{Ipv4Addr, Ipv6Addr};

use super::name::{skip_name, write_name};
use super::query::{DnsQuery, QueryType};
use super::{HEADER_LEN, TTL_CEILING, TTL_FLOOR, WireError};

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;

/// Sinkhole addresses answered for blocked queries.
const BLOCK_V4: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const BLOCK_V6: Ipv6Addr = Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1);

/// Rewrite the TTL of the first answer record, clamping into the cache
/// window. Returns a fresh buffer; the input is not modified. A response
/// without answers is returned unchanged.
pub fn update_ttl(bytes: &[u8], new_ttl: u32) -> Result<Vec<u8>, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::PacketTooShort);
    }
    let qdcount = u16::from_be_bytes([bytes[4], bytes[5]]);
    let ancount = u16::from_be_bytes([bytes[6], bytes[7]]);

    let mut out = bytes.to_vec();
    if ancount == 0 {
        return Ok(out);
    }

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        pos = skip_name(bytes, pos)?;
        pos += 4;
    }
    pos = skip_name(bytes, pos)?;
    // Owner name, then type(2) + class(2) precede the TTL field
    let ttl_offset = pos + 4;
    if ttl_offset + 4 > bytes.len() {
        return Err(WireError::TruncatedRecord);
    }

    let clamped = new_ttl.clamp(TTL_FLOOR, TTL_CEILING);
    out[ttl_offset..ttl_offset + 4].copy_from_slice(&clamped.to_be_bytes());
    Ok(out)
}

fn write_header(out: &mut Vec<u8>, id: u16, rcode: u8, qdcount: u16, ancount: u16) {
    out.extend_from_slice(&id.to_be_bytes());
    // QR + RD + RA, opcode 0
    out.extend_from_slice(&(0x8180u16 | rcode as u16).to_be_bytes());
    out.extend_from_slice(&qdcount.to_be_bytes());
    out.extend_from_slice(&ancount.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
}

fn write_question(out: &mut Vec<u8>, query: &DnsQuery) {
    write_name(out, &query.domain);
    out.extend_from_slice(&u16::from(query.qtype).to_be_bytes());
    out.extend_from_slice(&u16::from(query.qclass).to_be_bytes());
}

/// Build an answerless response with the given rcode, echoing the question
/// and preserving the transaction ID.
pub fn build_rcode_response(query: &DnsQuery, rcode: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + query.domain.len() + 6);
    write_header(&mut out, query.id, rcode, 1, 0);
    write_question(&mut out, query);
    out
}

/// Synthesize the blocked answer for a query.
///
/// A queries get the v4 sinkhole, AAAA the v6 one, both with TTL 0 so the
/// block is never cached downstream. Any other type is answered NXDOMAIN.
pub fn build_blocked_response(query: &DnsQuery) -> Vec<u8> {
    let (rdata, rtype): (Vec<u8>, u16) = match query.qtype {
        QueryType::A => (BLOCK_V4.octets().to_vec(), 1),
        QueryType::Aaaa => (BLOCK_V6.octets().to_vec(), 28),
        _ => return build_rcode_response(query, RCODE_NXDOMAIN),
    };

    let mut out = Vec::with_capacity(HEADER_LEN + query.domain.len() + 22 + rdata.len());
    write_header(&mut out, query.id, RCODE_NOERROR, 1, 1);
    write_question(&mut out, query);
    out.extend_from_slice(&[0xc0, 0x0c]); // answer owner = question name
    out.extend_from_slice(&rtype.to_be_bytes());
    out.extend_from_slice(&u16::from(query.qclass).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // TTL 0
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rdata);
    out
}

/// FORMERR reply for a packet the parser rejected. Only the transaction ID
/// is recoverable, so the question section is empty.
pub fn build_formerr_raw(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < 2 {
        return None;
    }
    let id = u16::from_be_bytes([raw[0], raw[1]]);
    let mut out = Vec::with_capacity(HEADER_LEN);
    write_header(&mut out, id, RCODE_FORMERR, 0, 0);
    Some(out)
}
