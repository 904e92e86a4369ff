use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::name::{read_compressed_name, skip_name};
use super::query::{QueryClass, QueryType};
use super::{HEADER_LEN, WireError};

/// TTL assumed when a response carries no answer records.
const DEFAULT_TTL: u32 = 300;

/// A parsed upstream response: enough structure for caching decisions plus
/// the raw bytes that are relayed to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsResponse {
    pub id: u16,
    pub domain: String,
    pub qtype: QueryType,
    pub qclass: QueryClass,
    pub rcode: u8,
    pub answers: Vec<IpAddr>,
    pub min_ttl: u32,
    pub answer_count: u16,
    pub raw: Vec<u8>,
}

/// Parse an upstream response.
///
/// Compression pointers are followed (with a bounded jump counter) when
/// replaying the question name; answer owner names are skipped. A and AAAA
/// RDATA are decoded; other record types are stepped over safely. The
/// minimum TTL across answers is tracked for the cache.
pub fn parse_response(buf: &[u8]) -> Result<DnsResponse, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::PacketTooShort);
    }

    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & 0x8000 == 0 {
        return Err(WireError::NotAResponse);
    }
    let rcode = (flags & 0x000f) as u8;
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);

    let mut pos = HEADER_LEN;
    let mut domain = String::new();
    let mut qtype = QueryType::Other(0);
    let mut qclass = QueryClass::Other(0);

    for i in 0..qdcount {
        let (name, next) = read_compressed_name(buf, pos)?;
        if next + 4 > buf.len() {
            return Err(WireError::MissingTypeClass);
        }
        if i == 0 {
            domain = name;
            qtype = u16::from_be_bytes([buf[next], buf[next + 1]]).into();
            qclass = u16::from_be_bytes([buf[next + 2], buf[next + 3]]).into();
        }
        pos = next + 4;
    }

    let mut answers = Vec::new();
    let mut min_ttl: Option<u32> = None;

    for _ in 0..ancount {
        pos = skip_name(buf, pos)?;
        if pos + 10 > buf.len() {
            return Err(WireError::TruncatedRecord);
        }
        let rtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let ttl = u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);
        let rdlength = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
        pos += 10;

        let rdata = buf.get(pos..pos + rdlength).ok_or(WireError::TruncatedRecord)?;
        pos += rdlength;

        min_ttl = Some(min_ttl.map_or(ttl, |m| m.min(ttl)));

        match (rtype, rdlength) {
            (1, 4) => {
                answers.push(IpAddr::V4(Ipv4Addr::new(
                    rdata[0], rdata[1], rdata[2], rdata[3],
                )));
            }
            (28, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                answers.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {} // other record types are skipped, not decoded
        }
    }

    Ok(DnsResponse {
        id,
        domain,
        qtype,
        qclass,
        rcode,
        answers,
        min_ttl: min_ttl.unwrap_or(DEFAULT_TTL),
        answer_count: ancount,
        raw: buf.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::name::write_name;

    fn build_a_response(id: u16, domain: &str, ttls: &[u32]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&[0x81, 0x80]); // QR, RD, RA
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&(ttls.len() as u16).to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        write_name(&mut buf, domain);
        buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        for (i, ttl) in ttls.iter().enumerate() {
            buf.extend_from_slice(&[0xc0, 0x0c]); // pointer to the question name
            buf.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
            buf.extend_from_slice(&ttl.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&[1, 2, 3, i as u8]);
        }
        buf
    }

    #[test]
    fn test_parse_single_answer() {
        let raw = build_a_response(0xaaaa, "example.com", &[120]);
        let resp = parse_response(&raw).unwrap();
        assert_eq!(resp.id, 0xaaaa);
        assert_eq!(resp.domain, "example.com");
        assert_eq!(resp.qtype, QueryType::A);
        assert_eq!(resp.rcode, 0);
        assert_eq!(resp.answers, vec!["1.2.3.0".parse::<IpAddr>().unwrap()]);
        assert_eq!(resp.min_ttl, 120);
    }

    #[test]
    fn test_minimum_ttl_across_answers() {
        let raw = build_a_response(1, "example.com", &[600, 45, 3600]);
        let resp = parse_response(&raw).unwrap();
        assert_eq!(resp.min_ttl, 45);
        assert_eq!(resp.answer_count, 3);
    }

    #[test]
    fn test_default_ttl_when_no_answers() {
        let raw = build_a_response(1, "example.com", &[]);
        let resp = parse_response(&raw).unwrap();
        assert_eq!(resp.min_ttl, 300);
        assert!(resp.answers.is_empty());
    }

    #[test]
    fn test_query_bit_rejected() {
        let mut raw = build_a_response(1, "example.com", &[60]);
        raw[2] &= 0x7f;
        assert_eq!(
            parse_response(&raw).unwrap_err(),
            WireError::NotAResponse
        );
    }

    #[test]
    fn test_truncated_answer_rejected() {
        let raw = build_a_response(1, "example.com", &[60]);
        let cut = &raw[..raw.len() - 2];
        assert_eq!(
            parse_response(cut).unwrap_err(),
            WireError::TruncatedRecord
        );
    }

    #[test]
    fn test_aaaa_decoded() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u16.to_be_bytes());
        buf.extend_from_slice(&[0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0, 0, 0, 0]);
        write_name(&mut buf, "v6.example.com");
        buf.extend_from_slice(&[0x00, 0x1c, 0x00, 0x01]);
        buf.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x1c, 0x00, 0x01]);
        buf.extend_from_slice(&99u32.to_be_bytes());
        buf.extend_from_slice(&16u16.to_be_bytes());
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        buf.extend_from_slice(&addr.octets());
        let resp = parse_response(&buf).unwrap();
        assert_eq!(resp.answers, vec![IpAddr::V6(addr)]);
        assert_eq!(resp.min_ttl, 99);
    }
}
