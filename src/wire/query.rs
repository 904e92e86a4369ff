use serde::{Deserialize, Serialize};

use super::name::{read_question_name, write_name};
use super::{HEADER_LEN, MAX_QUERY_LEN, WireError};

/// Question types the filter cares about; everything else is carried
/// through opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryType {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
    Other(u16),
}

impl From<u16> for QueryType {
    fn from(value: u16) -> Self {
        match value {
            1 => QueryType::A,
            28 => QueryType::Aaaa,
            5 => QueryType::Cname,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            other => QueryType::Other(other),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(value: QueryType) -> u16 {
        match value {
            QueryType::A => 1,
            QueryType::Aaaa => 28,
            QueryType::Cname => 5,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryClass {
    In,
    Other(u16),
}

impl From<u16> for QueryClass {
    fn from(value: u16) -> Self {
        match value {
            1 => QueryClass::In,
            other => QueryClass::Other(other),
        }
    }
}

impl From<QueryClass> for u16 {
    fn from(value: QueryClass) -> u16 {
        match value {
            QueryClass::In => 1,
            QueryClass::Other(other) => other,
        }
    }
}

/// A parsed client query: the first question plus the raw packet bytes,
/// kept so the packet can be forwarded upstream unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub domain: String,
    pub qtype: QueryType,
    pub qclass: QueryClass,
    pub raw: Vec<u8>,
}

impl DnsQuery {
    /// Re-serialize the logical question as a standard recursive query.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.domain.len() + 6);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&[0x01, 0x00]); // RD set, everything else clear
        out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // AN/NS/AR
        write_name(&mut out, &self.domain);
        out.extend_from_slice(&u16::from(self.qtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.qclass).to_be_bytes());
        out
    }
}

/// Parse a client UDP query with strict bounds checking.
///
/// Accepts 12..=512 bytes, QR must be 0, at least one question, and the
/// question name must be uncompressed (RFC 1035 forbids pointers there).
pub fn parse_query(buf: &[u8]) -> Result<DnsQuery, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::PacketTooShort);
    }
    if buf.len() > MAX_QUERY_LEN {
        return Err(WireError::PacketTooLarge);
    }

    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    if flags & 0x8000 != 0 {
        return Err(WireError::NotAQuery);
    }
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    if qdcount == 0 {
        return Err(WireError::MissingQuestion);
    }

    let (domain, pos) = read_question_name(buf, HEADER_LEN)?;
    if pos + 4 > buf.len() {
        return Err(WireError::MissingTypeClass);
    }
    let qtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]).into();
    let qclass = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]).into();

    Ok(DnsQuery {
        id,
        domain,
        qtype,
        qclass,
        raw: buf.to_vec(),
    })
}
