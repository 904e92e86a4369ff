mod name;
mod query;
mod response;
mod synth;

pub use query::{DnsQuery, QueryClass, QueryType, parse_query};
pub use response::{DnsResponse, parse_response};
pub use synth::{
    build_blocked_response, build_formerr_raw, build_rcode_response, update_ttl, RCODE_FORMERR,
    RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_SERVFAIL,
};

use thiserror::Error;

/// DNS header is always 12 bytes.
pub const HEADER_LEN: usize = 12;
/// UDP queries larger than this are rejected outright.
pub const MAX_QUERY_LEN: usize = 512;
/// Cached TTLs are clamped into this window regardless of upstream values.
pub const TTL_FLOOR: u32 = 30;
pub const TTL_CEILING: u32 = 300;

/// Categorized wire-format errors.
///
/// Each validation step in the parsers returns early with one of these;
/// the proxy maps any of them to FORMERR for client packets and SERVFAIL
/// for upstream responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("packet shorter than the 12-byte DNS header")]
    PacketTooShort,
    #[error("query packet exceeds 512 bytes")]
    PacketTooLarge,
    #[error("QR bit set on a packet expected to be a query")]
    NotAQuery,
    #[error("QR bit clear on a packet expected to be a response")]
    NotAResponse,
    #[error("question count is zero")]
    MissingQuestion,
    #[error("label exceeds 63 bytes")]
    LabelTooLong,
    #[error("domain name exceeds 253 bytes")]
    DomainTooLong,
    #[error("domain name exceeds 127 labels")]
    TooManyLabels,
    #[error("compression pointer in question section")]
    CompressionInQuestion,
    #[error("label is neither UTF-8 nor printable ASCII")]
    InvalidEncoding,
    #[error("question truncated before type/class")]
    MissingTypeClass,
    #[error("compression pointer loop")]
    PointerLoop,
    #[error("record truncated")]
    TruncatedRecord,
}
