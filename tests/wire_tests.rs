use dnshield::wire::{
    DnsQuery, QueryClass, QueryType, WireError, build_blocked_response, build_formerr_raw,
    build_rcode_response, parse_query, parse_response, update_ttl, RCODE_NXDOMAIN, RCODE_SERVFAIL,
};

// A real captured A query for example.com
const EXAMPLE_COM_QUERY: &[u8] = &[
    0x12, 0x34, // Transaction ID
    0x01, 0x00, // Flags: standard recursive query
    0x00, 0x01, // Questions: 1
    0x00, 0x00, // Answers: 0
    0x00, 0x00, // Authority: 0
    0x00, 0x00, // Additional: 0
    0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', // "example"
    0x03, b'c', b'o', b'm', // "com"
    0x00, // root
    0x00, 0x01, // Type: A
    0x00, 0x01, // Class: IN
];

fn query_for(domain: &str, qtype: QueryType) -> DnsQuery {
    DnsQuery {
        id: 0x1234,
        domain: domain.to_string(),
        qtype,
        qclass: QueryClass::In,
        raw: Vec::new(),
    }
}

#[test]
fn test_parse_captured_query() {
    let query = parse_query(EXAMPLE_COM_QUERY).expect("query parses");
    assert_eq!(query.id, 0x1234);
    assert_eq!(query.domain, "example.com");
    assert_eq!(query.qtype, QueryType::A);
    assert_eq!(query.qclass, QueryClass::In);
}

#[test]
fn test_query_reserialization_round_trip() {
    let query = parse_query(EXAMPLE_COM_QUERY).expect("query parses");
    let reparsed = parse_query(&query.encode()).expect("encoded query parses");
    assert_eq!(reparsed.id, query.id);
    assert_eq!(reparsed.domain, query.domain);
    assert_eq!(reparsed.qtype, query.qtype);
    assert_eq!(reparsed.qclass, query.qclass);
}

#[test]
fn test_boundary_eleven_bytes() {
    assert_eq!(
        parse_query(&EXAMPLE_COM_QUERY[..11]),
        Err(WireError::PacketTooShort)
    );
}

#[test]
fn test_boundary_oversize_query() {
    let mut oversized = EXAMPLE_COM_QUERY.to_vec();
    oversized.resize(513, 0);
    assert_eq!(parse_query(&oversized), Err(WireError::PacketTooLarge));
}

#[test]
fn test_boundary_exactly_512_is_accepted_shapewise() {
    // 512 bytes must not be rejected for size; pad the additional
    // section, which the question parser never reads
    let mut padded = EXAMPLE_COM_QUERY.to_vec();
    padded.resize(512, 0);
    assert!(parse_query(&padded).is_ok());
}

#[test]
fn test_compression_pointer_in_question_rejected() {
    let mut packet = EXAMPLE_COM_QUERY[..12].to_vec();
    packet.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01]);
    assert_eq!(parse_query(&packet), Err(WireError::CompressionInQuestion));
}

#[test]
fn test_synthesize_then_parse_preserves_question() {
    // Parse ∘ synthesize is the identity on (id, qname, qtype, qclass)
    let query = query_for("blocked.example.com", QueryType::A);
    let blocked = build_blocked_response(&query);
    let response = parse_response(&blocked).expect("synthetic response parses");
    assert_eq!(response.id, query.id);
    assert_eq!(response.domain, query.domain);
    assert_eq!(response.qtype, query.qtype);
    assert_eq!(response.qclass, query.qclass);
    assert_eq!(response.answers, vec!["127.0.0.1".parse::<std::net::IpAddr>().unwrap()]);
}

#[test]
fn test_blocked_aaaa_answer() {
    let query = query_for("blocked.example.com", QueryType::Aaaa);
    let response = parse_response(&build_blocked_response(&query)).unwrap();
    assert_eq!(response.answers, vec!["::1".parse::<std::net::IpAddr>().unwrap()]);
}

#[test]
fn test_rcode_builders_echo_question() {
    let query = query_for("missing.example.com", QueryType::Mx);
    for rcode in [RCODE_NXDOMAIN, RCODE_SERVFAIL] {
        let response = parse_response(&build_rcode_response(&query, rcode)).unwrap();
        assert_eq!(response.rcode, rcode);
        assert_eq!(response.id, query.id);
        assert_eq!(response.domain, query.domain);
        assert_eq!(response.answer_count, 0);
    }
}

#[test]
fn test_formerr_preserves_transaction_id_only() {
    let reply = build_formerr_raw(&[0xab, 0xcd, 0x01, 0x02]).unwrap();
    let response = parse_response(&reply).unwrap();
    assert_eq!(response.id, 0xabcd);
    assert_eq!(response.rcode, 1);
}

#[test]
fn test_update_ttl_clamp_window() {
    let query = query_for("clamp.example.com", QueryType::A);
    let bytes = build_blocked_response(&query);

    for (requested, expected) in [(0u32, 30u32), (5, 30), (30, 30), (120, 120), (300, 300), (3600, 300)] {
        let rewritten = update_ttl(&bytes, requested).unwrap();
        let response = parse_response(&rewritten).unwrap();
        assert_eq!(response.min_ttl, expected, "requested ttl {}", requested);
    }
}

#[test]
fn test_response_with_compression_pointer_parses() {
    // Answer owner name is a pointer back into the question
    let mut packet = EXAMPLE_COM_QUERY.to_vec();
    packet[2] = 0x81; // QR + RD
    packet[3] = 0x80; // RA
    packet[7] = 0x01; // ANCOUNT = 1
    packet.extend_from_slice(&[0xc0, 0x0c]); // pointer to offset 12
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A, IN
    packet.extend_from_slice(&600u32.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x04, 93, 184, 216, 34]);

    let response = parse_response(&packet).unwrap();
    assert_eq!(response.domain, "example.com");
    assert_eq!(response.min_ttl, 600);
    assert_eq!(response.answers.len(), 1);
}

#[test]
fn test_pointer_loop_is_bounded() {
    // Question name is a pointer chain that loops on itself
    let mut packet = vec![
        0xde, 0xad, 0x81, 0x80, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    packet.extend_from_slice(&[0xc0, 0x0c]); // points at itself (offset 12)
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    assert_eq!(parse_response(&packet), Err(WireError::PointerLoop));
}

#[test]
fn test_label_of_64_rejected() {
    let mut packet = vec![
        0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    packet.push(64);
    packet.extend_from_slice(&[b'x'; 64]);
    packet.push(0);
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    assert_eq!(parse_query(&packet), Err(WireError::LabelTooLong));
}
