//! Domain-name encoding helpers shared by the query and response parsers.

use super::WireError;

/// RFC 1035 limits: 63 bytes per label, 253 bytes of presentation name.
pub(crate) const MAX_LABEL_LEN: usize = 63;
pub(crate) const MAX_NAME_LEN: usize = 253;
pub(crate) const MAX_LABEL_COUNT: usize = 127;

/// Upper bound on compression-pointer jumps while reading a response name.
pub(crate) const POINTER_JUMP_LIMIT: usize = 16;

/// Decode one label's bytes into text.
///
/// UTF-8 is attempted first; if the bytes are not valid UTF-8 a strict
/// printable-ASCII (0x20..=0x7E) decode is tried before giving up.
fn decode_label(bytes: &[u8]) -> Result<String, WireError> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => {
            if bytes.iter().all(|&b| (0x20..=0x7e).contains(&b)) {
                Ok(bytes.iter().map(|&b| b as char).collect())
            } else {
                Err(WireError::InvalidEncoding)
            }
        }
    }
}

/// Read a name from the question section, where RFC 1035 forbids
/// compression pointers. Returns the lowercased dotted name and the offset
/// just past the terminating root label.
pub(crate) fn read_question_name(buf: &[u8], mut pos: usize) -> Result<(String, usize), WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut name_len = 0usize;

    loop {
        let len_byte = *buf.get(pos).ok_or(WireError::MissingTypeClass)? as usize;
        pos += 1;

        if len_byte == 0 {
            break;
        }
        if len_byte & 0xc0 == 0xc0 {
            return Err(WireError::CompressionInQuestion);
        }
        if len_byte > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong);
        }
        if labels.len() >= MAX_LABEL_COUNT {
            return Err(WireError::TooManyLabels);
        }

        let end = pos + len_byte;
        let raw = buf.get(pos..end).ok_or(WireError::MissingTypeClass)?;
        pos = end;

        name_len += len_byte + usize::from(!labels.is_empty());
        if name_len > MAX_NAME_LEN {
            return Err(WireError::DomainTooLong);
        }

        labels.push(decode_label(raw)?.to_lowercase());
    }

    Ok((labels.join("."), pos))
}

/// Read a name from a response packet, following compression pointers.
///
/// Returns the lowercased dotted name and the offset just past the name's
/// occurrence at `pos` (a pointer consumes exactly two bytes there). The
/// jump counter bounds cyclic pointer chains.
pub(crate) fn read_compressed_name(
    buf: &[u8],
    pos: usize,
) -> Result<(String, usize), WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = pos;
    let mut end_of_occurrence: Option<usize> = None;
    let mut jumps = 0usize;

    loop {
        let len_byte = *buf.get(cursor).ok_or(WireError::TruncatedRecord)? as usize;

        if len_byte & 0xc0 == 0xc0 {
            let low = *buf.get(cursor + 1).ok_or(WireError::TruncatedRecord)? as usize;
            if end_of_occurrence.is_none() {
                end_of_occurrence = Some(cursor + 2);
            }
            jumps += 1;
            if jumps > POINTER_JUMP_LIMIT {
                return Err(WireError::PointerLoop);
            }
            cursor = ((len_byte & 0x3f) << 8) | low;
            continue;
        }

        cursor += 1;
        if len_byte == 0 {
            break;
        }
        if len_byte > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong);
        }
        if labels.len() >= MAX_LABEL_COUNT {
            return Err(WireError::TooManyLabels);
        }

        let end = cursor + len_byte;
        let raw = buf.get(cursor..end).ok_or(WireError::TruncatedRecord)?;
        labels.push(decode_label(raw)?.to_lowercase());
        cursor = end;
    }

    let next = end_of_occurrence.unwrap_or(cursor);
    Ok((labels.join("."), next))
}

/// Skip over a (possibly compressed) name without decoding it, returning
/// the offset just past its occurrence at `pos`.
pub(crate) fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize, WireError> {
    loop {
        let len_byte = *buf.get(pos).ok_or(WireError::TruncatedRecord)? as usize;
        if len_byte & 0xc0 == 0xc0 {
            // Pointer terminates the occurrence
            if pos + 2 > buf.len() {
                return Err(WireError::TruncatedRecord);
            }
            return Ok(pos + 2);
        }
        pos += 1;
        if len_byte == 0 {
            return Ok(pos);
        }
        pos += len_byte;
        if pos > buf.len() {
            return Err(WireError::TruncatedRecord);
        }
    }
}

/// Write a dotted name in uncompressed wire format.
pub(crate) fn write_name(out: &mut Vec<u8>, domain: &str) {
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        out.push(bytes.len().min(MAX_LABEL_LEN) as u8);
        out.extend_from_slice(&bytes[..bytes.len().min(MAX_LABEL_LEN)]);
    }
    out.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_question_name() {
        let buf = [
            0x03, b'w', b'w', b'w', 0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c',
            b'o', b'm', 0x00,
        ];
        let (name, next) = read_question_name(&buf, 0).unwrap();
        assert_eq!(name, "www.example.com");
        assert_eq!(next, buf.len());
    }

    #[test]
    fn test_question_name_rejects_pointer() {
        let buf = [0xc0, 0x0c];
        assert_eq!(
            read_question_name(&buf, 0),
            Err(WireError::CompressionInQuestion)
        );
    }

    #[test]
    fn test_compressed_name_follows_pointer() {
        // "example.com" at offset 0, pointer to it at offset 13
        let mut buf = vec![
            0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00,
        ];
        buf.extend_from_slice(&[0xc0, 0x00]);
        let (name, next) = read_compressed_name(&buf, 13).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(next, 15);
    }

    #[test]
    fn test_pointer_loop_detected() {
        // Pointer pointing at itself
        let buf = [0xc0, 0x00];
        assert_eq!(read_compressed_name(&buf, 0), Err(WireError::PointerLoop));
    }

    #[test]
    fn test_write_name_round_trip() {
        let mut out = Vec::new();
        write_name(&mut out, "login.account.example.com");
        let (name, _) = read_question_name(&out, 0).unwrap();
        assert_eq!(name, "login.account.example.com");
    }

    #[test]
    fn test_names_are_lowercased() {
        let buf = [0x04, b'M', b'a', b'I', b'L', 0x02, b'I', b'O', 0x00];
        let (name, _) = read_question_name(&buf, 0).unwrap();
        assert_eq!(name, "mail.io");
    }
}
