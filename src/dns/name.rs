use super::ParseError;

const POINTER_MASK: u8 = 0xC0;
const MAX_POINTER_JUMPS: usize = 16;
const MAX_LABEL_LEN: usize = 63;

/// Read a domain name starting at `offset`, following compression pointers
/// into `buf`. Returns the labels and the offset just past the name as it
/// appears at the original position (a pointer consumes two bytes there).
pub fn parse_name(buf: &[u8], offset: usize) -> Result<(Vec<String>, usize), ParseError> {
    let mut labels = Vec::new();
    let mut pos = offset;
    let mut next = None;
    let mut jumps = 0;

    loop {
        let len = *buf.get(pos).ok_or(ParseError::UnexpectedEnd {
            offset: pos,
            needed: 1,
        })?;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & POINTER_MASK == POINTER_MASK {
            let second = *buf.get(pos + 1).ok_or(ParseError::UnexpectedEnd {
                offset: pos + 1,
                needed: 1,
            })?;
            let target = (((len & !POINTER_MASK) as usize) << 8) | second as usize;

            // Only the first pointer determines where the caller resumes.
            if next.is_none() {
                next = Some(pos + 2);
            }

            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(ParseError::PointerLoop);
            }
            if target >= pos {
                // Forward pointers are never produced by a valid encoder.
                return Err(ParseError::PointerLoop);
            }
            pos = target;
            continue;
        }

        if len as usize > MAX_LABEL_LEN {
            return Err(ParseError::InvalidLabel(pos));
        }

        let start = pos + 1;
        let end = start + len as usize;
        let bytes = buf.get(start..end).ok_or(ParseError::UnexpectedEnd {
            offset: start,
            needed: len as usize,
        })?;
        let label =
            String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::InvalidLabel(pos))?;
        labels.push(label);
        pos = end;
    }

    Ok((labels, next.unwrap_or(pos)))
}

/// Append a name in uncompressed wire form.
pub fn write_name(out: &mut Vec<u8>, labels: &[String]) -> Result<(), ParseError> {
    for label in labels {
        if label.is_empty() {
            continue;
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(ParseError::InvalidLabel(out.len()));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Split a presentation-form name into labels, dropping the trailing dot.
pub fn labels_from_name(name: &str) -> Vec<String> {
    name.trim_end_matches('.')
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}

/// Join labels into a lowercased, un-dotted presentation name. This is the
/// canonical form used for cache fingerprints and block lookups.
pub fn name_from_labels(labels: &[String]) -> String {
    labels
        .iter()
        .filter(|label| !label.is_empty())
        .map(|label| label.to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_name_roundtrip() {
        let labels = labels_from_name("www.example.com.");
        let mut buf = Vec::new();
        write_name(&mut buf, &labels).unwrap();

        let (parsed, next) = parse_name(&buf, 0).unwrap();
        assert_eq!(parsed, labels);
        assert_eq!(next, buf.len());
    }

    #[test]
    fn root_name() {
        let mut buf = Vec::new();
        write_name(&mut buf, &[]).unwrap();
        assert_eq!(buf, vec![0]);

        let (parsed, next) = parse_name(&buf, 0).unwrap();
        assert!(parsed.is_empty());
        assert_eq!(next, 1);
    }

    #[test]
    fn compressed_name_follows_pointer() {
        // "example.com" at 0, then "www" + pointer to 0 at offset 13.
        let mut buf = Vec::new();
        write_name(&mut buf, &labels_from_name("example.com")).unwrap();
        let tail = buf.len();
        buf.push(3);
        buf.extend_from_slice(b"www");
        buf.push(0xC0);
        buf.push(0);

        let (parsed, next) = parse_name(&buf, tail).unwrap();
        assert_eq!(name_from_labels(&parsed), "www.example.com");
        assert_eq!(next, buf.len());
    }

    #[test]
    fn pointer_loop_detected() {
        // Pointer pointing at itself.
        let buf = vec![0xC0, 0x00];
        assert!(matches!(parse_name(&buf, 0), Err(ParseError::PointerLoop)));
    }

    #[test]
    fn canonical_name_lowercases() {
        let labels = vec!["WWW".to_string(), "Example".to_string(), "COM".to_string()];
        assert_eq!(name_from_labels(&labels), "www.example.com");
    }
}
