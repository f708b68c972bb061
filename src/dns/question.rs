use super::{ParseError, RecordClass, RecordType, name};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsQuestion {
    pub labels: Vec<String>,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl DnsQuestion {
    pub fn new(qname: &str, qtype: RecordType) -> Self {
        Self {
            labels: name::labels_from_name(qname),
            qtype,
            qclass: RecordClass::In,
        }
    }

    /// Canonical (lowercased, no trailing dot) question name.
    pub fn qname(&self) -> String {
        name::name_from_labels(&self.labels)
    }

    pub(super) fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let (labels, mut pos) = name::parse_name(buf, offset)?;

        let fixed = buf.get(pos..pos + 4).ok_or(ParseError::UnexpectedEnd {
            offset: pos,
            needed: 4,
        })?;
        let qtype = u16::from_be_bytes([fixed[0], fixed[1]]).into();
        let qclass = u16::from_be_bytes([fixed[2], fixed[3]]).into();
        pos += 4;

        Ok((
            Self {
                labels,
                qtype,
                qclass,
            },
            pos,
        ))
    }

    pub(super) fn write(&self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        name::write_name(out, &self.labels)?;
        out.extend_from_slice(&u16::from(self.qtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.qclass).to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_roundtrip() {
        let question = DnsQuestion::new("example.com.", RecordType::Aaaa);
        let mut buf = Vec::new();
        question.write(&mut buf).unwrap();

        let (parsed, next) = DnsQuestion::parse(&buf, 0).unwrap();
        assert_eq!(parsed, question);
        assert_eq!(next, buf.len());
        assert_eq!(parsed.qname(), "example.com");
    }
}
