use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use tracing::{debug, error};

use crate::dns::{DnsPacket, DnsResource, RData, RecordClass, RecordType, name};
use crate::error::ZoneParseError;

/// TTL applied when a record line carries none.
const DEFAULT_TTL: u32 = 3600;

/// Operator-supplied answers, grouped by owner name. Rebuilt wholesale on
/// reload and swapped atomically; resolution is exact-FQDN only.
#[derive(Default)]
pub struct CustomRecordSet {
    records: HashMap<String, Vec<DnsResource>>,
}

impl CustomRecordSet {
    /// Build from `customdnsrecords` zone lines. Unparseable lines are
    /// logged and discarded.
    pub fn from_lines(lines: &[String]) -> Self {
        let mut records: HashMap<String, Vec<DnsResource>> = HashMap::new();

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            match parse_record_line(line) {
                Ok(record) => {
                    records.entry(record.name()).or_default().push(record);
                }
                Err(err) => {
                    error!("cannot parse custom record: {}", err);
                }
            }
        }

        Self { records }
    }

    /// Answer `req` from the custom set, or `None` when no owner matches
    /// the first question exactly.
    pub fn resolve(&self, req: &DnsPacket) -> Option<DnsPacket> {
        let question = req.first_question()?;
        let answers = self.records.get(&question.qname())?;

        debug!("custom record hit for {}", question.qname());

        let mut reply = DnsPacket::reply_to(req);
        reply.answers = answers.clone();
        reply.sync_counts();
        Some(reply)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Registered owner names, for reload diffing and the admin API.
    pub fn names(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }
}

/// Parse a single `name [ttl] [IN] TYPE rdata` line into a resource record.
fn parse_record_line(line: &str) -> Result<DnsResource, ZoneParseError> {
    let malformed = || ZoneParseError::Malformed(line.to_string());

    let mut tokens = line.split_whitespace().peekable();
    let Some(owner) = tokens.next() else {
        return Err(malformed());
    };
    if owner.starts_with(';') || owner.starts_with('#') {
        return Err(malformed());
    }

    let mut ttl = DEFAULT_TTL;
    if let Some(token) = tokens.peek() {
        if let Ok(parsed) = token.parse::<u32>() {
            ttl = parsed;
            tokens.next();
        }
    }

    if let Some(token) = tokens.peek() {
        if token.eq_ignore_ascii_case("IN") {
            tokens.next();
        }
    }

    let Some(type_token) = tokens.next() else {
        return Err(malformed());
    };
    let rtype = RecordType::from_mnemonic(type_token)
        .ok_or_else(|| ZoneParseError::UnsupportedType(type_token.to_string()))?;

    let rdata_text = tokens.collect::<Vec<_>>().join(" ");
    if rdata_text.is_empty() {
        return Err(malformed());
    }
    let rdata = parse_rdata(rtype, &rdata_text)?;

    Ok(DnsResource {
        labels: name::labels_from_name(owner),
        rtype,
        rclass: RecordClass::In,
        ttl,
        rdata,
    })
}

fn parse_rdata(rtype: RecordType, text: &str) -> Result<RData, ZoneParseError> {
    let invalid = || ZoneParseError::InvalidRdata {
        rtype: rtype.to_string(),
        value: text.to_string(),
    };

    match rtype {
        RecordType::A => text
            .parse::<Ipv4Addr>()
            .map(RData::A)
            .map_err(|_| invalid()),
        RecordType::Aaaa => text
            .parse::<Ipv6Addr>()
            .map(RData::Aaaa)
            .map_err(|_| invalid()),
        RecordType::Cname => Ok(RData::Cname(name::labels_from_name(text))),
        RecordType::Ns => Ok(RData::Ns(name::labels_from_name(text))),
        RecordType::Ptr => Ok(RData::Ptr(name::labels_from_name(text))),
        RecordType::Mx => {
            let Some((preference, exchange)) = text.split_once(' ') else {
                return Err(invalid());
            };
            Ok(RData::Mx {
                preference: preference.parse().map_err(|_| invalid())?,
                exchange: name::labels_from_name(exchange.trim()),
            })
        }
        RecordType::Txt => {
            // Single character-string, quotes optional in config lines.
            let text = text.trim_matches('"');
            if text.len() > 255 {
                return Err(invalid());
            }
            let mut raw = Vec::with_capacity(text.len() + 1);
            raw.push(text.len() as u8);
            raw.extend_from_slice(text.as_bytes());
            Ok(RData::Txt(raw))
        }
        _ => Err(ZoneParseError::UnsupportedType(rtype.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(qname: &str, qtype: RecordType) -> DnsPacket {
        DnsPacket::query(42, qname, qtype)
    }

    #[test]
    fn custom_a_record_resolves() {
        let set = CustomRecordSet::from_lines(&["example.com. IN A 10.10.0.1".to_string()]);

        let reply = set.resolve(&query("example.com.", RecordType::A)).unwrap();
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].rdata, RData::A(Ipv4Addr::new(10, 10, 0, 1)));
        assert_eq!(reply.header.id, 42);
        assert!(reply.header.qr);
    }

    #[test]
    fn multiple_records_grouped_by_owner() {
        let set = CustomRecordSet::from_lines(&[
            "example.com. IN A 10.10.0.1".to_string(),
            "example.com. IN A 10.10.0.2".to_string(),
        ]);

        let reply = set.resolve(&query("example.com", RecordType::A)).unwrap();
        assert_eq!(reply.answers.len(), 2);
        let addrs: Vec<_> = reply.answers.iter().map(|a| a.rdata.clone()).collect();
        assert!(addrs.contains(&RData::A(Ipv4Addr::new(10, 10, 0, 1))));
        assert!(addrs.contains(&RData::A(Ipv4Addr::new(10, 10, 0, 2))));
    }

    #[test]
    fn resolution_is_exact_and_case_insensitive() {
        let set = CustomRecordSet::from_lines(&["example.com. IN A 10.0.0.1".to_string()]);

        assert!(set.resolve(&query("EXAMPLE.COM.", RecordType::A)).is_some());
        assert!(set.resolve(&query("sub.example.com", RecordType::A)).is_none());
        assert!(set.resolve(&query("other.com", RecordType::A)).is_none());
    }

    #[test]
    fn cname_and_optional_fields_parse() {
        let set = CustomRecordSet::from_lines(&[
            "alias.example 600 IN CNAME wikipedia.org".to_string(),
            "short.example CNAME target.example".to_string(),
        ]);

        let reply = set.resolve(&query("alias.example", RecordType::A)).unwrap();
        assert_eq!(reply.answers[0].ttl, 600);
        assert_eq!(
            reply.answers[0].cname_target().as_deref(),
            Some("wikipedia.org")
        );

        let reply = set.resolve(&query("short.example", RecordType::A)).unwrap();
        assert_eq!(reply.answers[0].ttl, DEFAULT_TTL);
    }

    #[test]
    fn bad_lines_are_skipped() {
        let set = CustomRecordSet::from_lines(&[
            "example.com. IN A 10.0.0.1".to_string(),
            "only-a-name".to_string(),
            "host.example IN BOGUS data".to_string(),
            "host.example IN A not-an-ip".to_string(),
        ]);

        assert_eq!(set.len(), 1);
    }

    #[test]
    fn txt_and_mx_rdata() {
        let set = CustomRecordSet::from_lines(&[
            "mail.example IN MX 10 mx1.example.".to_string(),
            "txt.example IN TXT \"hello world\"".to_string(),
        ]);

        let reply = set.resolve(&query("mail.example", RecordType::Mx)).unwrap();
        assert!(matches!(
            reply.answers[0].rdata,
            RData::Mx { preference: 10, .. }
        ));

        let reply = set.resolve(&query("txt.example", RecordType::Txt)).unwrap();
        match &reply.answers[0].rdata {
            RData::Txt(raw) => {
                assert_eq!(raw[0] as usize, "hello world".len());
                assert_eq!(&raw[1..], b"hello world");
            }
            other => panic!("unexpected rdata {:?}", other),
        }
    }
}
