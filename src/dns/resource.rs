use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::{ParseError, RecordClass, RecordType, name};

/// Decoded rdata, tagged by record type. Name-bearing types are expanded at
/// parse time so compression pointers never escape the source packet;
/// everything vordr does not interpret is carried as raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(Vec<String>),
    Ns(Vec<String>),
    Ptr(Vec<String>),
    Mx {
        preference: u16,
        exchange: Vec<String>,
    },
    Soa {
        mname: Vec<String>,
        rname: Vec<String>,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Txt(Vec<u8>),
    Raw(Vec<u8>),
}

impl RData {
    fn parse(
        rtype: RecordType,
        buf: &[u8],
        rdata_offset: usize,
        rdlength: usize,
    ) -> Result<Self, ParseError> {
        let raw = buf
            .get(rdata_offset..rdata_offset + rdlength)
            .ok_or(ParseError::UnexpectedEnd {
                offset: rdata_offset,
                needed: rdlength,
            })?;

        let invalid = |reason: &str| ParseError::InvalidRdata {
            rtype: rtype.to_string(),
            reason: reason.to_string(),
        };

        match rtype {
            RecordType::A => {
                let octets: [u8; 4] = raw.try_into().map_err(|_| invalid("want 4 bytes"))?;
                Ok(RData::A(Ipv4Addr::from(octets)))
            }
            RecordType::Aaaa => {
                let octets: [u8; 16] = raw.try_into().map_err(|_| invalid("want 16 bytes"))?;
                Ok(RData::Aaaa(Ipv6Addr::from(octets)))
            }
            RecordType::Cname => {
                let (labels, _) = name::parse_name(buf, rdata_offset)?;
                Ok(RData::Cname(labels))
            }
            RecordType::Ns => {
                let (labels, _) = name::parse_name(buf, rdata_offset)?;
                Ok(RData::Ns(labels))
            }
            RecordType::Ptr => {
                let (labels, _) = name::parse_name(buf, rdata_offset)?;
                Ok(RData::Ptr(labels))
            }
            RecordType::Mx => {
                if raw.len() < 2 {
                    return Err(invalid("want preference"));
                }
                let preference = u16::from_be_bytes([raw[0], raw[1]]);
                let (exchange, _) = name::parse_name(buf, rdata_offset + 2)?;
                Ok(RData::Mx {
                    preference,
                    exchange,
                })
            }
            RecordType::Soa => {
                let (mname, pos) = name::parse_name(buf, rdata_offset)?;
                let (rname, pos) = name::parse_name(buf, pos)?;
                let fixed = buf.get(pos..pos + 20).ok_or(ParseError::UnexpectedEnd {
                    offset: pos,
                    needed: 20,
                })?;
                let word =
                    |i: usize| u32::from_be_bytes([fixed[i], fixed[i + 1], fixed[i + 2], fixed[i + 3]]);
                Ok(RData::Soa {
                    mname,
                    rname,
                    serial: word(0),
                    refresh: word(4),
                    retry: word(8),
                    expire: word(12),
                    minimum: word(16),
                })
            }
            RecordType::Txt => Ok(RData::Txt(raw.to_vec())),
            _ => Ok(RData::Raw(raw.to_vec())),
        }
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        match self {
            RData::A(addr) => out.extend_from_slice(&addr.octets()),
            RData::Aaaa(addr) => out.extend_from_slice(&addr.octets()),
            RData::Cname(labels) | RData::Ns(labels) | RData::Ptr(labels) => {
                name::write_name(out, labels)?;
            }
            RData::Mx {
                preference,
                exchange,
            } => {
                out.extend_from_slice(&preference.to_be_bytes());
                name::write_name(out, exchange)?;
            }
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                name::write_name(out, mname)?;
                name::write_name(out, rname)?;
                for word in [serial, refresh, retry, expire, minimum] {
                    out.extend_from_slice(&word.to_be_bytes());
                }
            }
            RData::Txt(raw) | RData::Raw(raw) => out.extend_from_slice(raw),
        }
        Ok(())
    }
}

impl fmt::Display for RData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RData::A(addr) => write!(f, "{}", addr),
            RData::Aaaa(addr) => write!(f, "{}", addr),
            RData::Cname(labels) | RData::Ns(labels) | RData::Ptr(labels) => {
                write!(f, "{}.", name::name_from_labels(labels))
            }
            RData::Mx {
                preference,
                exchange,
            } => write!(f, "{} {}.", preference, name::name_from_labels(exchange)),
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => write!(
                f,
                "{}. {}. {} {} {} {} {}",
                name::name_from_labels(mname),
                name::name_from_labels(rname),
                serial,
                refresh,
                retry,
                expire,
                minimum
            ),
            RData::Txt(raw) | RData::Raw(raw) => write!(f, "\\# {} {}", raw.len(), hex::encode(raw)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsResource {
    pub labels: Vec<String>,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub rdata: RData,
}

impl DnsResource {
    pub fn new_a(name: &str, ttl: u32, addr: Ipv4Addr) -> Self {
        Self {
            labels: name::labels_from_name(name),
            rtype: RecordType::A,
            rclass: RecordClass::In,
            ttl,
            rdata: RData::A(addr),
        }
    }

    pub fn new_aaaa(name: &str, ttl: u32, addr: Ipv6Addr) -> Self {
        Self {
            labels: name::labels_from_name(name),
            rtype: RecordType::Aaaa,
            rclass: RecordClass::In,
            ttl,
            rdata: RData::Aaaa(addr),
        }
    }

    pub fn new_cname(name: &str, ttl: u32, target: &str) -> Self {
        Self {
            labels: name::labels_from_name(name),
            rtype: RecordType::Cname,
            rclass: RecordClass::In,
            ttl,
            rdata: RData::Cname(name::labels_from_name(target)),
        }
    }

    /// Canonical owner name.
    pub fn name(&self) -> String {
        name::name_from_labels(&self.labels)
    }

    /// CNAME target in canonical form, if this record is a CNAME.
    pub fn cname_target(&self) -> Option<String> {
        match &self.rdata {
            RData::Cname(labels) => Some(name::name_from_labels(labels)),
            _ => None,
        }
    }

    pub fn is_address(&self) -> bool {
        matches!(self.rtype, RecordType::A | RecordType::Aaaa)
    }

    pub(super) fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        let (labels, mut pos) = name::parse_name(buf, offset)?;

        let fixed = buf.get(pos..pos + 10).ok_or(ParseError::UnexpectedEnd {
            offset: pos,
            needed: 10,
        })?;
        let rtype: RecordType = u16::from_be_bytes([fixed[0], fixed[1]]).into();
        let rclass: RecordClass = u16::from_be_bytes([fixed[2], fixed[3]]).into();
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        pos += 10;

        let rdata = RData::parse(rtype, buf, pos, rdlength)?;
        pos += rdlength;

        Ok((
            Self {
                labels,
                rtype,
                rclass,
                ttl,
                rdata,
            },
            pos,
        ))
    }

    pub(super) fn write(&self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        name::write_name(out, &self.labels)?;
        out.extend_from_slice(&u16::from(self.rtype).to_be_bytes());
        out.extend_from_slice(&u16::from(self.rclass).to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());

        let mut rdata = Vec::new();
        self.rdata.write(&mut rdata)?;
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
        Ok(())
    }
}

/// Presentation form, used for duplicate detection when the CNAME follower
/// merges answers. Mirrors the layout of a zone-file line.
impl fmt::Display for DnsResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.\t{}\t{}\t{}\t{}",
            self.name(),
            self.ttl,
            self.rclass,
            self.rtype,
            self.rdata
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_record_roundtrip() {
        let rr = DnsResource::new_a("example.com", 300, Ipv4Addr::new(10, 10, 0, 1));
        let mut buf = Vec::new();
        rr.write(&mut buf).unwrap();

        let (parsed, next) = DnsResource::parse(&buf, 0).unwrap();
        assert_eq!(parsed, rr);
        assert_eq!(next, buf.len());
    }

    #[test]
    fn cname_rdata_decompressed() {
        // Owner name written plainly, rdata as a pointer back to offset 0.
        let mut buf = Vec::new();
        name::write_name(&mut buf, &name::labels_from_name("target.example")).unwrap();
        let rr_start = buf.len();
        name::write_name(&mut buf, &name::labels_from_name("alias.example")).unwrap();
        buf.extend_from_slice(&u16::from(RecordType::Cname).to_be_bytes());
        buf.extend_from_slice(&u16::from(RecordClass::In).to_be_bytes());
        buf.extend_from_slice(&60u32.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.push(0xC0);
        buf.push(0);

        let (parsed, _) = DnsResource::parse(&buf, rr_start).unwrap();
        assert_eq!(parsed.cname_target().as_deref(), Some("target.example"));

        // Re-serialising must not emit the pointer.
        let mut out = Vec::new();
        parsed.write(&mut out).unwrap();
        let (reparsed, _) = DnsResource::parse(&out, 0).unwrap();
        assert_eq!(reparsed.cname_target().as_deref(), Some("target.example"));
    }

    #[test]
    fn display_distinguishes_rdata() {
        let a = DnsResource::new_a("x.com", 60, Ipv4Addr::new(1, 1, 1, 1));
        let b = DnsResource::new_a("x.com", 60, Ipv4Addr::new(2, 2, 2, 2));
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn soa_roundtrip() {
        let rr = DnsResource {
            labels: name::labels_from_name("example.com"),
            rtype: RecordType::Soa,
            rclass: RecordClass::In,
            ttl: 3600,
            rdata: RData::Soa {
                mname: name::labels_from_name("ns1.example.com"),
                rname: name::labels_from_name("hostmaster.example.com"),
                serial: 2024010101,
                refresh: 7200,
                retry: 3600,
                expire: 1209600,
                minimum: 300,
            },
        };
        let mut buf = Vec::new();
        rr.write(&mut buf).unwrap();
        let (parsed, _) = DnsResource::parse(&buf, 0).unwrap();
        assert_eq!(parsed, rr);
    }
}
