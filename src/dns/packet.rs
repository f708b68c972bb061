use super::{DnsHeader, DnsQuestion, DnsResource, HEADER_LEN, ParseError, RecordType, rcode};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsResource>,
    pub authorities: Vec<DnsResource>,
    pub additionals: Vec<DnsResource>,
}

impl DnsPacket {
    /// Build a query packet with a single question.
    pub fn query(id: u16, qname: &str, qtype: RecordType) -> Self {
        let mut packet = DnsPacket {
            header: DnsHeader {
                id,
                rd: true,
                ..Default::default()
            },
            ..Default::default()
        };
        packet.questions.push(DnsQuestion::new(qname, qtype));
        packet.sync_counts();
        packet
    }

    /// Build an empty reply to `req`: id and question echoed, QR set, RD
    /// copied, RA set. Answers are filled in by the caller.
    pub fn reply_to(req: &DnsPacket) -> Self {
        let mut reply = DnsPacket {
            header: DnsHeader {
                id: req.header.id,
                qr: true,
                opcode: req.header.opcode,
                rd: req.header.rd,
                ra: true,
                ..Default::default()
            },
            questions: req.questions.clone(),
            ..Default::default()
        };
        reply.sync_counts();
        reply
    }

    /// SERVFAIL (or any other rcode) reply with no answers.
    pub fn reply_with_rcode(req: &DnsPacket, code: u8) -> Self {
        let mut reply = Self::reply_to(req);
        reply.header.rcode = code;
        reply
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let header = DnsHeader::parse(buf)?;
        let mut pos = HEADER_LEN;

        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            let (question, next) = DnsQuestion::parse(buf, pos)?;
            questions.push(question);
            pos = next;
        }

        let mut read_section = |count: u16, pos: &mut usize| -> Result<Vec<DnsResource>, ParseError> {
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (record, next) = DnsResource::parse(buf, *pos)?;
                records.push(record);
                *pos = next;
            }
            Ok(records)
        };

        let answers = read_section(header.ancount, &mut pos)?;
        let authorities = read_section(header.nscount, &mut pos)?;
        let additionals = read_section(header.arcount, &mut pos)?;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut packet = self.clone();
        packet.sync_counts();

        let mut out = Vec::with_capacity(512);
        packet.header.write(&mut out)?;
        for question in &packet.questions {
            question.write(&mut out)?;
        }
        for record in packet
            .answers
            .iter()
            .chain(&packet.authorities)
            .chain(&packet.additionals)
        {
            record.write(&mut out)?;
        }
        Ok(out)
    }

    /// Bring the header counts in line with the section vectors.
    pub fn sync_counts(&mut self) {
        self.header.qdcount = self.questions.len() as u16;
        self.header.ancount = self.answers.len() as u16;
        self.header.nscount = self.authorities.len() as u16;
        self.header.arcount = self.additionals.len() as u16;
    }

    pub fn first_question(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }

    pub fn is_truncated(&self) -> bool {
        self.header.tc
    }

    pub fn is_servfail(&self) -> bool {
        self.header.rcode == rcode::SERVFAIL
    }

    /// True when any answer is an address record (A or AAAA).
    pub fn has_address_answer(&self) -> bool {
        self.answers.iter().any(DnsResource::is_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{RData, RecordClass};
    use std::net::Ipv4Addr;

    #[test]
    fn query_roundtrip() {
        let query = DnsPacket::query(0x1234, "example.com", RecordType::A);
        let bytes = query.to_bytes().unwrap();
        let parsed = DnsPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, query);
    }

    #[test]
    fn reply_echoes_id_and_question() {
        let query = DnsPacket::query(7, "example.com", RecordType::A);
        let mut reply = DnsPacket::reply_to(&query);
        reply
            .answers
            .push(DnsResource::new_a("example.com", 60, Ipv4Addr::new(10, 0, 0, 1)));

        let bytes = reply.to_bytes().unwrap();
        let parsed = DnsPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.header.id, 7);
        assert!(parsed.header.qr);
        assert_eq!(parsed.header.ancount, 1);
        assert_eq!(parsed.questions, query.questions);
    }

    #[test]
    fn synthesised_reply_roundtrips_identically() {
        let query = DnsPacket::query(99, "blocked.example", RecordType::A);
        let mut reply = DnsPacket::reply_to(&query);
        reply.answers.push(DnsResource::new_a(
            "blocked.example",
            600,
            Ipv4Addr::UNSPECIFIED,
        ));
        reply.sync_counts();

        let bytes = reply.to_bytes().unwrap();
        let parsed = DnsPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn parses_response_with_compressed_answers() {
        // Hand-built response: question example.com A, answer with pointer
        // to the question name.
        let query = DnsPacket::query(1, "example.com", RecordType::A);
        let mut bytes = query.to_bytes().unwrap();
        bytes[2] |= 0x80; // QR
        bytes[7] = 1; // ancount = 1

        bytes.push(0xC0);
        bytes.push(HEADER_LEN as u8); // name pointer to question
        bytes.extend_from_slice(&u16::from(RecordType::A).to_be_bytes());
        bytes.extend_from_slice(&u16::from(RecordClass::In).to_be_bytes());
        bytes.extend_from_slice(&30u32.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&[93, 184, 216, 34]);

        let parsed = DnsPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].name(), "example.com");
        assert_eq!(
            parsed.answers[0].rdata,
            RData::A(Ipv4Addr::new(93, 184, 216, 34))
        );
    }
}
