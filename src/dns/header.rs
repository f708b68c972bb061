use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter};

use super::ParseError;

pub const HEADER_LEN: usize = 12;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: u8,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < HEADER_LEN {
            return Err(ParseError::InvalidHeader);
        }

        let mut reader = BitReader::<_, BigEndian>::new(&buf[..HEADER_LEN]);
        let mut header = DnsHeader {
            id: reader.read_var::<u16>(16)?,
            ..Default::default()
        };
        header.qr = reader.read_var::<u8>(1)? == 1;
        header.opcode = reader.read_var::<u8>(4)?;
        header.aa = reader.read_var::<u8>(1)? == 1;
        header.tc = reader.read_var::<u8>(1)? == 1;
        header.rd = reader.read_var::<u8>(1)? == 1;
        header.ra = reader.read_var::<u8>(1)? == 1;
        header.z = reader.read_var::<u8>(3)?;
        header.rcode = reader.read_var::<u8>(4)?;
        header.qdcount = reader.read_var::<u16>(16)?;
        header.ancount = reader.read_var::<u16>(16)?;
        header.nscount = reader.read_var::<u16>(16)?;
        header.arcount = reader.read_var::<u16>(16)?;
        Ok(header)
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        let mut writer = BitWriter::<_, BigEndian>::new(out);
        writer.write_var::<u16>(16, self.id)?;
        writer.write_var::<u8>(1, self.qr as u8)?;
        writer.write_var::<u8>(4, self.opcode)?;
        writer.write_var::<u8>(1, self.aa as u8)?;
        writer.write_var::<u8>(1, self.tc as u8)?;
        writer.write_var::<u8>(1, self.rd as u8)?;
        writer.write_var::<u8>(1, self.ra as u8)?;
        writer.write_var::<u8>(3, self.z)?;
        writer.write_var::<u8>(4, self.rcode)?;
        writer.write_var::<u16>(16, self.qdcount)?;
        writer.write_var::<u16>(16, self.ancount)?;
        writer.write_var::<u16>(16, self.nscount)?;
        writer.write_var::<u16>(16, self.arcount)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = DnsHeader {
            id: 0xbeef,
            qr: true,
            opcode: 0,
            aa: false,
            tc: true,
            rd: true,
            ra: true,
            z: 0,
            rcode: 3,
            qdcount: 1,
            ancount: 2,
            nscount: 0,
            arcount: 1,
        };

        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(DnsHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(matches!(
            DnsHeader::parse(&[0u8; 5]),
            Err(ParseError::InvalidHeader)
        ));
    }
}
