//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If a section or an RDATA field is too long to be counted in 16
    /// bits.
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If a section or an RDATA field is too long to be counted in 16
    /// bits.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        let mut flags1 = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        if self.is_response {
            flags1 |= HEADER_MASK_QR;
        }
        if self.is_authoritative {
            flags1 |= HEADER_MASK_AA;
        }
        if self.is_truncated {
            flags1 |= HEADER_MASK_TC;
        }
        if self.recursion_desired {
            flags1 |= HEADER_MASK_RD;
        }

        let mut flags2 = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);
        if self.recursion_available {
            flags2 |= HEADER_MASK_RA;
        }

        buffer.write_u16(self.id);
        buffer.write_u8(flags1);
        buffer.write_u8(flags2);
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer, true);
        buffer.write_u16(self.qtype.into());
        buffer.write_u16(self.qclass.into());
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer, true);
        buffer.write_u16(self.rtype().into());
        buffer.write_u16(self.rclass.into());
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match &self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer, false),
            RecordTypeWithData::CNAME { cname } => cname.serialise(buffer, false),
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer, false);
                rname.serialise(buffer, false);
                buffer.write_u32(*serial);
                buffer.write_u32(*refresh);
                buffer.write_u32(*retry);
                buffer.write_u32(*expire);
                buffer.write_u32(*minimum);
            }
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer, false),
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference);
                exchange.serialise(buffer, false);
            }
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority);
                buffer.write_u16(*weight);
                buffer.write_u16(*port);
                target.serialise(buffer, false);
            }
            RecordTypeWithData::DS {
                key_tag,
                algorithm,
                digest_type,
                digest,
            } => {
                buffer.write_u16(*key_tag);
                buffer.write_u8(*algorithm);
                buffer.write_u8(*digest_type);
                buffer.write_octets(digest);
            }
            RecordTypeWithData::RRSIG {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                signature_expiration,
                signature_inception,
                key_tag,
                signer_name,
                signature,
            } => {
                buffer.write_u16((*type_covered).into());
                buffer.write_u8(*algorithm);
                buffer.write_u8(*labels);
                buffer.write_u32(*original_ttl);
                buffer.write_u32(*signature_expiration);
                buffer.write_u32(*signature_inception);
                buffer.write_u16(*key_tag);
                signer_name.serialise(buffer, false);
                buffer.write_octets(signature);
            }
            RecordTypeWithData::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
            } => {
                buffer.write_u16(*flags);
                buffer.write_u8(*protocol);
                buffer.write_u8(*algorithm);
                buffer.write_octets(public_key);
            }
            RecordTypeWithData::TXT { octets }
            | RecordTypeWithData::OPT { options: octets }
            | RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(octets),
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        if compress {
            if let Some(ptr) = buffer.name_pointer(self) {
                buffer.write_u16(ptr);
                return;
            }
        }

        buffer.memoise_name(self);
        for label in &self.labels {
            buffer.write_u8(label.len());
            buffer.write_octets(label.octets());
        }
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: BytesMut,
    name_pointers: HashMap<DomainName, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: BytesMut::with_capacity(512),
            name_pointers: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    /// Remember where `name` starts, so later occurrences can point
    /// back to it.  Only offsets which fit in 14 bits are usable.
    pub fn memoise_name(&mut self, name: &DomainName) {
        if name.is_root() || self.name_pointers.contains_key(name) {
            return;
        }

        if let Ok(index) = u16::try_from(self.index()) {
            if index <= 0b0011_1111_1111_1111 {
                self.name_pointers.insert(name.clone(), index | 0b1100_0000_0000_0000);
            }
        }
    }

    pub fn name_pointer(&self, name: &DomainName) -> Option<u16> {
        self.name_pointers.get(name).copied()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.octets.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.octets.put_u32(value);
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    u16::try_from(counter).map_err(|_| Error::CounterTooLarge {
        counter,
        bits: u16::BITS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_name_compression() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        domain("nic.se.").serialise(&mut buf, true);
        domain("nic.se.").serialise(&mut buf, true);
        domain("nic.se.").serialise(&mut buf, false);

        assert_eq!(
            vec![
                1, 2,
                3, 110, 105, 99, // "nic"
                2, 115, 101, 0, // "se"
                0b1100_0000, 0b0000_0010, // pointer
                3, 110, 105, 99, // "nic"
                2, 115, 101, 0, // "se"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_rrsig_signer_not_compressed() {
        let mut buf = WritableBuffer::default();
        let rr = rrsig_record("se.", RecordType::NS, 8, 0x0102_0304, 0x0506_0708);
        rr.serialise(&mut buf).unwrap();

        assert_eq!(
            vec![
                // NAME
                2, 115, 101, 0, // "se"
                // TYPE
                0, 46, // RRSIG
                // CLASS
                0, 1, // IN
                // TTL
                0, 0, 0x0e, 0x10, // 3600
                // RDLENGTH
                0, 42,
                // RDATA
                0, 2, // type covered: NS
                8, // algorithm
                1, // labels
                0, 0, 0x0e, 0x10, // original ttl
                5, 6, 7, 8, // expiration
                1, 2, 3, 4, // inception
                0x30, 0x39, // key tag: 12345
                2, 115, 101, 0, // signer, in full
                110, 111, 116, 32, 97, 32, 114, 101, 97, 108, 32, // "not a real "
                115, 105, 103, 110, 97, 116, 117, 114, 101, // "signature"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_query_with_edns() {
        let query = Message::from_question(
            0xabcd,
            Question {
                name: DomainName::root_domain(),
                qtype: QueryType::Record(RecordType::DNSKEY),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        )
        .with_edns(1232, true);

        assert_eq!(
            vec![
                0xab, 0xcd, // id
                0, 0, // flags
                0, 1, 0, 0, 0, 0, 0, 1, // counts
                0, // QNAME
                0, 48, // QTYPE
                0, 1, // QCLASS
                0, // NAME
                0, 41, // TYPE: OPT
                0x04, 0xd0, // CLASS: 1232
                0, 0, 0x80, 0, // TTL: DO
                0, 0, // RDLENGTH
            ],
            query.to_octets().unwrap(),
        );
    }
}
