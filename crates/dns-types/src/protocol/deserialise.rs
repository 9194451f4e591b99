//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use bytes::Bytes;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
        let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;

        let header = Header {
            id,
            is_response: flags1 & HEADER_MASK_QR != 0,
            opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
            is_authoritative: flags1 & HEADER_MASK_AA != 0,
            is_truncated: flags1 & HEADER_MASK_TC != 0,
            recursion_desired: flags1 & HEADER_MASK_RD != 0,
            recursion_available: flags2 & HEADER_MASK_RA != 0,
            rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
        };

        let mut questions = Vec::with_capacity(qdcount.into());
        for _ in 0..qdcount {
            questions.push(Question::deserialise(id, buffer)?);
        }

        let mut sections = [
            Vec::with_capacity(ancount.into()),
            Vec::with_capacity(nscount.into()),
            Vec::with_capacity(arcount.into()),
        ];
        for (section, count) in sections.iter_mut().zip([ancount, nscount, arcount]) {
            for _ in 0..count {
                section.push(ResourceRecord::deserialise(id, buffer)?);
            }
        }
        let [answers, authority, additional] = sections;

        Ok(Self {
            header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;
        let qclass = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;

        Ok(Self {
            name,
            qtype: QueryType::from(qtype),
            qclass: QueryClass::from(qclass),
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let rtype = RecordType::from(buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?);
        let rclass =
            RecordClass::from(buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?);
        let ttl = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
        let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;

        let rdata_start = buffer.position;
        let rdata_stop = rdata_start + usize::from(rdlength);

        let next_u8 = |buffer: &mut ConsumableBuffer| {
            buffer.next_u8().ok_or(Error::ResourceRecordTooShort(id))
        };
        let next_u16 = |buffer: &mut ConsumableBuffer| {
            buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))
        };
        let next_u32 = |buffer: &mut ConsumableBuffer| {
            buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))
        };
        // everything up to the end of the RDATA
        let rest = |buffer: &mut ConsumableBuffer| {
            rdata_stop
                .checked_sub(buffer.position)
                .and_then(|len| buffer.take(len))
                .map(Bytes::copy_from_slice)
                .ok_or(Error::ResourceRecordInvalid(id))
        };

        // for records which include domain names, deserialise them to
        // expand pointers.
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(next_u32(buffer)?),
            },
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::SOA => RecordTypeWithData::SOA {
                mname: DomainName::deserialise(id, buffer)?,
                rname: DomainName::deserialise(id, buffer)?,
                serial: next_u32(buffer)?,
                refresh: next_u32(buffer)?,
                retry: next_u32(buffer)?,
                expire: next_u32(buffer)?,
                minimum: next_u32(buffer)?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::MX => RecordTypeWithData::MX {
                preference: next_u16(buffer)?,
                exchange: DomainName::deserialise(id, buffer)?,
            },
            RecordType::TXT => RecordTypeWithData::TXT {
                octets: rest(buffer)?,
            },
            RecordType::AAAA => {
                let octets = buffer.take(16).ok_or(Error::ResourceRecordTooShort(id))?;
                let mut address = [0; 16];
                address.copy_from_slice(octets);
                RecordTypeWithData::AAAA {
                    address: Ipv6Addr::from(address),
                }
            }
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: next_u16(buffer)?,
                weight: next_u16(buffer)?,
                port: next_u16(buffer)?,
                target: DomainName::deserialise(id, buffer)?,
            },
            RecordType::OPT => RecordTypeWithData::OPT {
                options: rest(buffer)?,
            },
            RecordType::DS => RecordTypeWithData::DS {
                key_tag: next_u16(buffer)?,
                algorithm: next_u8(buffer)?,
                digest_type: next_u8(buffer)?,
                digest: rest(buffer)?,
            },
            RecordType::RRSIG => RecordTypeWithData::RRSIG {
                type_covered: RecordType::from(next_u16(buffer)?),
                algorithm: next_u8(buffer)?,
                labels: next_u8(buffer)?,
                original_ttl: next_u32(buffer)?,
                signature_expiration: next_u32(buffer)?,
                signature_inception: next_u32(buffer)?,
                key_tag: next_u16(buffer)?,
                signer_name: DomainName::deserialise(id, buffer)?,
                signature: rest(buffer)?,
            },
            RecordType::DNSKEY => RecordTypeWithData::DNSKEY {
                flags: next_u16(buffer)?,
                protocol: next_u8(buffer)?,
                algorithm: next_u8(buffer)?,
                public_key: rest(buffer)?,
            },
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: rest(buffer)?,
            },
        };

        if buffer.position == rdata_stop {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
            })
        } else {
            Err(Error::ResourceRecordInvalid(id))
        }
    }
}

impl DomainName {
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut labels = Vec::<Label>::with_capacity(5);
        let mut len = 0;
        let start = buffer.position;

        loop {
            let size = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;

            if usize::from(size) <= LABEL_MAX_LEN {
                len += 1 + usize::from(size);

                if size == 0 {
                    labels.push(Label::new());
                    break;
                }

                let os = buffer
                    .take(size.into())
                    .ok_or(Error::DomainTooShort(id))?;
                // the length was checked above
                labels.push(Label::try_from(os).map_err(|_| Error::DomainLabelInvalid(id))?);

                if len > DOMAINNAME_MAX_LEN {
                    return Err(Error::DomainTooLong(id));
                }
            } else if size >= 192 {
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;
                let ptr = u16::from_be_bytes([hi, lo]).into();

                // pointers may only go backwards (RFC 1035 section
                // 4.1.4), which also rules out loops
                if ptr >= start {
                    return Err(Error::DomainPointerInvalid(id));
                }

                let other = DomainName::deserialise(id, &mut buffer.at_offset(ptr))?;
                len += other.len;
                labels.extend(other.labels);
                break;
            } else {
                return Err(Error::DomainLabelInvalid(id));
            }
        }

        if len <= DOMAINNAME_MAX_LEN {
            Ok(DomainName { labels, len })
        } else {
            Err(Error::DomainTooLong(id))
        }
    }
}

/// Errors encountered when parsing a message.  In all the errors
/// which have a `u16` parameter, that is the ID from the header.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The message is not even 2 octets long, so it doesn't even
    /// contain an ID.
    CompletelyBusted,

    /// The header is missing one or more required fields.
    HeaderTooShort(u16),

    /// A question ends with an incomplete field.
    QuestionTooShort(u16),

    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort(u16),

    /// A resource record's RDATA does not match its RDLENGTH.
    ResourceRecordInvalid(u16),

    /// A domain is incomplete.
    DomainTooShort(u16),

    /// A domain is over 255 octets in size.
    DomainTooLong(u16),

    /// A domain pointer points to or after the current name.
    DomainPointerInvalid(u16),

    /// A domain label is longer than 63 octets, but not a pointer.
    DomainLabelInvalid(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id)
            | Error::QuestionTooShort(id)
            | Error::ResourceRecordTooShort(id)
            | Error::ResourceRecordInvalid(id)
            | Error::DomainTooShort(id)
            | Error::DomainTooLong(id)
            | Error::DomainPointerInvalid(id)
            | Error::DomainLabelInvalid(id) => Some(id),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CompletelyBusted => write!(f, "message has no ID"),
            Error::HeaderTooShort(_) => write!(f, "header too short"),
            Error::QuestionTooShort(_) => write!(f, "question too short"),
            Error::ResourceRecordTooShort(_) => write!(f, "resource record too short"),
            Error::ResourceRecordInvalid(_) => write!(f, "resource record RDATA invalid"),
            Error::DomainTooShort(_) => write!(f, "domain name too short"),
            Error::DomainTooLong(_) => write!(f, "domain name too long"),
            Error::DomainPointerInvalid(_) => write!(f, "domain name pointer invalid"),
            Error::DomainLabelInvalid(_) => write!(f, "domain name label invalid"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        let octet = *self.octets.get(self.position)?;
        self.position += 1;
        Some(octet)
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        let octets = self.take(2)?;
        Some(u16::from_be_bytes([octets[0], octets[1]]))
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        let octets = self.take(4)?;
        Some(u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]))
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        let slice = self.octets.get(self.position..self.position + size)?;
        self.position += size;
        Some(slice)
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}
