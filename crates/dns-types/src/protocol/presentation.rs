//! Canonical text rendering of resource records, one record per line
//! in the usual master-file style:
//!
//! ```text
//! se.	3600	IN	DNSKEY	257 3 8 AwEAAc...
//! ```
//!
//! Fields are separated by tabs, names are always fully qualified,
//! and binary fields use the encodings of RFC 4034 section 2.2, 3.2,
//! and 5.3.

use bytes::Bytes;
use chrono::DateTime;
use std::fmt;

use crate::protocol::types::*;

impl fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}",
            serialise_name(&self.name),
            self.ttl,
            self.rclass,
            self.rtype(),
            self.rtype_with_data
        )
    }
}

impl fmt::Display for RecordTypeWithData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordTypeWithData::A { address } => write!(f, "{address}"),
            RecordTypeWithData::NS { nsdname } => write!(f, "{}", serialise_name(nsdname)),
            RecordTypeWithData::CNAME { cname } => write!(f, "{}", serialise_name(cname)),
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => write!(
                f,
                "{} {} {serial} {refresh} {retry} {expire} {minimum}",
                serialise_name(mname),
                serialise_name(rname),
            ),
            RecordTypeWithData::PTR { ptrdname } => write!(f, "{}", serialise_name(ptrdname)),
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => write!(f, "{preference} {}", serialise_name(exchange)),
            RecordTypeWithData::TXT { octets } => match character_strings(octets) {
                Some(strings) => write!(f, "{}", strings.join(" ")),
                None => write!(f, "{}", serialise_unknown(octets)),
            },
            RecordTypeWithData::AAAA { address } => write!(f, "{address}"),
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => write!(f, "{priority} {weight} {port} {}", serialise_name(target)),
            RecordTypeWithData::DS {
                key_tag,
                algorithm,
                digest_type,
                digest,
            } => write!(
                f,
                "{key_tag} {algorithm} {digest_type} {}",
                hex::encode_upper(digest)
            ),
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
            } => write!(
                f,
                "{type_covered} {algorithm} {labels} {original_ttl} {} {} {key_tag} {} {}",
                serialise_timestamp(*signature_expiration),
                serialise_timestamp(*signature_inception),
                serialise_name(signer_name),
                base64::encode(signature),
            ),
            RecordTypeWithData::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
            } => write!(
                f,
                "{flags} {protocol} {algorithm} {}",
                base64::encode(public_key)
            ),
            RecordTypeWithData::OPT { options: octets }
            | RecordTypeWithData::Unknown { octets, .. } => {
                write!(f, "{}", serialise_unknown(octets))
            }
        }
    }
}

fn serialise_name(name: &DomainName) -> String {
    serialise_octets(name.to_dotted_string().as_bytes(), false)
}

/// `YYYYMMDDHHmmSS` in UTC.  Values are taken as plain seconds since
/// the epoch, which holds until 2106.
fn serialise_timestamp(timestamp: u32) -> String {
    match DateTime::from_timestamp(i64::from(timestamp), 0) {
        Some(datetime) => datetime.format("%Y%m%d%H%M%S").to_string(),
        None => timestamp.to_string(),
    }
}

/// The generic RDATA encoding of RFC 3597 section 5.
fn serialise_unknown(octets: &Bytes) -> String {
    if octets.is_empty() {
        "\\# 0".to_string()
    } else {
        format!("\\# {} {}", octets.len(), hex::encode_upper(octets))
    }
}

/// Split length-prefixed character strings, quoting each.  `None` if
/// a length runs past the end.
fn character_strings(octets: &[u8]) -> Option<Vec<String>> {
    let mut strings = Vec::new();
    let mut rest = octets;
    while let Some((len, tail)) = rest.split_first() {
        let len = usize::from(*len);
        if tail.len() < len {
            return None;
        }
        strings.push(serialise_octets(&tail[..len], true));
        rest = &tail[len..];
    }
    Some(strings)
}

/// Serialise a string of octets to a quoted or unquoted string with
/// the appropriate escaping.
fn serialise_octets(octets: &[u8], quoted: bool) -> String {
    let mut out = String::with_capacity(2 + octets.len());

    if quoted {
        out.push('"');
    }

    for octet in octets {
        if *octet == b'"' || *octet == b'\\' || *octet == b';' || *octet == b'(' || *octet == b')' {
            out.push('\\');
            out.push(*octet as char);
        } else if *octet < 32 || *octet > 126 || (*octet == 32 && !quoted) {
            out.push_str(&format!("\\{octet:03}"));
        } else {
            out.push(*octet as char);
        }
    }

    if quoted {
        out.push('"');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    fn renders_ns() {
        assert_eq!(
            "se.\t300\tIN\tNS\ta.ns.se.",
            ns_record("se.", "a.ns.se.").to_string()
        );
    }

    #[test]
    fn renders_soa() {
        assert_eq!(
            "se.\t300\tIN\tSOA\tns.se. hostmaster.se. 1 3600 600 864000 300",
            soa_record("se.", 864_000).to_string()
        );
    }

    #[test]
    fn renders_ds_digest_as_upper_hex() {
        assert_eq!(
            "se.\t3600\tIN\tDS\t59407 8 2 DEADBEEF",
            ds_record("se.", 59407, &[0xde, 0xad, 0xbe, 0xef]).to_string()
        );
    }

    #[test]
    fn renders_dnskey_as_base64() {
        assert_eq!(
            "se.\t3600\tIN\tDNSKEY\t257 3 8 aGVsbG8=",
            dnskey_record("se.", 8, b"hello").to_string()
        );
    }

    #[test]
    fn renders_rrsig_timestamps() {
        assert_eq!(
            "se.\t3600\tIN\tRRSIG\tNS 13 1 3600 20231205200000 20231114221320 12345 se. bm90IGEgcmVhbCBzaWduYXR1cmU=",
            rrsig_record("se.", RecordType::NS, 13, 1_700_000_000, 1_701_806_400).to_string()
        );
    }

    #[test]
    fn renders_unknown_generically() {
        assert_eq!(
            "se.\t300\tIN\tTYPE100\t\\# 2 0AFF",
            unknown_record("se.", &[10, 255]).to_string()
        );
    }

    #[test]
    fn renders_txt_strings() {
        let rr = ResourceRecord {
            rtype_with_data: RecordTypeWithData::TXT {
                octets: Bytes::from_static(b"\x05hello\x07a \"b\" c"),
            },
            ..a_record("se.", std::net::Ipv4Addr::LOCALHOST)
        };
        assert_eq!("se.\t300\tIN\tTXT\t\"hello\" \"a \\\"b\\\" c\"", rr.to_string());
    }

    #[test]
    fn serialise_octets_special() {
        assert_eq!("\\012", serialise_octets(&[12], false));
        assert_eq!("\\234", serialise_octets(&[234], false));
        assert_eq!("\\\\", serialise_octets(b"\\", false));
        assert_eq!("\\032", serialise_octets(b" ", false));
        assert_eq!("\" \"", serialise_octets(b" ", true));
    }
}
