//! Reducing an answer to what gets stored: a content hash over its
//! records, and the validity window of its signature.

use sha2::{Digest, Sha256};

use dns_types::protocol::types::*;

use crate::aggregator::AnswerSet;

/// A signed answer, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalisedAnswer {
    pub domain: DomainName,
    pub rtype: RecordType,
    /// Hex SHA-256 of `rrdata`.
    pub hash: String,
    /// The presentation form of every non-signature record, sorted
    /// and newline-separated.
    pub rrdata: String,
    pub signature: RrsigFields,
}

/// Normalise an answer, or `None` if it is unsigned.
///
/// The signature with the highest algorithm number is used; among
/// equals, the last one in the answer.
pub fn normalise(answer: &AnswerSet) -> Option<NormalisedAnswer> {
    let mut signature: Option<RrsigFields> = None;
    let mut lines = Vec::with_capacity(answer.records.len());

    for rr in &answer.records {
        match rr.as_rrsig() {
            Some(sig) => {
                if signature.map_or(true, |current| sig.algorithm >= current.algorithm) {
                    signature = Some(sig);
                }
            }
            None => lines.push(rr.to_string()),
        }
    }

    let signature = signature?;
    lines.sort_unstable();
    let rrdata = lines.join("\n");

    Some(NormalisedAnswer {
        domain: answer.domain.clone(),
        rtype: answer.rtype,
        hash: content_hash(&rrdata),
        rrdata,
        signature,
    })
}

pub fn content_hash(rrdata: &str) -> String {
    hex::encode(Sha256::digest(rrdata.as_bytes()))
}

#[cfg(test)]
mod tests {
    use dns_types::protocol::types::test_util::*;

    use super::*;

    fn answer(records: Vec<ResourceRecord>) -> AnswerSet {
        AnswerSet {
            domain: domain("se."),
            rtype: RecordType::NS,
            records,
        }
    }

    #[test]
    fn hash_ignores_record_order() {
        let a = ns_record("se.", "a.ns.se.");
        let b = ns_record("se.", "b.ns.se.");
        let sig = rrsig_record("se.", RecordType::NS, 8, 100, 200);

        let forwards = normalise(&answer(vec![a.clone(), b.clone(), sig.clone()])).unwrap();
        let backwards = normalise(&answer(vec![sig, b, a])).unwrap();

        assert_eq!(forwards.hash, backwards.hash);
        assert_eq!(forwards.rrdata, backwards.rrdata);
    }

    #[test]
    fn rrdata_is_sorted_presentation() {
        let a = ns_record("se.", "a.ns.se.");
        let b = ns_record("se.", "b.ns.se.");

        let normalised = normalise(&answer(vec![
            b.clone(),
            rrsig_record("se.", RecordType::NS, 8, 100, 200),
            a.clone(),
        ]))
        .unwrap();

        assert_eq!(format!("{a}\n{b}"), normalised.rrdata);
        assert_eq!(content_hash(&normalised.rrdata), normalised.hash);
        assert_eq!(64, normalised.hash.len());
    }

    #[test]
    fn different_content_different_hash() {
        let sig = rrsig_record("se.", RecordType::NS, 8, 100, 200);

        let one = normalise(&answer(vec![ns_record("se.", "a.ns.se."), sig.clone()])).unwrap();
        let other = normalise(&answer(vec![ns_record("se.", "b.ns.se."), sig])).unwrap();

        assert_ne!(one.hash, other.hash);
    }

    #[test]
    fn unsigned_is_dropped() {
        assert_eq!(None, normalise(&answer(vec![ns_record("se.", "a.ns.se.")])));
        assert_eq!(None, normalise(&answer(Vec::new())));
    }

    #[test]
    fn highest_algorithm_signature_wins() {
        let normalised = normalise(&answer(vec![
            ns_record("se.", "a.ns.se."),
            rrsig_record("se.", RecordType::NS, 13, 300, 400),
            rrsig_record("se.", RecordType::NS, 8, 100, 200),
        ]))
        .unwrap();

        assert_eq!(
            RrsigFields {
                algorithm: 13,
                inception: 300,
                expiration: 400
            },
            normalised.signature
        );
    }

    #[test]
    fn last_signature_wins_ties() {
        let normalised = normalise(&answer(vec![
            rrsig_record("se.", RecordType::NS, 8, 100, 200),
            ns_record("se.", "a.ns.se."),
            rrsig_record("se.", RecordType::NS, 8, 300, 400),
        ]))
        .unwrap();

        assert_eq!(300, normalised.signature.inception);
        assert_eq!(400, normalised.signature.expiration);
    }

    #[test]
    fn signatures_are_not_hashed() {
        let ns = ns_record("se.", "a.ns.se.");

        let one = normalise(&answer(vec![
            ns.clone(),
            rrsig_record("se.", RecordType::NS, 8, 100, 200),
        ]))
        .unwrap();
        let other = normalise(&answer(vec![
            ns,
            rrsig_record("se.", RecordType::NS, 8, 300, 400),
        ]))
        .unwrap();

        assert_eq!(one.hash, other.hash);
    }
}
