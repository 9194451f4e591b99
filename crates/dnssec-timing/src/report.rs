//! Summaries of stored measurements.
//!
//! A signature's lifetime is the time left until it expires, as seen
//! from the pass which fetched it.  Most reports compare that to the
//! SOA expire value fetched for the same domain in the same pass.

use chrono::DateTime;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use dns_types::protocol::types::*;

use crate::store::{Store, StoreError};

const DAY: i64 = 86400;

/// Upper bounds of the `remaining` buckets.
pub const REMAINING_BUCKETS: [i64; 5] = [DAY, 3 * DAY, 7 * DAY, 14 * DAY, 35 * DAY];

/// The record types reports can be run over.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReportType {
    NS,
    DNSKEY,
}

impl FromStr for ReportType {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NS" => Ok(ReportType::NS),
            "DNSKEY" => Ok(ReportType::DNSKEY),
            _ => Err(ReportError::BadType(s.to_string())),
        }
    }
}

impl From<ReportType> for RecordType {
    fn from(rtype: ReportType) -> Self {
        match rtype {
            ReportType::NS => RecordType::NS,
            ReportType::DNSKEY => RecordType::DNSKEY,
        }
    }
}

/// The SOA expire field from the stored text of an SOA record set.
pub fn soa_expire(rrdata: &str) -> Option<u32> {
    let fields = rrdata.lines().next()?.split_whitespace().collect::<Vec<_>>();
    if fields.len() < 11 || fields[3] != "SOA" {
        return None;
    }
    fields[fields.len() - 2].parse().ok()
}

/// A two-letter top-level domain, like `se.`.
pub fn is_cctld(domain: &str) -> bool {
    domain.len() == 3
}

/// Which `remaining` bucket a lifetime falls in, if any.
pub fn remaining_bucket(lifetime: i64) -> Option<usize> {
    if lifetime < 0 {
        return None;
    }
    REMAINING_BUCKETS
        .iter()
        .position(|bound| lifetime < *bound)
}

/// How a signature lifetime compares to the RFC 6781 advice that it
/// be three to four times the SOA expire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rfc6781Class {
    Short,
    Ok,
    Long,
}

impl Rfc6781Class {
    pub fn classify(expire: u32, lifetime: i64) -> Self {
        let expire = i64::from(expire);
        if expire < 3 * lifetime {
            Rfc6781Class::Short
        } else if expire <= 4 * lifetime {
            Rfc6781Class::Ok
        } else {
            Rfc6781Class::Long
        }
    }
}

/// The date part of a pass timestamp.
pub fn pass_date(resolved: i64) -> String {
    DateTime::from_timestamp(resolved, 0)
        .map_or_else(|| resolved.to_string(), |dt| dt.format("%Y-%m-%d").to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireRow {
    pub resolved: i64,
    pub domain: String,
    pub expire: u32,
}

impl fmt::Display for ExpireRow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", pass_date(self.resolved), self.domain, self.expire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifetimeRow {
    pub resolved: i64,
    pub lifetime: i64,
    pub expire: u32,
}

impl fmt::Display for LifetimeRow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", pass_date(self.resolved), self.lifetime, self.expire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemainingRow {
    pub resolved: i64,
    pub counts: [u64; 5],
}

impl fmt::Display for RemainingRow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", pass_date(self.resolved))?;
        for count in self.counts {
            write!(f, " {count}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FailedRow {
    pub resolved: i64,
    pub cc_ok: u64,
    pub cc_fail: u64,
    pub gtld_ok: u64,
    pub gtld_fail: u64,
}

impl fmt::Display for FailedRow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            pass_date(self.resolved),
            self.cc_ok,
            self.cc_fail,
            self.gtld_ok,
            self.gtld_fail
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Rfc6781Row {
    pub resolved: i64,
    /// Short, ok, long.
    pub cc: [u64; 3],
    pub gtld: [u64; 3],
}

impl fmt::Display for Rfc6781Row {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", pass_date(self.resolved))?;
        for count in self.cc.iter().chain(self.gtld.iter()) {
            write!(f, " {count}")?;
        }
        Ok(())
    }
}

/// Every SOA expire value, by pass and domain.
pub async fn expire(store: &Store) -> Result<Vec<ExpireRow>, ReportError> {
    soa_expires(store, None).await
}

/// Signature lifetime against SOA expire for one domain, for each pass
/// which has both.
pub async fn lifetime(
    store: &Store,
    domain: &DomainName,
    rtype: ReportType,
) -> Result<Vec<LifetimeRow>, ReportError> {
    let domain = domain.to_dotted_string();
    let expires = soa_expires(store, Some(&domain))
        .await?
        .into_iter()
        .map(|row| (row.resolved, row.expire))
        .collect::<BTreeMap<_, _>>();

    Ok(expirations(store, rtype, Some(&domain))
        .await?
        .into_iter()
        .filter_map(|(resolved, _, expiration)| {
            expires.get(&resolved).map(|expire| LifetimeRow {
                resolved,
                lifetime: expiration - resolved,
                expire: *expire,
            })
        })
        .collect())
}

/// How many signatures, per pass, have under 1, 3, 7, 14, and 35 days
/// left.
pub async fn remaining(store: &Store, rtype: ReportType) -> Result<Vec<RemainingRow>, ReportError> {
    let mut by_pass: BTreeMap<i64, [u64; 5]> = BTreeMap::new();

    for (resolved, domain, expiration) in expirations(store, rtype, None).await? {
        let lifetime = expiration - resolved;
        let counts = by_pass.entry(resolved).or_default();
        match remaining_bucket(lifetime) {
            Some(bucket) => {
                if bucket == 0 {
                    tracing::info!(%domain, lifetime, "signature expires within a day");
                }
                counts[bucket] += 1;
            }
            None => tracing::debug!(%domain, lifetime, "signature outside every bucket"),
        }
    }

    Ok(by_pass
        .into_iter()
        .map(|(resolved, counts)| RemainingRow { resolved, counts })
        .collect())
}

/// Per pass, how many ccTLDs and gTLDs have a signature lifetime
/// shorter than their SOA expire.
pub async fn failed(store: &Store, rtype: ReportType) -> Result<Vec<FailedRow>, ReportError> {
    let joined = lifetimes_with_expire(store, rtype).await?;

    Ok(joined
        .into_iter()
        .map(|(resolved, domains)| {
            let mut row = FailedRow {
                resolved,
                ..FailedRow::default()
            };
            for (domain, (lifetime, expire)) in domains {
                let failed = lifetime < i64::from(expire);
                match (is_cctld(&domain), failed) {
                    (true, false) => row.cc_ok += 1,
                    (true, true) => row.cc_fail += 1,
                    (false, false) => row.gtld_ok += 1,
                    (false, true) => row.gtld_fail += 1,
                }
            }
            row
        })
        .collect())
}

/// Per pass, how many ccTLDs and gTLDs have signature lifetimes
/// shorter than, within, or longer than RFC 6781 advises.
pub async fn rfc6781(store: &Store, rtype: ReportType) -> Result<Vec<Rfc6781Row>, ReportError> {
    let joined = lifetimes_with_expire(store, rtype).await?;

    Ok(joined
        .into_iter()
        .map(|(resolved, domains)| {
            let mut row = Rfc6781Row {
                resolved,
                ..Rfc6781Row::default()
            };
            for (domain, (lifetime, expire)) in domains {
                let counts = if is_cctld(&domain) {
                    &mut row.cc
                } else {
                    &mut row.gtld
                };
                match Rfc6781Class::classify(expire, lifetime) {
                    Rfc6781Class::Short => counts[0] += 1,
                    Rfc6781Class::Ok => counts[1] += 1,
                    Rfc6781Class::Long => counts[2] += 1,
                }
            }
            row
        })
        .collect())
}

/// For every pass with SOA data: each domain's (lifetime, expire),
/// where the domain has both.
async fn lifetimes_with_expire(
    store: &Store,
    rtype: ReportType,
) -> Result<BTreeMap<i64, BTreeMap<String, (i64, u32)>>, ReportError> {
    let mut expires: BTreeMap<i64, BTreeMap<String, u32>> = BTreeMap::new();
    for row in soa_expires(store, None).await? {
        expires
            .entry(row.resolved)
            .or_default()
            .insert(row.domain, row.expire);
    }

    let mut joined: BTreeMap<i64, BTreeMap<String, (i64, u32)>> = expires
        .keys()
        .map(|resolved| (*resolved, BTreeMap::new()))
        .collect();
    for (resolved, domain, expiration) in expirations(store, rtype, None).await? {
        let Some(expire) = expires.get(&resolved).and_then(|d| d.get(&domain)) else {
            continue;
        };
        let lifetime = expiration - resolved;
        joined
            .entry(resolved)
            .or_default()
            .insert(domain, (lifetime, *expire));
    }

    Ok(joined)
}

async fn soa_expires(store: &Store, domain: Option<&str>) -> Result<Vec<ExpireRow>, ReportError> {
    let rows: Vec<(i64, String, String)> = sqlx::query_as(
        "SELECT t.resolved, t.domain, c.rrdata
         FROM timing t JOIN content c ON t.hash = c.hash
         WHERE t.rrtype = ? AND (? IS NULL OR t.domain = ?)
         ORDER BY t.resolved, t.domain, t.id",
    )
    .bind(i64::from(u16::from(RecordType::SOA)))
    .bind(domain)
    .bind(domain)
    .fetch_all(store.pool())
    .await
    .map_err(StoreError::from)?;

    rows.into_iter()
        .map(|(resolved, domain, rrdata)| match soa_expire(&rrdata) {
            Some(expire) => Ok(ExpireRow {
                resolved,
                domain,
                expire,
            }),
            None => Err(ReportError::BadSoa(rrdata)),
        })
        .collect()
}

/// (resolved, domain, expiration) of every signature of the type.
async fn expirations(
    store: &Store,
    rtype: ReportType,
    domain: Option<&str>,
) -> Result<Vec<(i64, String, i64)>, ReportError> {
    let rows = sqlx::query_as(
        "SELECT resolved, domain, expiration FROM timing
         WHERE rrtype = ? AND (? IS NULL OR domain = ?)
         ORDER BY resolved, domain, id",
    )
    .bind(i64::from(u16::from(RecordType::from(rtype))))
    .bind(domain)
    .bind(domain)
    .fetch_all(store.pool())
    .await
    .map_err(StoreError::from)?;

    Ok(rows)
}

#[derive(Debug)]
pub enum ReportError {
    Store(StoreError),
    /// Only NS and DNSKEY can be reported on.
    BadType(String),
    /// Stored SOA content which could not be read.
    BadSoa(String),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReportError::Store(error) => write!(f, "{error}"),
            ReportError::BadType(s) => write!(f, "unsupported record type '{s}', expected NS or DNSKEY"),
            ReportError::BadSoa(rrdata) => write!(f, "could not parse stored SOA record '{rrdata}'"),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Store(error) => Some(error),
            _ => None,
        }
    }
}

impl From<StoreError> for ReportError {
    fn from(error: StoreError) -> Self {
        ReportError::Store(error)
    }
}
