//! Turning a stream of zone records into exactly one job per
//! delegated domain.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use dns_types::protocol::types::*;

use crate::axfr::{RecordSource, TransferError};
use crate::executor::QueryPlan;
use crate::pool::{PoolError, ResolverPool};

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] discovery mutex poisoned, cannot recover from this - aborting";

/// Every domain seen so far, with the records its queries returned.
///
/// This is shared between the tracker, which claims domains, and the
/// query workers, which fill in their records.  Claiming is a single
/// check-and-insert under the lock, so a domain can only be claimed
/// once however many times it turns up.
#[derive(Debug, Clone, Default)]
pub struct SharedDiscoveries {
    discovered: Arc<Mutex<HashMap<DomainName, Vec<ResourceRecord>>>>,
}

impl SharedDiscoveries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a domain as seen.  Returns the number of domains seen,
    /// including this one, if it was not seen before.
    pub fn claim(&self, domain: &DomainName) -> Option<usize> {
        let mut discovered = self.discovered.lock().expect(MUTEX_POISON_MESSAGE);
        if discovered.contains_key(domain) {
            None
        } else {
            discovered.insert(domain.clone(), Vec::new());
            Some(discovered.len())
        }
    }

    pub fn append(&self, domain: &DomainName, records: Vec<ResourceRecord>) {
        self.discovered
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .entry(domain.clone())
            .or_default()
            .extend(records);
    }

    pub fn len(&self) -> usize {
        self.discovered.lock().expect(MUTEX_POISON_MESSAGE).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every domain and its records, ordered by domain.
    pub fn snapshot(&self) -> Vec<(DomainName, Vec<ResourceRecord>)> {
        let discovered = self.discovered.lock().expect(MUTEX_POISON_MESSAGE);
        discovered
            .iter()
            .map(|(domain, records)| (domain.clone(), records.clone()))
            .collect::<BTreeMap<_, _>>()
            .into_iter()
            .collect()
    }
}

/// How a crawl came to an end.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// The zone transfer completed.
    Exhausted,
    /// The domain limit was reached and the transfer abandoned.
    Stopped,
}

#[derive(Debug)]
pub struct DiscoveryTracker {
    apex: DomainName,
    max_domains: Option<usize>,
    discoveries: SharedDiscoveries,
}

impl DiscoveryTracker {
    /// A limit of zero means no limit.
    pub fn new(apex: DomainName, max_domains: usize) -> Self {
        Self {
            apex,
            max_domains: (max_domains > 0).then_some(max_domains),
            discoveries: SharedDiscoveries::new(),
        }
    }

    pub fn discoveries(&self) -> &SharedDiscoveries {
        &self.discoveries
    }

    /// The delegated domain named by a record, if it is one: an NS
    /// record which is not at the apex.
    pub fn candidate<'a>(&self, rr: &'a ResourceRecord) -> Option<&'a DomainName> {
        (rr.rtype() == RecordType::NS && rr.name != self.apex).then_some(&rr.name)
    }

    /// Read records until the source is exhausted or the domain limit
    /// is reached, submitting a discovery job for each newly seen
    /// domain.
    ///
    /// On reaching the limit the source is not read any further; the
    /// caller should drop it to release the transfer.
    ///
    /// # Errors
    ///
    /// If the source fails or the pool stops accepting jobs.
    pub async fn crawl<S: RecordSource>(
        &self,
        source: &mut S,
        pool: &ResolverPool,
    ) -> Result<CrawlOutcome, CrawlError> {
        while let Some(rr) = source.next_record().await? {
            let Some(domain) = self.candidate(&rr) else {
                continue;
            };

            if let Some(total) = self.discoveries.claim(domain) {
                tracing::debug!(%domain, total, "discovered domain");
                pool.submit(domain.clone(), QueryPlan::Discover(self.discoveries.clone()))
                    .await?;

                if self.max_domains.is_some_and(|max| total >= max) {
                    tracing::info!(total, "domain limit reached, stopping zone transfer");
                    return Ok(CrawlOutcome::Stopped);
                }
            }
        }

        Ok(CrawlOutcome::Exhausted)
    }
}

#[derive(Debug)]
pub enum CrawlError {
    Transfer(TransferError),
    Pool(PoolError),
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CrawlError::Transfer(error) => write!(f, "zone transfer failed: {error}"),
            CrawlError::Pool(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for CrawlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrawlError::Transfer(error) => Some(error),
            CrawlError::Pool(error) => Some(error),
        }
    }
}

impl From<TransferError> for CrawlError {
    fn from(error: TransferError) -> Self {
        CrawlError::Transfer(error)
    }
}

impl From<PoolError> for CrawlError {
    fn from(error: PoolError) -> Self {
        CrawlError::Pool(error)
    }
}
