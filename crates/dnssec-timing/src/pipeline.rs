//! The two ways of running a measurement pass, from a list of domains
//! or by crawling a zone.  Either way the queries and the writer run
//! side by side, and a failure in one stops the other.

use std::fmt;
use std::io;
use tokio::io::AsyncBufRead;

use dns_types::protocol::types::*;

use crate::aggregator;
use crate::axfr::RecordSource;
use crate::config::{Config, ConfigError};
use crate::discovery::{CrawlError, CrawlOutcome, DiscoveryTracker};
use crate::domains::DomainList;
use crate::executor::{QueryExecutor, QueryPlan};
use crate::nameserver::Exchange;
use crate::pool::{PoolError, ResolverPool};
use crate::store::{Store, StoreError, WriteSummary};

/// The result of crawling a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlReport {
    pub outcome: CrawlOutcome,
    pub summary: WriteSummary,
    /// Every discovered domain with the records its queries returned.
    pub discovered: Vec<(DomainName, Vec<ResourceRecord>)>,
}

/// Measure every domain in the list: SOA, NS, DNSKEY, and DS of each.
/// Domains are dispatched as they are read.
///
/// # Errors
///
/// If the list cannot be read, a worker fails, or anything cannot be
/// written.  Nothing from the pass is stored in that case.
pub async fn measure<E: Exchange, R: AsyncBufRead + Unpin>(
    config: &Config,
    exchange: E,
    domain_list: R,
    store: &Store,
) -> Result<WriteSummary, PipelineError> {
    tracing::info!("starting measurement");

    let resolved = chrono::Utc::now().timestamp();
    let (answers, rx) = aggregator::channel(config.answer_buffer);
    let pool = ResolverPool::start(config, QueryExecutor::new(config, exchange), answers.clone())?;

    let dispatch = async move {
        let mut domain_list = DomainList::new(domain_list);
        let mut domains: usize = 0;
        while let Some(domain) = domain_list
            .next_domain()
            .await
            .map_err(PipelineError::DomainList)?
        {
            pool.submit(domain, QueryPlan::Measure).await?;
            domains += 1;
        }
        pool.join().await?;
        // the writer commits once this is gone, so only after a clean join
        drop(answers);
        tracing::info!(domains, "all domains queried");
        Ok::<_, PipelineError>(())
    };
    let writer = async { store.write_pass(rx, resolved).await.map_err(PipelineError::from) };

    let ((), summary) = tokio::try_join!(dispatch, writer)?;
    Ok(summary)
}

/// Crawl a zone: every domain delegated from `apex` gets its NS and
/// DNSKEY, and the DS of `nic.` under it, measured.  A `max_domains`
/// of zero means no limit.
///
/// # Errors
///
/// If the zone transfer fails, a worker fails, or anything cannot be
/// written.  Nothing from the pass is stored in that case.
pub async fn crawl<E: Exchange, S: RecordSource>(
    config: &Config,
    exchange: E,
    apex: DomainName,
    zone_records: S,
    max_domains: usize,
    store: &Store,
) -> Result<CrawlReport, PipelineError> {
    tracing::info!(%apex, max_domains, "starting crawl");

    let resolved = chrono::Utc::now().timestamp();
    let tracker = DiscoveryTracker::new(apex, max_domains);
    let (answers, rx) = aggregator::channel(config.answer_buffer);
    let pool = ResolverPool::start(config, QueryExecutor::new(config, exchange), answers.clone())?;

    let dispatch = async {
        let mut zone_records = zone_records;
        let outcome = tracker.crawl(&mut zone_records, &pool).await?;
        // closes the transfer if it was cut short
        drop(zone_records);
        pool.join().await?;
        drop(answers);
        Ok::<_, PipelineError>(outcome)
    };
    let writer = async { store.write_pass(rx, resolved).await.map_err(PipelineError::from) };

    let (outcome, summary) = tokio::try_join!(dispatch, writer)?;
    tracing::info!(domains = tracker.discoveries().len(), ?outcome, "crawl complete");

    Ok(CrawlReport {
        outcome,
        summary,
        discovered: tracker.discoveries().snapshot(),
    })
}

#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    DomainList(io::Error),
    Crawl(CrawlError),
    Pool(PoolError),
    Store(StoreError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PipelineError::Config(error) => write!(f, "bad configuration: {error}"),
            PipelineError::DomainList(error) => write!(f, "could not read domain list: {error}"),
            PipelineError::Crawl(error) => write!(f, "{error}"),
            PipelineError::Pool(error) => write!(f, "{error}"),
            PipelineError::Store(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Config(error) => Some(error),
            PipelineError::DomainList(error) => Some(error),
            PipelineError::Crawl(error) => Some(error),
            PipelineError::Pool(error) => Some(error),
            PipelineError::Store(error) => Some(error),
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(error: ConfigError) -> Self {
        PipelineError::Config(error)
    }
}

impl From<CrawlError> for PipelineError {
    fn from(error: CrawlError) -> Self {
        PipelineError::Crawl(error)
    }
}

impl From<PoolError> for PipelineError {
    fn from(error: PoolError) -> Self {
        PipelineError::Pool(error)
    }
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        PipelineError::Store(error)
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::atomic::Ordering;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};

    use dns_types::protocol::types::test_util::*;

    use super::*;
    use crate::config::parse_resolvers;
    use crate::store::test_util::*;
    use crate::test_util::*;

    fn config() -> Config {
        Config::new(parse_resolvers(&["127.0.0.1", "127.0.0.2"]).unwrap(), 4)
            .unwrap()
            .with_max_attempts(2)
            .unwrap()
    }

    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk on fire")))
        }
    }

    fn signed_domain(exchange: ScriptedExchange, name: &str) -> ScriptedExchange {
        let rrsets = [
            (RecordType::SOA, soa_record(name, 864_000)),
            (RecordType::NS, ns_record(name, "a.ns.example.")),
            (RecordType::DNSKEY, dnskey_record(name, 13, b"key")),
            (RecordType::DS, ds_record(name, 1, b"digest")),
        ];
        rrsets.into_iter().fold(exchange, |exchange, (rtype, rr)| {
            exchange.answer(name, rtype, signed(vec![rr], 13, 1000, 2000))
        })
    }

    #[tokio::test]
    async fn measure_stores_good_and_skips_bad() {
        let store = Store::open_in_memory().await.unwrap();
        let exchange = signed_domain(ScriptedExchange::new(), "good.").otherwise(Reply::Unreachable);
        let stats = exchange.stats();
        let (_guard, no_answer) = count_events("no answer");

        let summary = measure(&config(), exchange, &b"good.\nbad.\n"[..], &store)
            .await
            .unwrap();

        assert_eq!(
            WriteSummary {
                facts: 4,
                new_content: 4,
                unsigned: 0
            },
            summary
        );
        let rows = timing_rows(&store).await;
        assert_eq!(4, rows.len());
        assert!(rows.iter().all(|row| row.0 == "good."));
        assert_eq!(2, stats.calls_for(&domain("bad."), RecordType::SOA));
        assert_eq!(1, stats.calls_for(&domain("good."), RecordType::DS));
        assert_eq!(4, no_answer.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn measure_fails_when_a_worker_panics() {
        let store = Store::open_in_memory().await.unwrap();
        let exchange =
            signed_domain(ScriptedExchange::new(), "good.").reply("bad.", RecordType::SOA, Reply::Panic);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            measure(&config(), exchange, &b"good.\nbad.\n"[..], &store),
        )
        .await
        .unwrap();

        assert!(matches!(
            result,
            Err(PipelineError::Pool(PoolError::WorkersFailed(1)))
        ));
        assert!(timing_rows(&store).await.is_empty());
    }

    #[tokio::test]
    async fn measure_stores_nothing_if_the_list_breaks() {
        let store = Store::open_in_memory().await.unwrap();
        let exchange = signed_domain(ScriptedExchange::new(), "good.");
        let list = (&b"good.\n"[..]).chain(BrokenReader);

        let result = measure(&config(), exchange, BufReader::new(list), &store).await;

        assert!(matches!(result, Err(PipelineError::DomainList(_))));
        assert!(timing_rows(&store).await.is_empty());
    }

    #[tokio::test]
    async fn measure_drops_unsigned() {
        let store = Store::open_in_memory().await.unwrap();
        let exchange =
            ScriptedExchange::new().answer("se.", RecordType::NS, vec![ns_record("se.", "a.ns.se.")]);

        let summary = measure(&config(), exchange, &b"se\n"[..], &store).await.unwrap();

        assert_eq!(0, summary.facts);
        assert_eq!(4, summary.unsigned);
        assert!(timing_rows(&store).await.is_empty());
    }

    #[tokio::test]
    async fn measure_with_no_domains_writes_nothing() {
        let store = Store::open_in_memory().await.unwrap();

        let summary = measure(&config(), ScriptedExchange::new(), &b"# nothing\n"[..], &store)
            .await
            .unwrap();

        assert_eq!(WriteSummary::default(), summary);
    }

    #[tokio::test]
    async fn crawl_measures_each_delegation_once() {
        let store = Store::open_in_memory().await.unwrap();
        let exchange = ScriptedExchange::new()
            .answer(
                "se.",
                RecordType::NS,
                signed(vec![ns_record("se.", "a.ns.se.")], 8, 1000, 2000),
            )
            .answer(
                "nic.se.",
                RecordType::DS,
                signed(vec![ds_record("nic.se.", 1, b"d")], 8, 1000, 2000),
            );
        let stats = exchange.stats();
        let zone = VecSource::new(vec![
            soa_record(".", 604_800),
            ns_record(".", "a.root-servers.net."),
            ns_record("se.", "a.ns.se."),
            ns_record("nu.", "a.ns.nu."),
            ns_record("se.", "b.ns.se."),
            soa_record(".", 604_800),
        ]);

        let report = crawl(&config(), exchange, domain("."), zone, 0, &store)
            .await
            .unwrap();

        assert_eq!(CrawlOutcome::Exhausted, report.outcome);
        assert_eq!(2, report.summary.facts);
        assert_eq!(
            vec![domain("nu."), domain("se.")],
            report
                .discovered
                .iter()
                .map(|(domain, _)| domain.clone())
                .collect::<Vec<_>>()
        );
        assert_eq!(4, report.discovered[1].1.len());
        assert_eq!(1, stats.calls_for(&domain("se."), RecordType::NS));
        assert_eq!(1, stats.calls_for(&domain("nic.nu."), RecordType::DS));
        assert_eq!(0, stats.calls_for(&domain("se."), RecordType::SOA));
        assert_eq!(6, stats.total_calls());
    }

    #[tokio::test]
    async fn crawl_transfer_failure_stores_nothing() {
        let store = Store::open_in_memory().await.unwrap();
        let exchange = ScriptedExchange::new().answer(
            "se.",
            RecordType::NS,
            signed(vec![ns_record("se.", "a.ns.se.")], 8, 1000, 2000),
        );
        let zone = VecSource::new(vec![
            soa_record(".", 604_800),
            ns_record("se.", "a.ns.se."),
        ])
        .then_fail();

        let result = crawl(&config(), exchange, domain("."), zone, 0, &store).await;

        assert!(matches!(result, Err(PipelineError::Crawl(CrawlError::Transfer(_)))));
        assert!(timing_rows(&store).await.is_empty());
    }
}
