use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

use dns_types::protocol::types::*;

use crate::aggregator::AnswerSender;
use crate::config::{Config, ConfigError};
use crate::executor::{Job, QueryExecutor, QueryPlan};
use crate::nameserver::Exchange;
use crate::selector::ResolverSelector;

/// A fixed set of workers pulling jobs from a bounded queue.
///
/// There are `concurrency` workers, each running one job at a time, so
/// at most `concurrency` jobs run at once.  A running job holds one of
/// `concurrency` slots; the worker count already bounds them, so taking
/// a slot never waits, and the slots are what `in_flight` counts.  Once
/// the queue is full, `submit` waits, so the producer can never get far
/// ahead of the workers.
pub struct ResolverPool {
    queue: mpsc::Sender<Job>,
    workers: JoinSet<()>,
    selector: ResolverSelector,
    slots: Arc<Semaphore>,
    concurrency: usize,
}

impl ResolverPool {
    /// Start the workers.  Every answer they get goes to `answers`.
    ///
    /// # Errors
    ///
    /// If the configuration has no resolvers.
    pub fn start<E: Exchange>(
        config: &Config,
        executor: QueryExecutor<E>,
        answers: AnswerSender,
    ) -> Result<Self, ConfigError> {
        let selector = ResolverSelector::new(config.resolvers.clone())?;
        let (queue, jobs) = mpsc::channel(config.concurrency);
        let jobs = Arc::new(Mutex::new(jobs));
        let slots = Arc::new(Semaphore::new(config.concurrency));
        let executor = Arc::new(executor);

        let mut workers = JoinSet::new();
        for worker in 0..config.concurrency {
            workers.spawn(
                work(
                    jobs.clone(),
                    slots.clone(),
                    executor.clone(),
                    answers.clone(),
                )
                .instrument(tracing::debug_span!("worker", worker)),
            );
        }

        Ok(Self {
            queue,
            workers,
            selector,
            slots,
            concurrency: config.concurrency,
        })
    }

    /// Queue up a domain, picking its resolver now.  Waits while the
    /// queue is full.
    ///
    /// # Errors
    ///
    /// If every worker has stopped.
    pub async fn submit(&self, domain: DomainName, plan: QueryPlan) -> Result<(), PoolError> {
        let job = Job {
            domain,
            nameserver: self.selector.next(),
            plan,
        };
        self.queue.send(job).await.map_err(|_| PoolError::Closed)
    }

    /// Number of jobs currently running, from the slots they hold.
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.slots.available_permits()
    }

    /// Stop taking jobs and wait for every queued job to finish.
    ///
    /// # Errors
    ///
    /// If any worker panicked.
    pub async fn join(self) -> Result<(), PoolError> {
        let Self {
            queue, mut workers, ..
        } = self;
        drop(queue);

        let mut panicked = 0;
        while let Some(result) = workers.join_next().await {
            if let Err(error) = result {
                tracing::error!(?error, "query worker failed");
                panicked += 1;
            }
        }

        if panicked == 0 {
            Ok(())
        } else {
            Err(PoolError::WorkersFailed(panicked))
        }
    }
}

async fn work<E: Exchange>(
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    slots: Arc<Semaphore>,
    executor: Arc<QueryExecutor<E>>,
    answers: AnswerSender,
) {
    loop {
        let Some(job) = jobs.lock().await.recv().await else {
            break;
        };
        let Ok(_slot) = slots.clone().acquire_owned().await else {
            break;
        };

        let span = tracing::debug_span!("job", domain = %job.domain, nameserver = %job.nameserver);
        if let Err(error) = executor.run(job, &answers).instrument(span).await {
            tracing::error!(%error, "abandoning remaining jobs");
            break;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The workers are gone, so nothing more can be submitted.
    Closed,
    /// This many workers panicked or were cancelled.
    WorkersFailed(usize),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolError::Closed => write!(f, "resolver pool is closed"),
            PoolError::WorkersFailed(n) => write!(f, "{n} query worker(s) failed"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dns_types::protocol::types::test_util::*;

    use super::*;
    use crate::aggregator;
    use crate::config::parse_resolvers;
    use crate::test_util::*;

    fn config(resolvers: &[&str], concurrency: usize) -> Config {
        Config::new(parse_resolvers(resolvers).unwrap(), concurrency).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_concurrency() {
        let config = config(&["127.0.0.1"], 3);
        let exchange = ScriptedExchange::new().with_delay(Duration::from_millis(5));
        let stats = exchange.stats();
        let (tx, mut rx) = aggregator::channel(1000);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let pool = ResolverPool::start(&config, QueryExecutor::new(&config, exchange), tx).unwrap();
        for i in 0..20 {
            pool.submit(domain(&format!("d{i}.")), QueryPlan::Measure)
                .await
                .unwrap();
            assert!(pool.in_flight() <= 3);
        }
        pool.join().await.unwrap();
        drain.await.unwrap();

        assert_eq!(80, stats.total_calls());
        assert!(stats.peak_in_flight() <= 3);
        assert!(stats.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn assigns_resolvers_in_rotation() {
        let config = config(&["127.0.0.1:1", "127.0.0.1:2"], 1);
        let exchange = ScriptedExchange::new();
        let stats = exchange.stats();
        let (tx, _rx) = aggregator::channel(1000);

        let pool = ResolverPool::start(&config, QueryExecutor::new(&config, exchange), tx).unwrap();
        for name in ["a.", "b.", "c."] {
            pool.submit(domain(name), QueryPlan::Measure).await.unwrap();
        }
        pool.join().await.unwrap();

        let resolvers = config.resolvers;
        assert_eq!(
            vec![resolvers[0]; 4],
            stats.nameservers_for(&domain("a."))
        );
        assert_eq!(
            vec![resolvers[1]; 4],
            stats.nameservers_for(&domain("b."))
        );
        assert_eq!(
            vec![resolvers[0]; 4],
            stats.nameservers_for(&domain("c."))
        );
    }

    #[tokio::test]
    async fn running_jobs_hold_slots() {
        let config = config(&["127.0.0.1"], 2);
        let exchange = ScriptedExchange::new().with_delay(Duration::from_millis(50));
        let (tx, _rx) = aggregator::channel(1000);

        let pool = ResolverPool::start(&config, QueryExecutor::new(&config, exchange), tx).unwrap();
        assert_eq!(0, pool.in_flight());

        pool.submit(domain("a."), QueryPlan::Measure).await.unwrap();
        pool.submit(domain("b."), QueryPlan::Measure).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(2, pool.in_flight());

        pool.join().await.unwrap();
    }

    #[tokio::test]
    async fn join_reports_panicked_workers() {
        let config = config(&["127.0.0.1"], 2);
        let exchange = ScriptedExchange::new().reply("bad.", RecordType::SOA, Reply::Panic);
        let (tx, mut rx) = aggregator::channel(1000);

        let pool = ResolverPool::start(&config, QueryExecutor::new(&config, exchange), tx).unwrap();
        pool.submit(domain("bad."), QueryPlan::Measure).await.unwrap();
        pool.submit(domain("good."), QueryPlan::Measure).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), pool.join()).await;

        assert_eq!(Ok(Err(PoolError::WorkersFailed(1))), result);

        let mut answers = 0;
        while let Some(answer) = rx.recv().await {
            assert_eq!(domain("good."), answer.domain);
            answers += 1;
        }
        assert_eq!(4, answers);
    }

    #[tokio::test]
    async fn join_waits_for_queued_jobs() {
        let config = config(&["127.0.0.1"], 2);
        let exchange = ScriptedExchange::new()
            .with_delay(Duration::from_millis(2))
            .answer("a.", RecordType::SOA, vec![soa_record("a.", 100)]);
        let (tx, mut rx) = aggregator::channel(1000);

        let pool = ResolverPool::start(&config, QueryExecutor::new(&config, exchange), tx).unwrap();
        pool.submit(domain("a."), QueryPlan::Measure).await.unwrap();
        pool.join().await.unwrap();

        let mut answers = 0;
        while rx.recv().await.is_some() {
            answers += 1;
        }
        assert_eq!(4, answers);
    }
}
