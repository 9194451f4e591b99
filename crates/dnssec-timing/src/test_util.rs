use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use dns_types::protocol::types::test_util::*;
use dns_types::protocol::types::*;

use crate::axfr::{RecordSource, TransferError};
use crate::nameserver::{Exchange, ExchangeError};

pub fn test_nameserver() -> SocketAddr {
    "127.0.0.1:53".parse().unwrap()
}

/// What a `ScriptedExchange` does when asked a question.
#[derive(Debug, Clone)]
pub enum Reply {
    Answer(Vec<ResourceRecord>),
    Rcode(Rcode),
    /// Fail in transport, every time.
    Unreachable,
    /// Fail in transport this many times, then answer.
    FailFirst(usize, Vec<ResourceRecord>),
    /// Panic the worker which asked.
    Panic,
}

/// An `Exchange` which answers from a script rather than the network.
/// Unscripted questions get an empty answer.
#[derive(Debug, Clone)]
pub struct ScriptedExchange {
    replies: HashMap<(DomainName, RecordType), Reply>,
    default: Reply,
    delay: Option<Duration>,
    stats: Arc<Stats>,
}

impl Default for ScriptedExchange {
    fn default() -> Self {
        Self {
            replies: HashMap::new(),
            default: Reply::Answer(Vec::new()),
            delay: None,
            stats: Arc::new(Stats::default()),
        }
    }
}

impl ScriptedExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, name: &str, rtype: RecordType, reply: Reply) -> Self {
        self.replies.insert((domain(name), rtype), reply);
        self
    }

    pub fn answer(self, name: &str, rtype: RecordType, records: Vec<ResourceRecord>) -> Self {
        self.reply(name, rtype, Reply::Answer(records))
    }

    pub fn rcode(self, name: &str, rtype: RecordType, rcode: Rcode) -> Self {
        self.reply(name, rtype, Reply::Rcode(rcode))
    }

    pub fn unreachable(self, name: &str, rtype: RecordType) -> Self {
        self.reply(name, rtype, Reply::Unreachable)
    }

    pub fn failing_first(
        self,
        name: &str,
        rtype: RecordType,
        failures: usize,
        records: Vec<ResourceRecord>,
    ) -> Self {
        self.reply(name, rtype, Reply::FailFirst(failures, records))
    }

    /// The reply to every unscripted question.
    pub fn otherwise(mut self, reply: Reply) -> Self {
        self.default = reply;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }
}

impl Exchange for ScriptedExchange {
    async fn exchange(
        &self,
        nameserver: SocketAddr,
        request: &Message,
    ) -> Result<Message, ExchangeError> {
        let question = &request.questions[0];
        let QueryType::Record(rtype) = question.qtype else {
            panic!("unexpected query type {}", question.qtype);
        };
        let key = (question.name.clone(), rtype);

        let previous = self.stats.record(&key, nameserver);
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut response = request.make_response();
        match self.replies.get(&key).unwrap_or(&self.default) {
            Reply::Answer(records) => response.answers.clone_from(records),
            Reply::Rcode(rcode) => response.header.rcode = *rcode,
            Reply::Unreachable => return Err(ExchangeError::Timeout),
            Reply::FailFirst(failures, records) => {
                if previous < *failures {
                    return Err(ExchangeError::Timeout);
                }
                response.answers.clone_from(records);
            }
            Reply::Panic => panic!("scripted panic for {} {rtype}", key.0),
        }
        Ok(response)
    }
}

/// What a `ScriptedExchange` was asked.
#[derive(Debug, Default)]
pub struct Stats {
    calls: Mutex<Vec<(DomainName, RecordType, SocketAddr)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Stats {
    /// Log a call, returning how many times this question was asked
    /// before.
    fn record(&self, key: &(DomainName, RecordType), nameserver: SocketAddr) -> usize {
        let mut calls = self.calls.lock().unwrap();
        let previous = calls
            .iter()
            .filter(|(name, rtype, _)| *name == key.0 && *rtype == key.1)
            .count();
        calls.push((key.0.clone(), key.1, nameserver));
        previous
    }

    pub fn calls_for(&self, name: &DomainName, rtype: RecordType) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, t, _)| n == name && *t == rtype)
            .count()
    }

    pub fn nameservers_for(&self, name: &DomainName) -> Vec<SocketAddr> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, _, nameserver)| *nameserver)
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A `RecordSource` over a fixed list of records.
#[derive(Debug)]
pub struct VecSource {
    records: VecDeque<ResourceRecord>,
    fail_at_end: bool,
    done: bool,
}

impl VecSource {
    pub fn new(records: Vec<ResourceRecord>) -> Self {
        Self {
            records: records.into(),
            fail_at_end: false,
            done: false,
        }
    }

    /// Fail instead of completing once the records run out.
    pub fn then_fail(mut self) -> Self {
        self.fail_at_end = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.records.len()
    }
}

impl RecordSource for VecSource {
    async fn next_record(&mut self) -> Result<Option<ResourceRecord>, TransferError> {
        if self.done {
            return Ok(None);
        }

        match self.records.pop_front() {
            Some(rr) => Ok(Some(rr)),
            None => {
                self.done = true;
                if self.fail_at_end {
                    Err(TransferError::Timeout)
                } else {
                    Ok(None)
                }
            }
        }
    }
}

/// A record set with a signature over it.
pub fn signed(
    records: Vec<ResourceRecord>,
    algorithm: u8,
    inception: u32,
    expiration: u32,
) -> Vec<ResourceRecord> {
    let owner = records[0].name.to_dotted_string();
    let covered = records[0].rtype();
    let mut out = records;
    out.push(rrsig_record(&owner, covered, algorithm, inception, expiration));
    out
}

/// Count the events logged with `message` on this thread while the
/// guard is held.  Spawned tasks are only seen on the current-thread
/// runtime.
pub fn count_events(message: &'static str) -> (DefaultGuard, Arc<AtomicUsize>) {
    let seen = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(EventCounter {
        message,
        seen: seen.clone(),
    });
    (tracing::subscriber::set_default(subscriber), seen)
}

struct EventCounter {
    message: &'static str,
    seen: Arc<AtomicUsize>,
}

impl<S: Subscriber> Layer<S> for EventCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageField::default();
        event.record(&mut message);
        if message.0 == self.message {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct MessageField(String);

impl Visit for MessageField {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}
