//! The many-to-one channel which carries answers from the query
//! workers to the single writer.
//!
//! The channel is bounded, so a slow writer applies backpressure to
//! the workers.  It closes once every `AnswerSender` has been
//! dropped, which the pipeline only lets happen after all query work
//! has finished.

use std::fmt;
use tokio::sync::mpsc;

use dns_types::protocol::types::*;

/// The answer section of one successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerSet {
    /// The name which was queried.
    pub domain: DomainName,
    /// The type which was queried.
    pub rtype: RecordType,
    pub records: Vec<ResourceRecord>,
}

/// Create a new answer channel which can hold `capacity` answers.
pub fn channel(capacity: usize) -> (AnswerSender, AnswerReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (AnswerSender(tx), AnswerReceiver(rx))
}

#[derive(Debug, Clone)]
pub struct AnswerSender(mpsc::Sender<AnswerSet>);

impl AnswerSender {
    /// Hand an answer to the writer, waiting for space if the channel
    /// is full.
    ///
    /// # Errors
    ///
    /// If the writer has gone away.
    pub async fn send(&self, answer: AnswerSet) -> Result<(), AggregatorClosed> {
        self.0.send(answer).await.map_err(|_| AggregatorClosed)
    }
}

#[derive(Debug)]
pub struct AnswerReceiver(mpsc::Receiver<AnswerSet>);

impl AnswerReceiver {
    /// The next answer, or `None` once every sender is gone and the
    /// channel is drained.
    pub async fn recv(&mut self) -> Option<AnswerSet> {
        self.0.recv().await
    }
}

/// The receiving side of the channel was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorClosed;

impl fmt::Display for AggregatorClosed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "answer writer has stopped")
    }
}

impl std::error::Error for AggregatorClosed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
