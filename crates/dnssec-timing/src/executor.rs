use std::net::SocketAddr;

use dns_types::protocol::types::*;

use crate::aggregator::{AggregatorClosed, AnswerSender, AnswerSet};
use crate::config::Config;
use crate::discovery::SharedDiscoveries;
use crate::nameserver::Exchange;

/// Which questions to ask about a domain.
#[derive(Debug, Clone)]
pub enum QueryPlan {
    /// SOA, NS, DNSKEY, and DS of the domain itself.
    Measure,
    /// NS and DNSKEY of the domain, and DS of `nic.` under it.  The
    /// answers are also recorded against the domain.
    Discover(SharedDiscoveries),
}

impl QueryPlan {
    pub fn questions(&self, domain: &DomainName) -> Vec<(DomainName, RecordType)> {
        match self {
            QueryPlan::Measure => [
                RecordType::SOA,
                RecordType::NS,
                RecordType::DNSKEY,
                RecordType::DS,
            ]
            .into_iter()
            .map(|rtype| (domain.clone(), rtype))
            .collect(),
            QueryPlan::Discover(_) => {
                let mut questions = vec![
                    (domain.clone(), RecordType::NS),
                    (domain.clone(), RecordType::DNSKEY),
                ];
                match domain.child("nic") {
                    Some(nic) => questions.push((nic, RecordType::DS)),
                    None => tracing::warn!(%domain, "no room for a nic label, skipping DS"),
                }
                questions
            }
        }
    }
}

/// One unit of work for the pool: every question of the plan, asked
/// of the same resolver.
#[derive(Debug, Clone)]
pub struct Job {
    pub domain: DomainName,
    pub nameserver: SocketAddr,
    pub plan: QueryPlan,
}

/// The result of asking one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Answered(Message),
    /// The resolver answered with an error rcode.
    Rejected(Rcode),
    /// Every attempt failed in transport.
    NoAnswer,
}

pub struct QueryExecutor<E> {
    exchange: E,
    max_attempts: usize,
    payload_size: u16,
}

impl<E: Exchange> QueryExecutor<E> {
    pub fn new(config: &Config, exchange: E) -> Self {
        Self {
            exchange,
            max_attempts: config.max_attempts.max(1),
            payload_size: config.edns_payload_size,
        }
    }

    /// A recursive query asking for DNSSEC records.
    pub fn make_query(&self, name: &DomainName, rtype: RecordType) -> Message {
        let mut query = Message::from_question(
            rand::random(),
            Question {
                name: name.clone(),
                qtype: QueryType::Record(rtype),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        )
        .with_edns(self.payload_size, true);
        query.header.recursion_desired = true;
        query
    }

    /// Ask one question, retrying the same resolver on transport
    /// failure.  An error rcode is final.
    pub async fn query(
        &self,
        nameserver: SocketAddr,
        name: &DomainName,
        rtype: RecordType,
    ) -> QueryOutcome {
        let request = self.make_query(name, rtype);

        for attempt in 1..=self.max_attempts {
            match self.exchange.exchange(nameserver, &request).await {
                Ok(response) if response.header.rcode == Rcode::NoError => {
                    return QueryOutcome::Answered(response);
                }
                Ok(response) => {
                    tracing::warn!(%name, %rtype, %nameserver, rcode = %response.header.rcode, "query rejected");
                    return QueryOutcome::Rejected(response.header.rcode);
                }
                Err(error) => {
                    tracing::debug!(%name, %rtype, %nameserver, attempt, %error, "query failed");
                }
            }
        }

        tracing::error!(%name, %rtype, %nameserver, attempts = self.max_attempts, "no answer");
        QueryOutcome::NoAnswer
    }

    /// Ask every question of the job in turn, passing each answer on
    /// to the writer.  A failed question does not stop the others.
    ///
    /// # Errors
    ///
    /// If the writer has gone away, in which case there is no point
    /// asking anything else.
    pub async fn run(&self, job: Job, answers: &AnswerSender) -> Result<(), AggregatorClosed> {
        let mut collected = Vec::new();

        for (name, rtype) in job.plan.questions(&job.domain) {
            if let QueryOutcome::Answered(response) = self.query(job.nameserver, &name, rtype).await
            {
                if matches!(job.plan, QueryPlan::Discover(_)) {
                    collected.extend(response.answers.iter().cloned());
                }
                answers
                    .send(AnswerSet {
                        domain: name,
                        rtype,
                        records: response.answers,
                    })
                    .await?;
            }
        }

        if let QueryPlan::Discover(discoveries) = &job.plan {
            discoveries.append(&job.domain, collected);
        }

        Ok(())
    }
}
