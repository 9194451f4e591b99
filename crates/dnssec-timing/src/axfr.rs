//! Full zone transfers (AXFR) over TCP, as a stream of records.
//!
//! The transfer runs in its own task, which parses each envelope and
//! hands records over through a bounded channel.  The consumer can
//! stop at any point: dropping the `ZoneRecords` aborts the task,
//! which closes the connection.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::Instrument;

use dns_types::protocol::deserialise;
use dns_types::protocol::serialise;
use dns_types::protocol::types::*;

use crate::config::ZONE_RECORD_BUFFER;
use crate::net::{read_tcp_bytes, send_tcp_bytes, TcpError};

/// Something which produces zone records one at a time.
pub trait RecordSource: Send {
    /// The next record, or `None` once the zone is complete.  After
    /// an error or `None`, every later call returns `None`.
    fn next_record(
        &mut self,
    ) -> impl Future<Output = Result<Option<ResourceRecord>, TransferError>> + Send;
}

/// The records of a zone transfer in progress.
#[derive(Debug)]
pub struct ZoneRecords {
    records: mpsc::Receiver<Result<ResourceRecord, TransferError>>,
    reader: JoinHandle<()>,
    done: bool,
}

impl RecordSource for ZoneRecords {
    async fn next_record(&mut self) -> Result<Option<ResourceRecord>, TransferError> {
        if self.done {
            return Ok(None);
        }

        match self.records.recv().await {
            Some(Ok(rr)) => Ok(Some(rr)),
            Some(Err(error)) => {
                self.done = true;
                Err(error)
            }
            None => {
                self.done = true;
                match (&mut self.reader).await {
                    Ok(()) => Ok(None),
                    Err(_) => Err(TransferError::ReaderFailed),
                }
            }
        }
    }
}

impl Drop for ZoneRecords {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Connect to `server` and start transferring `zone`.  Each network
/// operation is limited by `limit`.
///
/// # Errors
///
/// If the connection cannot be made or the request cannot be sent.
/// Errors after that are reported by `ZoneRecords`.
pub async fn transfer(
    zone: &DomainName,
    server: SocketAddr,
    limit: Duration,
) -> Result<ZoneRecords, TransferError> {
    let request = Message::from_question(
        rand::random(),
        Question {
            name: zone.clone(),
            qtype: QueryType::AXFR,
            qclass: QueryClass::Record(RecordClass::IN),
        },
    );
    let serialised_request = request.to_octets().map_err(TransferError::Serialise)?;

    let mut stream = timeout(limit, TcpStream::connect(server))
        .await
        .map_err(|_| TransferError::Timeout)?
        .map_err(TransferError::Connect)?;
    timeout(limit, send_tcp_bytes(&mut stream, &serialised_request))
        .await
        .map_err(|_| TransferError::Timeout)?
        .map_err(TransferError::Tcp)?;

    tracing::info!(%zone, %server, "zone transfer started");

    let (tx, rx) = mpsc::channel(ZONE_RECORD_BUFFER);
    let reader = tokio::spawn(
        async move {
            if let Err(error) = read_envelopes(&mut stream, &request, limit, &tx).await {
                // nobody to tell if the receiver is gone
                let _ = tx.send(Err(error)).await;
            }
        }
        .instrument(tracing::debug_span!("axfr", %zone, %server)),
    );

    Ok(ZoneRecords {
        records: rx,
        reader,
        done: false,
    })
}

/// Read envelopes until the closing SOA, passing on every record
/// (both SOAs included).
async fn read_envelopes(
    stream: &mut TcpStream,
    request: &Message,
    limit: Duration,
    tx: &mpsc::Sender<Result<ResourceRecord, TransferError>>,
) -> Result<(), TransferError> {
    let mut envelopes = 0;
    let mut records = 0;

    loop {
        let bytes = timeout(limit, read_tcp_bytes(stream))
            .await
            .map_err(|_| TransferError::Timeout)?
            .map_err(TransferError::Tcp)?;
        let response = Message::from_octets(&bytes).map_err(TransferError::Malformed)?;
        envelopes += 1;

        if response.header.id != request.header.id || !response.header.is_response {
            return Err(TransferError::Mismatch);
        }
        if response.header.rcode != Rcode::NoError {
            return Err(TransferError::Refused(response.header.rcode));
        }

        for rr in response.answers {
            let is_soa = rr.rtype() == RecordType::SOA;
            if records == 0 && !is_soa {
                return Err(TransferError::NoLeadingSoa);
            }
            records += 1;
            let is_closing = is_soa && records > 1;

            if tx.send(Ok(rr)).await.is_err() {
                return Ok(());
            }
            if is_closing {
                tracing::debug!(envelopes, records, "zone transfer complete");
                return Ok(());
            }
        }
    }
}

/// Why a zone transfer failed.  Every one of these ends the transfer.
#[derive(Debug)]
pub enum TransferError {
    Timeout,
    Connect(io::Error),
    Serialise(serialise::Error),
    Tcp(TcpError),
    Malformed(deserialise::Error),
    /// An envelope was for some other query.
    Mismatch,
    /// The server would not transfer the zone.
    Refused(Rcode),
    /// The first record was not the zone's SOA.
    NoLeadingSoa,
    /// The transfer task died.
    ReaderFailed,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::Timeout => write!(f, "timed out"),
            TransferError::Connect(error) => write!(f, "could not connect: {error}"),
            TransferError::Serialise(error) => write!(f, "could not serialise request: {error}"),
            TransferError::Tcp(error) => write!(f, "{error}"),
            TransferError::Malformed(error) => write!(f, "malformed envelope: {error}"),
            TransferError::Mismatch => write!(f, "envelope does not match request"),
            TransferError::Refused(rcode) => write!(f, "transfer refused: {rcode}"),
            TransferError::NoLeadingSoa => write!(f, "transfer does not start with an SOA"),
            TransferError::ReaderFailed => write!(f, "transfer task failed"),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransferError::Connect(error) => Some(error),
            TransferError::Serialise(error) => Some(error),
            TransferError::Tcp(error) => Some(error),
            TransferError::Malformed(error) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use dns_types::protocol::types::test_util::*;

    use super::*;

    const LIMIT: Duration = Duration::from_secs(5);

    /// What the fake server does after sending its envelopes.
    enum Then {
        Nothing,
        SendGarbage,
        Hangup,
        WaitForClose,
    }

    async fn serve_transfer(envelopes: Vec<Vec<ResourceRecord>>, then: Then) -> (SocketAddr, JoinHandle<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_tcp_bytes(&mut stream).await.unwrap();
            let request = Message::from_octets(&request).unwrap();
            assert_eq!(QueryType::AXFR, request.questions[0].qtype);

            for answers in envelopes {
                let mut response = request.make_response();
                response.answers = answers;
                send_tcp_bytes(&mut stream, &response.to_octets().unwrap())
                    .await
                    .unwrap();
            }

            match then {
                Then::Nothing => {
                    let mut buf = [0u8; 1];
                    let _ = stream.read(&mut buf).await;
                    true
                }
                Then::SendGarbage => {
                    send_tcp_bytes(&mut stream, &[1, 2, 3]).await.unwrap();
                    true
                }
                Then::Hangup => true,
                Then::WaitForClose => {
                    let mut buf = [0u8; 1];
                    matches!(
                        timeout(LIMIT, stream.read(&mut buf)).await,
                        Ok(Ok(0) | Err(_))
                    )
                }
            }
        });

        (server, handle)
    }

    async fn collect(records: &mut ZoneRecords) -> (Vec<ResourceRecord>, Option<TransferError>) {
        let mut out = Vec::new();
        loop {
            match records.next_record().await {
                Ok(Some(rr)) => out.push(rr),
                Ok(None) => return (out, None),
                Err(error) => return (out, Some(error)),
            }
        }
    }

    #[tokio::test]
    async fn yields_every_record_then_completes() {
        let zone = vec![
            soa_record("se.", 864_000),
            ns_record("se.", "a.ns.se."),
            ns_record("a.se.", "ns.a.se."),
            ns_record("b.se.", "ns.b.se."),
            soa_record("se.", 864_000),
        ];
        let (server, handle) = serve_transfer(
            vec![zone[..3].to_vec(), zone[3..].to_vec()],
            Then::Nothing,
        )
        .await;

        let mut records = transfer(&domain("se."), server, LIMIT).await.unwrap();
        let (got, error) = collect(&mut records).await;

        assert_eq!(zone, got);
        assert!(error.is_none());
        assert_eq!(None, records.next_record().await.unwrap());
        drop(records);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn yields_records_before_malformed_envelope() {
        let first = vec![
            soa_record("se.", 864_000),
            ns_record("a.se.", "ns.a.se."),
        ];
        let (server, _handle) = serve_transfer(vec![first.clone()], Then::SendGarbage).await;

        let mut records = transfer(&domain("se."), server, LIMIT).await.unwrap();
        let (got, error) = collect(&mut records).await;

        assert_eq!(first, got);
        assert!(matches!(error, Some(TransferError::Malformed(_))));
        assert_eq!(None, records.next_record().await.unwrap());
    }

    #[tokio::test]
    async fn truncated_transfer_is_an_error() {
        let first = vec![soa_record("se.", 864_000), ns_record("a.se.", "ns.a.se.")];
        let (server, _handle) = serve_transfer(vec![first.clone()], Then::Hangup).await;

        let mut records = transfer(&domain("se."), server, LIMIT).await.unwrap();
        let (got, error) = collect(&mut records).await;

        assert_eq!(first, got);
        assert!(matches!(error, Some(TransferError::Tcp(_))));
    }

    #[tokio::test]
    async fn must_start_with_soa() {
        let (server, _handle) =
            serve_transfer(vec![vec![ns_record("a.se.", "ns.a.se.")]], Then::Nothing).await;

        let mut records = transfer(&domain("se."), server, LIMIT).await.unwrap();
        let (got, error) = collect(&mut records).await;

        assert!(got.is_empty());
        assert!(matches!(error, Some(TransferError::NoLeadingSoa)));
    }

    #[tokio::test]
    async fn dropping_closes_the_connection() {
        let first = vec![
            soa_record("se.", 864_000),
            ns_record("a.se.", "ns.a.se."),
            ns_record("b.se.", "ns.b.se."),
        ];
        let (server, handle) = serve_transfer(vec![first], Then::WaitForClose).await;

        let mut records = transfer(&domain("se."), server, LIMIT).await.unwrap();
        assert!(records.next_record().await.unwrap().is_some());
        drop(records);

        assert!(handle.await.unwrap());
    }
}
