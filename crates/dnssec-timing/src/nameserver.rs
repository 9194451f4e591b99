use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dns_types::protocol::deserialise;
use dns_types::protocol::serialise;
use dns_types::protocol::types::*;

use crate::config::{Config, Transport};
use crate::net::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes, TcpError};

/// Something which can put a query to a nameserver and bring back its
/// response.
///
/// Any `Err` is a transport failure, and the caller may try again.
/// An `Ok` response may still carry an error rcode.
pub trait Exchange: Send + Sync + 'static {
    fn exchange(
        &self,
        nameserver: SocketAddr,
        request: &Message,
    ) -> impl Future<Output = Result<Message, ExchangeError>> + Send;
}

/// Talks to real nameservers over the network.
#[derive(Debug, Clone, Copy)]
pub struct NetworkExchange {
    transport: Transport,
    timeout: Duration,
    payload_size: u16,
}

impl NetworkExchange {
    pub fn new(config: &Config) -> Self {
        Self {
            transport: config.transport,
            timeout: config.timeout,
            payload_size: config.edns_payload_size,
        }
    }
}

impl Exchange for NetworkExchange {
    async fn exchange(
        &self,
        nameserver: SocketAddr,
        request: &Message,
    ) -> Result<Message, ExchangeError> {
        let serialised_request = request.to_octets().map_err(ExchangeError::Serialise)?;

        let response = match self.transport {
            Transport::Udp => {
                let response = timeout(
                    self.timeout,
                    query_nameserver_udp(nameserver, &serialised_request, self.payload_size),
                )
                .await
                .map_err(|_| ExchangeError::Timeout)??;

                if response.header.is_truncated {
                    tracing::debug!(%nameserver, "truncated response, retrying over TCP");
                    timeout(
                        self.timeout,
                        query_nameserver_tcp(nameserver, &serialised_request),
                    )
                    .await
                    .map_err(|_| ExchangeError::Timeout)??
                } else {
                    response
                }
            }
            Transport::Tcp => timeout(
                self.timeout,
                query_nameserver_tcp(nameserver, &serialised_request),
            )
            .await
            .map_err(|_| ExchangeError::Timeout)??,
        };

        if response_matches_request(request, &response) {
            Ok(response)
        } else {
            Err(ExchangeError::Mismatch)
        }
    }
}

/// Send a message to a nameserver over UDP, returning the response.
/// The response is NOT validated.
async fn query_nameserver_udp(
    nameserver: SocketAddr,
    serialised_request: &[u8],
    payload_size: u16,
) -> Result<Message, ExchangeError> {
    let local: SocketAddr = if nameserver.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let sock = UdpSocket::bind(local).await.map_err(ExchangeError::IO)?;
    sock.connect(nameserver).await.map_err(ExchangeError::IO)?;
    send_udp_bytes(&sock, serialised_request)
        .await
        .map_err(ExchangeError::IO)?;

    let mut buf = vec![0u8; usize::from(payload_size.max(512))];
    let len = sock.recv(&mut buf).await.map_err(ExchangeError::IO)?;
    Message::from_octets(&buf[..len]).map_err(ExchangeError::Malformed)
}

/// Send a message to a nameserver over TCP, returning the response.
/// The response is NOT validated.
async fn query_nameserver_tcp(
    nameserver: SocketAddr,
    serialised_request: &[u8],
) -> Result<Message, ExchangeError> {
    let mut stream = TcpStream::connect(nameserver)
        .await
        .map_err(ExchangeError::IO)?;
    send_tcp_bytes(&mut stream, serialised_request)
        .await
        .map_err(ExchangeError::Tcp)?;
    let bytes = read_tcp_bytes(&mut stream)
        .await
        .map_err(ExchangeError::Tcp)?;
    Message::from_octets(bytes.as_ref()).map_err(ExchangeError::Malformed)
}

/// Very basic validation that a nameserver response matches a
/// message:
///
/// - Check the ID, opcode, and questions match the question.
///
/// - Check it is a response.
///
/// The rcode is deliberately not checked: the caller decides what an
/// error rcode means.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    request.header.id == response.header.id
        && response.header.is_response
        && request.header.opcode == response.header.opcode
        && request.questions == response.questions
}

/// Why an exchange produced no response.
#[derive(Debug)]
pub enum ExchangeError {
    Timeout,
    Serialise(serialise::Error),
    IO(io::Error),
    Tcp(TcpError),
    Malformed(deserialise::Error),
    /// The response was for some other query.
    Mismatch,
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExchangeError::Timeout => write!(f, "timed out"),
            ExchangeError::Serialise(error) => write!(f, "could not serialise query: {error}"),
            ExchangeError::IO(error) => write!(f, "{error}"),
            ExchangeError::Tcp(error) => write!(f, "{error}"),
            ExchangeError::Malformed(error) => write!(f, "malformed response: {error}"),
            ExchangeError::Mismatch => write!(f, "response does not match query"),
        }
    }
}

impl std::error::Error for ExchangeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExchangeError::Serialise(error) => Some(error),
            ExchangeError::IO(error) => Some(error),
            ExchangeError::Tcp(error) => Some(error),
            ExchangeError::Malformed(error) => Some(error),
            ExchangeError::Timeout | ExchangeError::Mismatch => None,
        }
    }
}


#[cfg(test)]
pub mod test_util {
    use dns_types::protocol::types::test_util::*;

    use super::*;

    pub fn matching_nameserver_response() -> (Message, Message) {
        nameserver_response("se.", RecordType::NS, &[ns_record("se.", "a.ns.se.")])
    }

    pub fn nameserver_response(
        name: &str,
        rtype: RecordType,
        answers: &[ResourceRecord],
    ) -> (Message, Message) {
        let request = Message::from_question(
            1234,
            Question {
                name: domain(name),
                qtype: QueryType::Record(rtype),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        );

        let mut response = request.make_response();
        response.answers = answers.into();

        (request, response)
    }
}
