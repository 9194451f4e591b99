use bytes::BytesMut;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;

/// Read a DNS message from a TCP stream.
///
/// A DNS TCP message is slightly different to a DNS UDP message: it
/// has a big-endian u16 prefix giving the total length of the
/// message, so the entire message can be read before parsing begins.
pub async fn read_tcp_bytes<R: AsyncRead + Unpin>(stream: &mut R) -> Result<BytesMut, TcpError> {
    let expected = stream
        .read_u16()
        .await
        .map_err(|error| TcpError::IO { id: None, error })?;
    let expected = usize::from(expected);

    // read exactly one message: a zone transfer sends many back to
    // back on the same stream
    let mut bytes = BytesMut::zeroed(expected);
    let mut filled = 0;
    while filled < expected {
        match stream.read(&mut bytes[filled..]).await {
            Ok(0) => {
                return Err(TcpError::TooShort {
                    id: message_id(&bytes[..filled]),
                    expected,
                    actual: filled,
                });
            }
            Ok(n) => filled += n,
            Err(error) => {
                return Err(TcpError::IO {
                    id: message_id(&bytes[..filled]),
                    error,
                });
            }
        }
    }

    Ok(bytes)
}

/// Write a serialised message to a TCP stream, with its two-octet
/// length prefix.
pub async fn send_tcp_bytes<W: AsyncWrite + Unpin>(
    stream: &mut W,
    bytes: &[u8],
) -> Result<(), TcpError> {
    let Ok(len) = u16::try_from(bytes.len()) else {
        return Err(TcpError::TooLong { len: bytes.len() });
    };

    let mut framed = Vec::with_capacity(bytes.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(bytes);

    stream
        .write_all(&framed)
        .await
        .map_err(|error| TcpError::IO {
            id: message_id(bytes),
            error,
        })
}

/// Write a serialised message to a connected UDP socket.
pub async fn send_udp_bytes(sock: &UdpSocket, bytes: &[u8]) -> Result<(), io::Error> {
    let sent = sock.send(bytes).await?;
    if sent == bytes.len() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("sent {sent} of {} octets", bytes.len()),
        ))
    }
}

fn message_id(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// An error that can occur when reading or writing a DNS TCP message.
#[derive(Debug)]
pub enum TcpError {
    TooShort {
        id: Option<u16>,
        expected: usize,
        actual: usize,
    },
    TooLong {
        len: usize,
    },
    IO {
        id: Option<u16>,
        error: io::Error,
    },
}

impl fmt::Display for TcpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcpError::TooShort {
                expected, actual, ..
            } => write!(f, "connection closed after {actual} of {expected} octets"),
            TcpError::TooLong { len } => write!(f, "message of {len} octets cannot be framed"),
            TcpError::IO { error, .. } => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for TcpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TcpError::IO { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_framing_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);

        send_tcp_bytes(&mut client, &[1, 2, 3, 4, 5]).await.unwrap();
        let bytes = read_tcp_bytes(&mut server).await.unwrap();

        assert_eq!(&[1, 2, 3, 4, 5][..], &bytes[..]);
    }

    #[tokio::test]
    async fn tcp_read_reports_short_message() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_all(&[0, 10, 0xab, 0xcd, 1]).await.unwrap();
        drop(client);

        match read_tcp_bytes(&mut server).await {
            Err(TcpError::TooShort {
                id,
                expected,
                actual,
            }) => {
                assert_eq!(Some(0xabcd), id);
                assert_eq!(10, expected);
                assert_eq!(3, actual);
            }
            other => panic!("expected TooShort, got {other:?}"),
        }
    }
}
