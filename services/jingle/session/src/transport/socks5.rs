//! Minimal SOCKS5 handshakes used by bytestream candidates.
//!
//! Only what bytestream negotiation needs is supported: the no-auth method,
//! the CONNECT command and a domain-name destination carrying the hashed
//! destination address with port 0.

use crate::error::TransportError;
use ring::digest;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    /// Request granted
    Succeeded = 0x00,
    /// General server failure
    GeneralFailure = 0x01,
    /// No party waits for the destination address
    HostUnreachable = 0x04,
    /// Only CONNECT is supported
    CommandNotSupported = 0x07,
}

/// Destination address for a bytestream
///
/// Lowercase hex SHA-1 of the stream id, the JID of the party that offered
/// the candidate and the JID of the party connecting to it.
pub fn destination_address(sid: &str, offerer: &str, connector: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(sid.as_bytes());
    ctx.update(offerer.as_bytes());
    ctx.update(connector.as_bytes());
    hex::encode(ctx.finish().as_ref())
}

fn protocol(message: impl Into<String>) -> TransportError {
    TransportError::Socks5(message.into())
}

/// Client side: negotiate a CONNECT to `dstaddr` on an open stream
pub async fn connect<S>(stream: &mut S, dstaddr: &str) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host = dstaddr.as_bytes();
    let host_len = u8::try_from(host.len()).map_err(|_| protocol("destination address too long"))?;

    stream.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(protocol(format!("unexpected version {}", choice[0])));
    }
    if choice[1] != METHOD_NO_AUTH {
        return Err(protocol("no acceptable authentication method"));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host_len]);
    request.extend_from_slice(host);
    request.extend_from_slice(&0u16.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(protocol(format!("unexpected version {}", head[0])));
    }
    if head[1] != ReplyCode::Succeeded as u8 {
        return Err(protocol(format!("connect refused with code {}", head[1])));
    }
    read_address(stream, head[3]).await?;
    Ok(())
}

/// Server side: read a CONNECT request and return its destination address
///
/// The caller answers with [`reply`] once it knows whether anyone expects
/// the destination.
pub async fn accept<S>(stream: &mut S) -> Result<String, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != VERSION {
        return Err(protocol(format!("unexpected version {}", greeting[0])));
    }
    let mut methods = vec![0u8; usize::from(greeting[1])];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(protocol("client does not offer no-auth"));
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(protocol(format!("unexpected version {}", head[0])));
    }
    if head[1] != CMD_CONNECT {
        reply(stream, "", ReplyCode::CommandNotSupported).await?;
        return Err(protocol(format!("unsupported command {}", head[1])));
    }
    if head[3] != ATYP_DOMAIN {
        reply(stream, "", ReplyCode::GeneralFailure).await?;
        return Err(protocol("destination must be a domain name"));
    }
    read_address(stream, head[3]).await
}

/// Server side: answer a CONNECT request
pub async fn reply<S>(stream: &mut S, dstaddr: &str, code: ReplyCode) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    let host = dstaddr.as_bytes();
    let host_len = u8::try_from(host.len()).map_err(|_| protocol("destination address too long"))?;
    let mut message = Vec::with_capacity(7 + host.len());
    message.extend_from_slice(&[VERSION, code as u8, 0x00, ATYP_DOMAIN, host_len]);
    message.extend_from_slice(host);
    message.extend_from_slice(&0u16.to_be_bytes());
    stream.write_all(&message).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<String, TransportError>
where
    S: AsyncRead + Unpin,
{
    let address = match atyp {
        ATYP_IPV4 => {
            let mut raw = [0u8; 4];
            stream.read_exact(&mut raw).await?;
            std::net::Ipv4Addr::from(raw).to_string()
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 16];
            stream.read_exact(&mut raw).await?;
            std::net::Ipv6Addr::from(raw).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut raw = vec![0u8; usize::from(len)];
            stream.read_exact(&mut raw).await?;
            String::from_utf8(raw).map_err(|_| protocol("destination is not UTF-8"))?
        }
        other => return Err(protocol(format!("unknown address type {}", other))),
    };
    // Port is always 0 for bytestreams
    let _port = stream.read_u16().await?;
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_address_is_sha1_hex() {
        // SHA-1("abc")
        assert_eq!(
            destination_address("a", "b", "c"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        let forward = destination_address("sid", "alice@example.org/a", "bob@example.org/b");
        let backward = destination_address("sid", "bob@example.org/b", "alice@example.org/a");
        assert_eq!(forward.len(), 40);
        assert_ne!(forward, backward);
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let dst = destination_address("s1", "alice@example.org/a", "bob@example.org/b");

        let server_task = tokio::spawn(async move {
            let requested = accept(&mut server).await.unwrap();
            reply(&mut server, &requested, ReplyCode::Succeeded).await.unwrap();
            server.write_all(b"ping").await.unwrap();
            requested
        });

        connect(&mut client, &dst).await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(server_task.await.unwrap(), dst);
    }

    #[tokio::test]
    async fn test_refused_destination() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move {
            let requested = accept(&mut server).await.unwrap();
            reply(&mut server, &requested, ReplyCode::HostUnreachable).await.unwrap();
        });

        let result = connect(&mut client, "unknown").await;
        assert!(matches!(result, Err(TransportError::Socks5(_))));
        server_task.await.unwrap();
    }
}
