//! SOCKS5 client subset: no-auth negotiation and CONNECT
//!
//! Replies are read exactly to their encoded length. Later hops and PQC
//! frames share the same stream, so nothing past the reply may be consumed.

use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// `VER=5, NMETHODS=1, METHODS=[NO_AUTH]`
pub const NO_AUTH_GREETING: [u8; 3] = [SOCKS_VERSION, 0x01, METHOD_NO_AUTH];

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected SOCKS version {0:#04x}")]
    UnexpectedVersion(u8),
    #[error("no-auth method refused (server chose {0:#04x})")]
    MethodRejected(u8),
    #[error("CONNECT refused: {reason} ({code:#04x})")]
    Rejected { code: u8, reason: &'static str },
    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),
    #[error("unsupported address type {0:#04x} in reply")]
    UnsupportedAddressType(u8),
}

/// Encode a CONNECT request for `host:port`
///
/// IPv4 literals use ATYP 1; anything else is sent as a domain name.
pub fn encode_connect(host: &str, port: u16) -> Result<Vec<u8>, Socks5Error> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];

    match host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.len() > u8::MAX as usize {
                return Err(Socks5Error::DomainTooLong(name.len()));
            }
            request.push(ATYP_DOMAIN);
            request.push(name.len() as u8);
            request.extend_from_slice(name);
        }
    }

    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

/// Human-readable REP field
pub fn reply_reason(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Send the no-auth greeting and require the server to select it
pub async fn negotiate_no_auth<S>(stream: &mut S) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&NO_AUTH_GREETING).await?;
    stream.flush().await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(Socks5Error::UnexpectedVersion(reply[0]));
    }
    if reply[1] != METHOD_NO_AUTH {
        return Err(Socks5Error::MethodRejected(reply[1]));
    }
    Ok(())
}

/// Issue CONNECT through the stream and consume the whole reply
///
/// Stricter than accepting any 2-byte reply with REP 0: a success reply with
/// an unknown ATYP is rejected, and the BND address and port are read in
/// full. The next hop's bytes follow on the same stream, so the reply must be
/// consumed exactly.
pub async fn connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = encode_connect(host, port)?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[1] != REPLY_SUCCEEDED {
        return Err(Socks5Error::Rejected {
            code: head[1],
            reason: reply_reason(head[1]),
        });
    }

    // RSV, ATYP, BND.ADDR, BND.PORT
    let mut rest = [0u8; 2];
    stream.read_exact(&mut rest).await?;
    let addr_len = match rest[1] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}
