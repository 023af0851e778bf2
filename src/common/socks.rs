//! SOCKS5 protocol pieces (RFC 1928)
//!
//! Client side is used to dial through a transport's exposed endpoint,
//! server side by the bundled `socks5` transport. Only no-auth CONNECT is
//! supported in either direction.

use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Address {
    /// Encode as ATYP + address bytes.
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Address::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let bytes = domain.as_bytes();
                if bytes.len() > 255 {
                    return Err(Error::connection("Domain name too long"));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        Ok(())
    }

    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv4(ip) => format!("{}:{}", ip, port),
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            Address::Domain(d) => format!("{}:{}", d, port),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => ip.into(),
            Err(_) => Address::Domain(host.to_string()),
        }
    }
}

async fn read_address_and_port<R: AsyncRead + Unpin>(
    reader: &mut R,
    atyp: u8,
) -> Result<(Address, u16)> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            reader.read_exact(&mut buf).await?;
            let addr = Address::Ipv4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok((addr, port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            reader.read_exact(&mut len).await?;
            let len = len[0] as usize;
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            buf.truncate(len);
            let domain = String::from_utf8(buf)
                .map_err(|e| Error::parse(format!("Invalid domain: {}", e)))?;
            Ok((Address::Domain(domain), port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            reader.read_exact(&mut buf).await?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok((Address::Ipv6(Ipv6Addr::from(ip)), port))
        }
        t => Err(Error::protocol(format!("Unknown address type: {}", t))),
    }
}

/// Perform the client side of a no-auth CONNECT on an already open stream.
pub async fn client_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    target: &Address,
    port: u16,
) -> Result<()> {
    stream
        .write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH])
        .await
        .map_err(|e| Error::connection(format!("Failed to send SOCKS5 greeting: {}", e)))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Error::connection(format!("Failed to read SOCKS5 response: {}", e)))?;

    if response[0] != SOCKS5_VERSION {
        return Err(Error::protocol("Invalid SOCKS5 version"));
    }
    match response[1] {
        AUTH_NO_AUTH => {}
        AUTH_NO_ACCEPTABLE => return Err(Error::auth("No acceptable authentication method")),
        other => {
            return Err(Error::protocol(format!(
                "Unsupported authentication method: {}",
                other
            )))
        }
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    target.encode_into(&mut request)?;
    request.extend_from_slice(&port.to_be_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(|e| Error::connection(format!("Failed to send SOCKS5 connect request: {}", e)))?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| Error::connection(format!("Failed to read SOCKS5 reply: {}", e)))?;

    if reply[0] != SOCKS5_VERSION {
        return Err(Error::protocol("Invalid SOCKS5 version in reply"));
    }
    if reply[1] != REP_SUCCEEDED {
        return Err(Error::connection(reply_error_message(reply[1])));
    }

    // Bound address is not interesting, just consume it
    read_address_and_port(stream, reply[3]).await?;

    debug!("SOCKS5 connected to {}", target.to_string_with_port(port));
    Ok(())
}

/// Convert reply code to error message
pub fn reply_error_message(code: u8) -> String {
    match code {
        REP_GENERAL_FAILURE => "General SOCKS server failure".to_string(),
        REP_CONNECTION_NOT_ALLOWED => "Connection not allowed by ruleset".to_string(),
        REP_NETWORK_UNREACHABLE => "Network unreachable".to_string(),
        REP_HOST_UNREACHABLE => "Host unreachable".to_string(),
        REP_CONNECTION_REFUSED => "Connection refused".to_string(),
        REP_TTL_EXPIRED => "TTL expired".to_string(),
        REP_COMMAND_NOT_SUPPORTED => "Command not supported".to_string(),
        REP_ADDRESS_TYPE_NOT_SUPPORTED => "Address type not supported".to_string(),
        _ => format!("Unknown error: {}", code),
    }
}

/// Server side: read the greeting and answer it. Fails unless the client
/// offers no-auth.
pub async fn accept_greeting<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::protocol(format!(
            "Unsupported SOCKS version: {}",
            head[0]
        )));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(Error::auth("No acceptable authentication method"));
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;
    Ok(())
}

/// A CONNECT request read by the server side
#[derive(Debug)]
pub struct ConnectRequest {
    pub address: Address,
    pub port: u16,
}

impl ConnectRequest {
    /// Read the request; replies `command not supported` for anything but CONNECT.
    pub async fn read_from<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<Self> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                header[0]
            )));
        }

        let (address, port) = read_address_and_port(stream, header[3]).await?;
        if header[1] != CMD_CONNECT {
            write_reply(stream, REP_COMMAND_NOT_SUPPORTED, None).await?;
            return Err(Error::protocol(format!(
                "Unsupported SOCKS5 command: {}",
                header[1]
            )));
        }

        Ok(ConnectRequest { address, port })
    }
}

/// Write a reply; `bound` defaults to 0.0.0.0:0.
pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: u8,
    bound: Option<(Address, u16)>,
) -> Result<()> {
    let (address, port) = bound.unwrap_or((Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0));
    let mut buf = vec![SOCKS5_VERSION, reply, 0x00];
    address.encode_into(&mut buf)?;
    buf.extend_from_slice(&port.to_be_bytes());
    writer.write_all(&buf).await?;
    Ok(())
}
