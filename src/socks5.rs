//! Minimal SOCKS5 server handshake (RFC 1928): no authentication, CONNECT
//! only, IPv4/IPv6/domain address types. Used by the socks5-proxy sender
//! mode to accept dynamic forwarding requests from clients like `ssh -D`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION5: u8 = 0x05;

pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ADDR_IPV4: u8 = 0x01;
pub const ADDR_DOMAIN: u8 = 0x03;
pub const ADDR_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Performs the server-side SOCKS5 negotiation: auth method selection
/// (no-auth only) and a CONNECT request. On success returns the requested
/// target as `host:port`; the caller sends the reply via [`send_reply`].
/// Command and address-type rejections reply with their specific codes
/// before returning an error.
pub async fn handshake<S>(conn: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Auth negotiation: VER | NMETHODS | METHODS...
    let mut header = [0u8; 2];
    conn.read_exact(&mut header)
        .await
        .context("read auth header")?;
    if header[0] != VERSION5 {
        bail!("unsupported SOCKS version: {}", header[0]);
    }
    let n_methods = header[1] as usize;
    if n_methods == 0 {
        bail!("no auth methods offered");
    }
    let mut methods = vec![0u8; n_methods];
    conn.read_exact(&mut methods)
        .await
        .context("read auth methods")?;

    if !methods.contains(&AUTH_NONE) {
        let _ = conn.write_all(&[VERSION5, AUTH_NO_ACCEPTABLE]).await;
        bail!("client does not support no-auth");
    }
    conn.write_all(&[VERSION5, AUTH_NONE])
        .await
        .context("write auth reply")?;

    // CONNECT request: VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
    let mut req = [0u8; 4];
    conn.read_exact(&mut req)
        .await
        .context("read request header")?;
    if req[0] != VERSION5 {
        bail!("unsupported SOCKS version in request: {}", req[0]);
    }
    if req[1] != CMD_CONNECT {
        let _ = send_reply(conn, REP_COMMAND_NOT_SUPPORTED, None).await;
        bail!("unsupported SOCKS command: {}", req[1]);
    }

    let host = match req[3] {
        ADDR_IPV4 => {
            let mut addr = [0u8; 4];
            conn.read_exact(&mut addr).await.context("read IPv4")?;
            Ipv4Addr::from(addr).to_string()
        }
        ADDR_IPV6 => {
            let mut addr = [0u8; 16];
            conn.read_exact(&mut addr).await.context("read IPv6")?;
            format!("[{}]", Ipv6Addr::from(addr))
        }
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len)
                .await
                .context("read domain length")?;
            let mut domain = vec![0u8; len[0] as usize];
            conn.read_exact(&mut domain).await.context("read domain")?;
            String::from_utf8(domain).context("domain is not UTF-8")?
        }
        other => {
            let _ = send_reply(conn, REP_ADDRESS_NOT_SUPPORTED, None).await;
            bail!("unsupported address type: {other}");
        }
    };

    let mut port_buf = [0u8; 2];
    conn.read_exact(&mut port_buf).await.context("read port")?;
    let port = u16::from_be_bytes(port_buf);

    Ok(format!("{host}:{port}"))
}

/// Sends a SOCKS5 reply. Without a bind address the reply carries the
/// all-zero IPv4 address.
pub async fn send_reply<S>(conn: &mut S, rep: u8, bind_addr: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[VERSION5, rep, 0x00]);
    match bind_addr {
        Some(addr) => {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    reply.push(ADDR_IPV4);
                    reply.extend_from_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    reply.push(ADDR_IPV6);
                    reply.extend_from_slice(&ip.octets());
                }
            }
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            reply.push(ADDR_IPV4);
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    conn.write_all(&reply).await.context("write reply")?;
    Ok(())
}
