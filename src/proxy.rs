//! Optional HTTP CONNECT / SOCKS5 proxy transport for establishing a
//! `PooledClient`'s underlying TCP stream.
//!
//! The teacher crate always dials the target host directly
//! (`Client::connect_with_config((addr, port), ...)` in `session.rs`); this
//! module supplies the proxy hop spec.md §3's `ConnectionSpec.proxy` field
//! requires, in the teacher's style of a small async free function rather
//! than a trait object, since there are exactly two proxy kinds and no
//! plugin system (spec.md §1 Non-goals).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::catalog::{ProxyKind, ProxySpec};
use crate::error::{EngineError, Result};

/// Dials `target_host:target_port` through the given proxy and returns the
/// resulting stream, ready for the SSH/Telnet handshake to run over it.
///
/// Per the recorded Open Question decision (`SPEC_FULL.md`), failures here
/// are always [`EngineError::TransientIO`] — a proxy credential or reachability
/// problem is an environment condition the Reconnection Manager should retry,
/// not an `ssh:auth-request` to the end user.
pub async fn dial_proxy(proxy: &ProxySpec, target_host: &str, target_port: u16) -> Result<TcpStream> {
    match proxy.kind {
        ProxyKind::Http => connect_http(proxy, target_host, target_port).await,
        ProxyKind::Socks => connect_socks5(proxy, target_host, target_port).await,
    }
    .map_err(|err| EngineError::TransientIO(err.to_string()))
}

async fn connect_http(proxy: &ProxySpec, target_host: &str, target_port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(EngineError::from)?;

    let mut request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n"
    );
    if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
        use std::fmt::Write as _;
        let token = format!("{user}:{pass}");
        let encoded = BASE64.encode(token.as_bytes());
        let _ = write!(request, "Proxy-Authorization: Basic {encoded}\r\n");
    }
    request.push_str("Connection: keep-alive\r\n\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(EngineError::from)?;

    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.map_err(EngineError::from)?;
        if n == 0 {
            return Err(EngineError::TransientIO(
                "proxy closed connection before CONNECT response".to_string(),
            ));
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return Err(EngineError::Protocol(
                "proxy CONNECT response too large".to_string(),
            ));
        }
    }

    let response = String::from_utf8_lossy(&buf);
    let status_line = response.lines().next().unwrap_or_default();
    let status_ok = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .map(|code| (200..300).contains(&code))
        .unwrap_or(false);

    if !status_ok {
        return Err(EngineError::TransientIO(format!(
            "proxy CONNECT rejected: {status_line}"
        )));
    }

    Ok(stream)
}

async fn connect_socks5(proxy: &ProxySpec, target_host: &str, target_port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(EngineError::from)?;

    let has_creds = proxy.username.is_some() && proxy.password.is_some();
    let methods: &[u8] = if has_creds { &[0x00, 0x02] } else { &[0x00] };
    let mut greeting = vec![0x05u8, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await.map_err(EngineError::from)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(EngineError::from)?;
    if reply[0] != 0x05 {
        return Err(EngineError::Protocol("not a SOCKS5 proxy".to_string()));
    }

    match reply[1] {
        0x00 => {}
        0x02 => {
            let (user, pass) = (
                proxy.username.clone().unwrap_or_default(),
                proxy.password.clone().unwrap_or_default(),
            );
            let mut auth = vec![0x01u8, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream.write_all(&auth).await.map_err(EngineError::from)?;

            let mut auth_reply = [0u8; 2];
            stream
                .read_exact(&mut auth_reply)
                .await
                .map_err(EngineError::from)?;
            if auth_reply[1] != 0x00 {
                return Err(EngineError::TransientIO(
                    "SOCKS5 proxy authentication rejected".to_string(),
                ));
            }
        }
        0xFF => {
            return Err(EngineError::TransientIO(
                "SOCKS5 proxy has no acceptable authentication method".to_string(),
            ));
        }
        other => {
            return Err(EngineError::Protocol(format!(
                "unexpected SOCKS5 auth method selected: {other}"
            )));
        }
    }

    let mut request = vec![0x05u8, 0x01, 0x00, 0x03, target_host.len() as u8];
    request.extend_from_slice(target_host.as_bytes());
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await.map_err(EngineError::from)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(EngineError::from)?;
    if header[1] != 0x00 {
        return Err(EngineError::TransientIO(format!(
            "SOCKS5 CONNECT failed with reply code {}",
            header[1]
        )));
    }

    let addr_len = match header[3] {
        0x01 => 4,
        0x03 => {
            let mut len_byte = [0u8; 1];
            stream.read_exact(&mut len_byte).await.map_err(EngineError::from)?;
            len_byte[0] as usize
        }
        0x04 => 16,
        other => {
            return Err(EngineError::Protocol(format!(
                "unexpected SOCKS5 address type {other}"
            )));
        }
    };
    let mut discard = vec![0u8; addr_len + 2];
    stream.read_exact(&mut discard).await.map_err(EngineError::from)?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_matches_known_vectors() {
        assert_eq!(BASE64.encode(b"demo:pw"), "ZGVtbzpwdw==");
        assert_eq!(BASE64.encode(b""), "");
        assert_eq!(BASE64.encode(b"a"), "YQ==");
    }
}
