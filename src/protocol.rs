//! The wire contract shared by plugin servers and host clients.
//!
//! A plugin announces itself by writing the decimal TCP port it bound as the
//! very first line on stdout. Everything afterwards is HTTP on
//! `http://127.0.0.1:<port>`:
//!
//! - `/_healthz` answers `ok`
//! - `/_schemas` lists every function's schema document
//! - `/<function>/_schemas` describes one function
//! - `POST /<function>` invokes it

use std::io::{self, Write};
use std::net::Ipv4Addr;
use thiserror::Error;
use url::Url;

pub const HEALTH_PATH: &str = "_healthz";
pub const SCHEMAS_PATH: &str = "_schemas";

pub const LOOPBACK_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Longest handshake line accepted, terminator included.
pub const MAX_HANDSHAKE_LEN: u64 = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake line is not newline terminated: {0:?}")]
    Unterminated(String),

    #[error("invalid port received from plugin: {0:?}")]
    InvalidPort(String),
}

/// Write the handshake line and flush it.
pub fn write_handshake<W: Write>(out: &mut W, port: u16) -> io::Result<()> {
    writeln!(out, "{port}")?;
    out.flush()
}

/// Parse a handshake line as read from the plugin, terminator included.
pub fn parse_handshake(line: &str) -> Result<u16, HandshakeError> {
    let Some(body) = line.strip_suffix('\n') else {
        return Err(HandshakeError::Unterminated(line.to_string()));
    };
    let body = body.strip_suffix('\r').unwrap_or(body);

    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HandshakeError::InvalidPort(body.to_string()));
    }

    match body.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(HandshakeError::InvalidPort(body.to_string())),
    }
}

pub fn loopback_url(port: u16) -> Result<Url, url::ParseError> {
    Url::parse(&format!("http://{LOOPBACK_HOST}:{port}"))
}
