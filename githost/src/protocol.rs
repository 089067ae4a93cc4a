//! Git smart HTTP wire protocol: service names and pkt-line framing.

use std::fmt;
use std::str::FromStr;

/// Flush packet terminating a pkt-line section
pub const FLUSH_PKT: &[u8] = b"0000";

/// Largest payload a single pkt-line can carry (65520 total minus the length field)
pub const MAX_PKT_PAYLOAD: usize = 65516;

/// Services that can be relayed over smart HTTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// `git-upload-pack` (fetch/clone)
    UploadPack,
    /// `git-receive-pack` (push)
    ReceivePack,
}

/// Whether the relay advertises refs or runs a full RPC exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Advertise,
    Rpc,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported service: {0}")]
    UnsupportedService(String),
    #[error("pkt-line payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

impl Service {
    /// Protocol name as it appears in URLs and headers
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    /// `git` subcommand implementing the service
    pub fn subcommand(&self) -> &'static str {
        match self {
            Service::UploadPack => "upload-pack",
            Service::ReceivePack => "receive-pack",
        }
    }

    /// Response content type for the given mode
    pub fn content_type(&self, mode: RelayMode) -> String {
        match mode {
            RelayMode::Advertise => format!("application/x-{}-advertisement", self.as_str()),
            RelayMode::Rpc => format!("application/x-{}-result", self.as_str()),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-upload-pack" => Ok(Service::UploadPack),
            "git-receive-pack" => Ok(Service::ReceivePack),
            other => Err(ProtocolError::UnsupportedService(other.to_string())),
        }
    }
}

/// Frame a payload as a single pkt-line: 4 lowercase hex digits holding
/// `payload.len() + 4`, followed by the payload.
pub fn encode_pkt_line(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_PKT_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    let mut line = Vec::with_capacity(payload.len() + 4);
    line.extend_from_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    line.extend_from_slice(payload);
    Ok(line)
}

/// Build the announcement sent before the advertised refs:
/// `<len># service=<service>\n0000`.
pub fn service_announcement(service: Service) -> Result<Vec<u8>, ProtocolError> {
    let mut body = encode_pkt_line(format!("# service={}\n", service).as_bytes())?;
    body.extend_from_slice(FLUSH_PKT);
    Ok(body)
}
