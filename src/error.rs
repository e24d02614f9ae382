//! Error types shared across the tunnel.

use thiserror::Error;

/// Everything that can go wrong between reading the config and the last ACK.
///
/// Cryptographic and format errors are recovered locally on the receiver (it
/// answers with its current cumulative ACK and moves on); `Timeout` feeds the
/// sender's congestion controller; `NoPeer` and `PermanentLoss` are fatal for
/// the session.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed tunnel data: {0}")]
    Format(String),

    #[error("authentication failure")]
    AuthFail,

    #[error("query timed out")]
    Timeout,

    #[error("no answer to reset handshake, is the server up?")]
    NoPeer,

    #[error("chunk {seq} exceeded the retransmission budget")]
    PermanentLoss { seq: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
