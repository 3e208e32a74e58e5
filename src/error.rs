//! # Error Taxonomy
//!
//! Endpoints classify every I/O and protocol failure into one of the
//! categories so that state-machine transitions (reconnect vs.
//! terminal vs. drop-and-continue) can be driven by `match` rather than by
//! string inspection. `anyhow::Result` is still used at call boundaries the
//! same way elsewhere in the crate; `EndpointError` is the typed seam that
//! those `anyhow::Error`s carry when they originate inside this crate.

use std::io;
use thiserror::Error;

/// Classified endpoint failure.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Would-block / try-again / interrupted. Caller should rearm the wait
    /// and retry; never propagated as a hard failure.
    #[error("transient I/O condition: {0}")]
    TransientIo(#[source] io::Error),

    /// EOF, reset, broken pipe, bad descriptor, not-connected, timed-out.
    /// Triggers reconnect on client endpoints, connection removal on
    /// server-side connections.
    #[error("peer connection lost: {0}")]
    PeerLoss(#[source] io::Error),

    /// Invalid protocol version / message type / return code, oversize
    /// message without TP configured, or a disabled-cookie embedded cookie.
    #[error("semantic validity reject: {0}")]
    SemanticReject(String),

    /// Local command framing violation: missing start/end tag or declared
    /// size beyond the local transport maximum.
    #[error("local framing error: {0}")]
    LocalFraming(String),

    /// `submit`/`send` refused because the destination's queue limit would
    /// be exceeded. No side effects occurred.
    #[error("admission rejected: queue limit exceeded")]
    AdmissionRejected,

    /// Oversize payload with TP not configured for this (service, method).
    #[error("message too big for transport and TP not enabled")]
    MessageTooBig,

    /// The client-id pool for this diagnosis mask is exhausted.
    #[error("client id allocation pool exhausted")]
    ClientIdsExhausted,

    /// A pending operation was cancelled by an explicit `stop()`. Callers
    /// must swallow this rather than treat it as a failure.
    #[error("operation aborted by stop")]
    OperationAborted,
}

impl EndpointError {
    /// Classifies a raw `io::Error` into `TransientIo` or `PeerLoss`,
    /// mirroring the enumerated failure kinds.
    pub fn classify_io(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            WouldBlock | Interrupted | TimedOut if is_retry_timeout(&err) => {
                EndpointError::TransientIo(err)
            }
            UnexpectedEof
            | ConnectionReset
            | BrokenPipe
            | NotConnected
            | ConnectionAborted
            | TimedOut => EndpointError::PeerLoss(err),
            _ => EndpointError::TransientIo(err),
        }
    }

    /// True for the error kinds that imply the peer/connection is gone and
    /// a client endpoint should fall back to `CLOSED` and schedule a
    /// reconnect.
    pub fn implies_reconnect(&self) -> bool {
        matches!(self, EndpointError::PeerLoss(_))
    }
}

/// `TimedOut` is ambiguous between "the OS gave up on a half-open peer"
/// (peer loss) and "our own bounded wait elapsed" (transient); the latter
/// never reaches this classifier as an `io::Error`; this disambiguation
/// exists so classify_io stays a total function over `io::ErrorKind`.
fn is_retry_timeout(_err: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_peer_loss_kinds() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
        ] {
            let classified = EndpointError::classify_io(io::Error::from(kind));
            assert!(classified.implies_reconnect(), "{kind:?} should reconnect");
        }
    }

    #[test]
    fn classifies_would_block_as_transient() {
        let classified = EndpointError::classify_io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(!classified.implies_reconnect());
    }
}
