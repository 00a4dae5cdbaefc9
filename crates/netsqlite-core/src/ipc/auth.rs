//! Shared-secret handshake.
//!
//! When a server has a secret, the first frame on every fresh transport must
//! be `authenticate`. A server without a secret skips the check entirely and
//! answers any `authenticate` with success.

use super::protocol::{parse_request, Request, Response, AUTHENTICATED};
use super::transport::Transport;
use crate::error::{NetSqliteError, Result};
use tracing::{debug, warn};

/// Constant-time comparison to prevent timing attacks.
///
/// Runs over every byte regardless of where the first mismatch is. Only the
/// length is allowed to short-circuit.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Client side: present `token` on a fresh transport.
///
/// On rejection the transport is closed before the error is returned.
pub async fn authenticate(transport: &mut Transport, token: &str) -> Result<()> {
    match transport.call(&Request::authenticate(token)).await {
        Ok(_) => {
            debug!("Authenticated with {}", transport.peer_addr());
            Ok(())
        }
        Err(e) => {
            transport.close().await;
            Err(e)
        }
    }
}

/// Server side: run the handshake as the first exchange on `transport`.
///
/// Returns `Ok(())` once the peer has presented the right secret. On any
/// other first frame the peer gets an error response, the transport is
/// closed, and the rejection is returned.
pub async fn accept_handshake(transport: &mut Transport, secret: &str) -> Result<()> {
    let frame = transport.receive().await?;

    let rejection = match parse_request(&frame) {
        Ok(Request::Authenticate { token }) => {
            if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
                transport.respond(&Response::success(AUTHENTICATED)).await?;
                debug!("Client {} authenticated", transport.peer_addr());
                return Ok(());
            }
            NetSqliteError::AuthenticationFailed {
                message: "Invalid authentication token".to_string(),
            }
        }
        Ok(other) => NetSqliteError::AuthenticationRequired {
            message: format!("`authenticate` must precede `{}`", other.method()),
        },
        Err(_) => NetSqliteError::AuthenticationRequired {
            message: "`authenticate` must be the first request".to_string(),
        },
    };

    warn!(
        "Rejecting client {}: {}",
        transport.peer_addr(),
        rejection
    );
    let _ = transport.respond(&Response::failure(&rejection)).await;
    transport.close().await;
    Err(rejection)
}
