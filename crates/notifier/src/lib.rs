//! Outbound HTTP for the delivery pipeline.
//!
//! - [`delivery`]: callback delivery policy over a [`delivery::CallbackTransport`]
//! - [`webhook`]: reqwest transport posting callbacks to service endpoints
//! - [`gateway`]: reqwest client for the profile, contact, permission,
//!   provider and onsite services

pub mod delivery;
pub mod gateway;
pub mod webhook;

use relay_engine::collaborators::TransportError;

/// Map a reqwest failure onto the shared transport error.
pub(crate) fn transport_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::Malformed(e.to_string())
    } else if let Some(status) = e.status() {
        TransportError::Http {
            status: status.as_u16(),
            message: e.to_string(),
        }
    } else {
        TransportError::Connection(e.to_string())
    }
}

/// Longest response body kept in an error message.
pub(crate) const MAX_ERROR_BODY: usize = 512;

pub(crate) fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body_respects_char_boundary() {
        let body = "é".repeat(400);
        let cut = truncate_body(body);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(cut.chars().all(|c| c == 'é'));

        assert_eq!(truncate_body("short".to_string()), "short");
    }
}
