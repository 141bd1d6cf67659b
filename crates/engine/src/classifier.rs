//! Failure classification.
//!
//! Every collaborator error maps onto one of five classes; the retry policy
//! decides what each class means for the notification.

use crate::collaborators::{
    ContactLookupError, PermissionError, ProfileLookupError, ProviderError, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Transient: try again later.
    Retryable,
    /// The request can never succeed as sent.
    NonRetryable,
    /// The recipient cannot be reached, ever.
    Permanent,
    /// The recipient opted out. A business outcome, not an error.
    PreferencesDeclined,
    NoContactInfo,
}

/// Implemented by collaborator errors.
pub trait Classify {
    fn classify(&self) -> Classification;

    /// Human-readable reason stored as `status_reason` when the failure ends
    /// the pipeline.
    fn failure_reason(&self) -> String;
}

/// Shared HTTP status mapping.
pub fn classify_http_status(status: u16) -> Classification {
    match status {
        429 | 500..=599 => Classification::Retryable,
        _ => Classification::NonRetryable,
    }
}

impl Classify for TransportError {
    fn classify(&self) -> Classification {
        match self {
            TransportError::Timeout | TransportError::Connection(_) => Classification::Retryable,
            TransportError::Http { status, .. } => classify_http_status(*status),
            TransportError::Malformed(_) => Classification::NonRetryable,
        }
    }

    fn failure_reason(&self) -> String {
        match self {
            TransportError::Http { status, .. } => format!("Downstream service returned HTTP {}", status),
            other => format!("Downstream service error: {}", other),
        }
    }
}

impl Classify for ProfileLookupError {
    fn classify(&self) -> Classification {
        match self {
            ProfileLookupError::Deceased => Classification::Permanent,
            ProfileLookupError::NotFound
            | ProfileLookupError::MultipleActive
            | ProfileLookupError::IncorrectIdentifierCount
            | ProfileLookupError::UnsupportedIdentifier(_) => Classification::NonRetryable,
            ProfileLookupError::Transport(e) => e.classify(),
        }
    }

    fn failure_reason(&self) -> String {
        match self {
            ProfileLookupError::NotFound => "Recipient profile not found".to_string(),
            ProfileLookupError::MultipleActive => {
                "Recipient has multiple active profiles".to_string()
            }
            ProfileLookupError::Deceased => "Recipient is deceased".to_string(),
            ProfileLookupError::IncorrectIdentifierCount => {
                "Incorrect number of identifiers for recipient".to_string()
            }
            ProfileLookupError::UnsupportedIdentifier(t) => {
                format!("Unsupported recipient identifier type: {}", t)
            }
            ProfileLookupError::Transport(e) => e.failure_reason(),
        }
    }
}

impl Classify for ContactLookupError {
    fn classify(&self) -> Classification {
        match self {
            ContactLookupError::NoContactInfo => Classification::NoContactInfo,
            ContactLookupError::Transport(e) => e.classify(),
        }
    }

    fn failure_reason(&self) -> String {
        match self {
            ContactLookupError::NoContactInfo => {
                "No contact information found for recipient".to_string()
            }
            ContactLookupError::Transport(e) => e.failure_reason(),
        }
    }
}

impl Classify for PermissionError {
    fn classify(&self) -> Classification {
        match self {
            // Callers holding a default-allow communication item pass this through
            // before classification.
            PermissionError::NoPreferenceOnFile => Classification::Permanent,
            PermissionError::Transport(e) => e.classify(),
        }
    }

    fn failure_reason(&self) -> String {
        match self {
            PermissionError::NoPreferenceOnFile => {
                "Recipient has no communication preference on file".to_string()
            }
            PermissionError::Transport(e) => e.failure_reason(),
        }
    }
}

impl Classify for ProviderError {
    fn classify(&self) -> Classification {
        match self {
            ProviderError::InvalidRecipient(_) => Classification::Permanent,
            ProviderError::Misconfigured(_) => Classification::NonRetryable,
            ProviderError::Transport(e) => e.classify(),
        }
    }

    fn failure_reason(&self) -> String {
        match self {
            ProviderError::InvalidRecipient(detail) => format!("Invalid recipient: {}", detail),
            ProviderError::Misconfigured(detail) => format!("Provider misconfigured: {}", detail),
            ProviderError::Transport(e) => e.failure_reason(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::types::IdentifierType;

    fn http(status: u16) -> TransportError {
        TransportError::Http {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_http_mapping() {
        for status in [429, 500, 502, 503, 504, 599] {
            assert_eq!(classify_http_status(status), Classification::Retryable, "{status}");
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert_eq!(classify_http_status(status), Classification::NonRetryable, "{status}");
        }
    }

    #[test]
    fn test_transport_mapping() {
        assert_eq!(TransportError::Timeout.classify(), Classification::Retryable);
        assert_eq!(
            TransportError::Connection("reset".into()).classify(),
            Classification::Retryable
        );
        assert_eq!(
            TransportError::Malformed("eof".into()).classify(),
            Classification::NonRetryable
        );
    }

    #[test]
    fn test_profile_lookup_mapping() {
        assert_eq!(ProfileLookupError::Deceased.classify(), Classification::Permanent);
        assert_eq!(ProfileLookupError::NotFound.classify(), Classification::NonRetryable);
        assert_eq!(
            ProfileLookupError::MultipleActive.classify(),
            Classification::NonRetryable
        );
        assert_eq!(
            ProfileLookupError::UnsupportedIdentifier(IdentifierType::Pid).classify(),
            Classification::NonRetryable
        );
        assert_eq!(
            ProfileLookupError::Transport(http(503)).classify(),
            Classification::Retryable
        );
    }

    #[test]
    fn test_contact_permission_provider_mapping() {
        assert_eq!(
            ContactLookupError::NoContactInfo.classify(),
            Classification::NoContactInfo
        );
        assert_eq!(
            ContactLookupError::Transport(http(404)).classify(),
            Classification::NonRetryable
        );
        assert_eq!(
            PermissionError::NoPreferenceOnFile.classify(),
            Classification::Permanent
        );
        assert_eq!(
            ProviderError::InvalidRecipient("bad number".into()).classify(),
            Classification::Permanent
        );
        assert_eq!(
            ProviderError::Misconfigured("no sender".into()).classify(),
            Classification::NonRetryable
        );
        assert_eq!(
            ProviderError::Transport(http(429)).classify(),
            Classification::Retryable
        );
        assert_eq!(
            ProviderError::InvalidRecipient("bad number".into()).failure_reason(),
            "Invalid recipient: bad number"
        );
    }
}
