//! Error types for the session manager.

use minidom::Element;
use thiserror::Error;

use crate::packet::ns;

/// Session manager errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (configuration file access)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A `to`/`from` attribute did not hold a valid JID
    #[error("Malformed JID: {0}")]
    JidMalformed(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The connection has no user session yet
    #[error("Session not found or expired")]
    SessionNotFound,

    /// No resource connection is registered under the given id
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// The connection is closing and cannot be modified
    #[error("Connection is closing: {0}")]
    ConnectionClosing(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Resource conflict (e.g., duplicate resource binding)
    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    /// An error response was requested for a packet that is already an error
    #[error("Packet is already of error type")]
    PacketErrorType,

    /// External repository failure
    #[error("Repository error: {0}")]
    Repository(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Opaque failure raised by a plugin
    #[error(transparent)]
    Plugin(#[from] anyhow::Error),

    /// Stanza error (for error responses)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl XmppError {
    /// Create a new malformed JID error.
    pub fn jid_malformed(msg: impl Into<String>) -> Self {
        Self::JidMalformed(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new permission denied error.
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a new repository error.
    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error using the condition's default error type.
    pub fn stanza(condition: StanzaErrorCondition, text: Option<String>) -> Self {
        Self::Stanza {
            condition,
            error_type: condition.default_type(),
            text,
        }
    }

    /// Create a stanza error for 'not-authorized'.
    pub fn not_authorized(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAuthorized, text)
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::BadRequest, text)
    }

    /// Create a stanza error for 'item-not-found'.
    pub fn item_not_found(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ItemNotFound, text)
    }

    /// Create a stanza error for 'feature-not-implemented'.
    pub fn feature_not_implemented(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::FeatureNotImplemented, text)
    }

    /// Create a stanza error for 'forbidden'.
    pub fn forbidden(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::Forbidden, text)
    }

    /// Create a stanza error for 'internal-server-error'.
    pub fn internal_server_error(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::InternalServerError, text)
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ServiceUnavailable, text)
    }

    /// Create a stanza error for 'resource-constraint'.
    pub fn resource_constraint(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ResourceConstraint, text)
    }

    /// Create a stanza error for 'conflict'.
    pub fn conflict(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::Conflict, text)
    }

    /// The stanza condition to report back to the sender for this error.
    pub fn condition(&self) -> StanzaErrorCondition {
        match self {
            Self::Stanza { condition, .. } => *condition,
            Self::JidMalformed(_) => StanzaErrorCondition::JidMalformed,
            Self::AuthFailed(_) | Self::SessionNotFound => StanzaErrorCondition::NotAuthorized,
            Self::PermissionDenied(_) => StanzaErrorCondition::Forbidden,
            Self::ResourceConflict(_) => StanzaErrorCondition::Conflict,
            Self::ConnectionNotFound(_) => StanzaErrorCondition::ItemNotFound,
            _ => StanzaErrorCondition::InternalServerError,
        }
    }

    /// Text to attach to a synthesized error response, if any.
    pub fn response_text(&self) -> Option<String> {
        match self {
            Self::Stanza { text, .. } => text.clone(),
            Self::Internal(_) | Self::Plugin(_) | Self::Repository(_) => None,
            other => Some(other.to_string()),
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Gone (entity no longer available)
    Gone,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Payment required (legacy)
    PaymentRequired,
    /// Policy violation
    PolicyViolation,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Redirect
    Redirect,
    /// Registration required
    RegistrationRequired,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Subscription required
    SubscriptionRequired,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PaymentRequired => "payment-required",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// Legacy numeric error code (XEP-0086).
    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest | Self::JidMalformed | Self::UnexpectedRequest => 400,
            Self::NotAuthorized => 401,
            Self::PaymentRequired => 402,
            Self::Forbidden => 403,
            Self::ItemNotFound | Self::RecipientUnavailable | Self::RemoteServerNotFound => 404,
            Self::NotAllowed => 405,
            Self::NotAcceptable | Self::PolicyViolation => 406,
            Self::RegistrationRequired | Self::SubscriptionRequired => 407,
            Self::Conflict => 409,
            Self::Gone | Self::Redirect => 302,
            Self::InternalServerError | Self::ResourceConstraint | Self::UndefinedCondition => 500,
            Self::FeatureNotImplemented => 501,
            Self::ServiceUnavailable => 503,
            Self::RemoteServerTimeout => 504,
        }
    }

    /// Error type reported alongside this condition unless overridden.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest
            | Self::Gone
            | Self::JidMalformed
            | Self::NotAcceptable
            | Self::PolicyViolation
            | Self::Redirect => StanzaErrorType::Modify,
            Self::Forbidden
            | Self::NotAuthorized
            | Self::PaymentRequired
            | Self::RegistrationRequired
            | Self::SubscriptionRequired => StanzaErrorType::Auth,
            Self::InternalServerError
            | Self::RecipientUnavailable
            | Self::RemoteServerTimeout
            | Self::ResourceConstraint
            | Self::UnexpectedRequest => StanzaErrorType::Wait,
            Self::Conflict
            | Self::FeatureNotImplemented
            | Self::ItemNotFound
            | Self::NotAllowed
            | Self::RemoteServerNotFound
            | Self::ServiceUnavailable
            | Self::UndefinedCondition => StanzaErrorType::Cancel,
        }
    }

    /// Build the `<error/>` child for this condition.
    pub fn to_element(&self, error_type: StanzaErrorType, text: Option<&str>) -> Element {
        let mut builder = Element::builder("error", ns::CLIENT)
            .attr("type", error_type.as_str())
            .attr("code", self.code().to_string())
            .append(Element::builder(self.as_str(), ns::STANZAS).build());

        if let Some(text) = text {
            builder = builder.append(
                Element::builder("text", ns::STANZAS)
                    .attr("xml:lang", "en")
                    .append(text.to_string())
                    .build(),
            );
        }

        builder.build()
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a processor's `can_handle` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// The processor accepts the packet
    Authorized,
    /// The processor recognises the packet but refuses it
    Denied(StanzaErrorCondition),
}

/// Build a stream error element, carried inside CLOSE commands.
pub fn stream_error_element(condition: &str) -> Element {
    Element::builder(condition, ns::STREAMS).build()
}

/// Common stream error conditions.
pub mod stream_errors {
    /// Stream error: conflict (resource already connected)
    pub const CONFLICT: &str = "conflict";
    /// Stream error: connection timeout
    pub const CONNECTION_TIMEOUT: &str = "connection-timeout";
    /// Stream error: not authorized
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    /// Stream error: policy violation
    pub const POLICY_VIOLATION: &str = "policy-violation";
    /// Stream error: system shutdown
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stanza_error_conditions() {
        assert_eq!(StanzaErrorCondition::BadRequest.as_str(), "bad-request");
        assert_eq!(StanzaErrorCondition::NotAuthorized.as_str(), "not-authorized");
        assert_eq!(StanzaErrorCondition::ItemNotFound.as_str(), "item-not-found");
    }

    #[test]
    fn test_legacy_codes_and_types() {
        let cases = [
            (StanzaErrorCondition::ServiceUnavailable, 503, StanzaErrorType::Cancel),
            (StanzaErrorCondition::ResourceConstraint, 500, StanzaErrorType::Wait),
            (StanzaErrorCondition::FeatureNotImplemented, 501, StanzaErrorType::Cancel),
            (StanzaErrorCondition::NotAuthorized, 401, StanzaErrorType::Auth),
            (StanzaErrorCondition::Forbidden, 403, StanzaErrorType::Auth),
            (StanzaErrorCondition::ItemNotFound, 404, StanzaErrorType::Cancel),
            (StanzaErrorCondition::JidMalformed, 400, StanzaErrorType::Modify),
        ];

        for (condition, code, error_type) in cases {
            assert_eq!(condition.code(), code, "{condition}");
            assert_eq!(condition.default_type(), error_type, "{condition}");
        }
    }

    #[test]
    fn test_error_element_contains_condition_and_text() {
        let el = StanzaErrorCondition::ResourceConstraint
            .to_element(StanzaErrorType::Wait, Some("Server subsystem overloaded"));

        assert_eq!(el.attr("type"), Some("wait"));
        assert_eq!(el.attr("code"), Some("500"));
        assert!(el.has_child("resource-constraint", ns::STANZAS));
        assert_eq!(
            el.get_child("text", ns::STANZAS).map(|t| t.text()),
            Some("Server subsystem overloaded".to_string())
        );
    }

    #[test]
    fn test_error_condition_mapping() {
        assert_eq!(
            XmppError::permission_denied("nope").condition(),
            StanzaErrorCondition::Forbidden
        );
        assert_eq!(
            XmppError::internal("boom").condition(),
            StanzaErrorCondition::InternalServerError
        );
        assert_eq!(XmppError::internal("boom").response_text(), None);

        let err = XmppError::resource_constraint(Some("full".into()));
        assert_eq!(err.condition(), StanzaErrorCondition::ResourceConstraint);
        assert_eq!(err.response_text().as_deref(), Some("full"));
    }
}
