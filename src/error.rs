//! Error types for selective refresh.

use serde::{Deserialize, Deserializer, Serialize};

/// Wire-level error codes exchanged between the preview and the render
/// authority. Codes this build does not know decode as
/// [`ErrorCode::Unrecognized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Missing or unrecognised auth token.
    BadNonce,
    /// Token is valid but lacks the capability to preview.
    CustomizeNotAllowed,
    /// The batch carried no partial requests.
    MissingPartials,
    /// The batch could not be decoded.
    MalformedPartials,
    /// The authority has no partial with the requested id.
    UnknownPartial,
    /// A signed structural context failed verification.
    SignatureMismatch,
    /// A structural context that must be signed carried no signature.
    MissingSignature,
    /// The renderer failed for one context.
    RenderFailed,
    /// A client-supplied context referenced a container the authority does not know.
    MissingContainer,
    /// Any code outside this list, e.g. from a newer authority.
    Unrecognized,
}

impl ErrorCode {
    /// Render the code to its wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadNonce => "bad_nonce",
            Self::CustomizeNotAllowed => "customize_not_allowed",
            Self::MissingPartials => "missing_partials",
            Self::MalformedPartials => "malformed_partials",
            Self::UnknownPartial => "unknown_partial",
            Self::SignatureMismatch => "signature_mismatch",
            Self::MissingSignature => "missing_signature",
            Self::RenderFailed => "render_failed",
            Self::MissingContainer => "missing_container",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Parse a wire code; unknown codes become [`ErrorCode::Unrecognized`].
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "bad_nonce" => Self::BadNonce,
            "customize_not_allowed" => Self::CustomizeNotAllowed,
            "missing_partials" => Self::MissingPartials,
            "malformed_partials" => Self::MalformedPartials,
            "unknown_partial" => Self::UnknownPartial,
            "signature_mismatch" => Self::SignatureMismatch,
            "missing_signature" => Self::MissingSignature,
            "render_failed" => Self::RenderFailed,
            "missing_container" => Self::MissingContainer,
            _ => Self::Unrecognized,
        }
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for the refresh protocol.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    /// The authority rejected the batch's credentials.
    #[error("auth error: {0}")]
    Auth(ErrorCode),

    /// The batch or response had an invalid shape.
    #[error("validation error: {0}")]
    Validation(String),

    /// A structural context was tampered with or is stale.
    #[error("signature mismatch for partial {0}")]
    SignatureMismatch(String),

    /// The authority does not know the partial.
    #[error("unknown partial {0}")]
    UnknownPartial(String),

    /// The renderer failed, or returned nothing, for one container.
    #[error("render error for partial {partial}: {code}")]
    Render { partial: String, code: ErrorCode },

    /// Container could not be found in the live document.
    #[error("missing container for partial {0}")]
    MissingContainer(String),

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The request was cancelled before it completed.
    #[error("refresh cancelled")]
    Cancelled,

    /// Message channel error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Document parse or selector error.
    #[error("document error: {0}")]
    Document(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl RefreshError {
    /// Map a per-partial wire error code onto the error taxonomy.
    #[must_use]
    pub fn from_code(partial: &str, code: ErrorCode) -> Self {
        match code {
            ErrorCode::BadNonce | ErrorCode::CustomizeNotAllowed => Self::Auth(code),
            ErrorCode::MissingPartials | ErrorCode::MalformedPartials => {
                Self::Validation(code.as_str().to_owned())
            }
            ErrorCode::UnknownPartial => Self::UnknownPartial(partial.to_owned()),
            ErrorCode::SignatureMismatch | ErrorCode::MissingSignature => {
                Self::SignatureMismatch(partial.to_owned())
            }
            ErrorCode::MissingContainer => Self::MissingContainer(partial.to_owned()),
            ErrorCode::RenderFailed | ErrorCode::Unrecognized => Self::Render {
                partial: partial.to_owned(),
                code,
            },
        }
    }

    /// Whether the error came from an explicit cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for RefreshError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, RefreshError>;
