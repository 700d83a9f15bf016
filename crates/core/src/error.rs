//! Error types for the RETS client library.

use std::fmt;

/// Errors that can occur in the RETS client library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Transport`](Self::Transport), [`Io`](Self::Io),
///   [`Cancelled`](Self::Cancelled), [`DeadlineExceeded`](Self::DeadlineExceeded).
/// - **Authentication**: [`Authentication`](Self::Authentication).
/// - **Configuration**: [`InvalidHeader`](Self::InvalidHeader).
/// - **Decode (structural)**: [`Decode`](Self::Decode), [`Reply`](Self::Reply).
/// - **Decode (row)**: [`Xml`](Self::Xml), [`Escape`](Self::Escape), handed to
///   the row callback of [`CompactResult::listen`](crate::protocol::CompactResult::listen)
///   rather than aborting the result.
#[derive(Debug, thiserror::Error)]
pub enum RetsError {
    /// Underlying I/O error while reading a response body.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP client failed to deliver the request or read the response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The request [`Context`](crate::transport::Context) was cancelled while in flight.
    #[error("request cancelled")]
    Cancelled,

    /// The request [`Context`](crate::transport::Context) deadline passed while in flight.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// HTTP or user-agent authentication could not be completed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A configured value cannot be sent as the named HTTP header.
    #[error("invalid value for header {0}")]
    InvalidHeader(&'static str),

    /// A response body is missing required structure or carries unparsable values.
    #[error("RETS decode error: {kind}")]
    Decode { kind: DecodeErrorKind },

    /// The server answered with a non-zero reply code and no result data.
    #[error("RETS reply {code}: {text}")]
    Reply { code: i32, text: String },

    /// The XML tokenizer rejected the body.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// An entity reference could not be resolved (strict mode only).
    #[error("XML escape error: {0}")]
    Escape(#[from] quick_xml::escape::EscapeError),
}

impl RetsError {
    pub(crate) fn decode(kind: DecodeErrorKind) -> Self {
        RetsError::Decode { kind }
    }

    /// Whether this is a structural decode failure of a response body.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::Reply { .. })
    }

    /// Whether this is an authentication failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// Specific kind of structural decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The body ended before the required structure was read. Covers empty bodies.
    UnexpectedEof,
    /// A required element never appeared.
    MissingElement(&'static str),
    /// A required attribute was absent from its element.
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },
    /// An attribute was present but could not be parsed.
    InvalidAttribute {
        attribute: &'static str,
        value: String,
    },
    /// A `Key=Value` entry had a value of the wrong shape.
    InvalidValue { key: String, value: String },
    /// The declared charset is unknown or cannot be tokenized byte-wise.
    UnsupportedCharset(String),
    /// Text bytes were not valid in the active charset (strict mode only).
    InvalidText(&'static str),
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of body"),
            Self::MissingElement(name) => write!(f, "missing element <{name}>"),
            Self::MissingAttribute { element, attribute } => {
                write!(f, "missing attribute {attribute} on <{element}>")
            }
            Self::InvalidAttribute { attribute, value } => {
                write!(f, "invalid {attribute} value {value:?}")
            }
            Self::InvalidValue { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            Self::UnsupportedCharset(label) => write!(f, "unsupported charset {label:?}"),
            Self::InvalidText(charset) => write!(f, "text is not valid {charset}"),
        }
    }
}

/// Convenience alias for `Result<T, RetsError>`.
pub type Result<T> = std::result::Result<T, RetsError>;
