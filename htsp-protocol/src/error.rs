//! Error types for the HTSP protocol and client.

use thiserror::Error;

/// Codec-level errors. Every variant means the message is malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended before a length-prefixed item was complete.
    #[error("Truncated message: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Field type tag is unknown.
    #[error("Unknown field type: 0x{0:02X}")]
    UnknownFieldType(u8),

    /// Integer payload does not fit in 64 bits.
    #[error("Invalid integer width: {0} bytes")]
    InvalidInteger(usize),

    /// Frame body is too large.
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u32, u32),

    /// Field name does not fit the one-byte length prefix.
    #[error("Field name too long: {0} bytes")]
    NameTooLong(usize),

    /// A list contained something other than nested messages.
    #[error("Unexpected list entry type: 0x{0:02X}")]
    UnexpectedListEntry(u8),

    /// The frame length prefix disagrees with the bytes supplied.
    #[error("Frame length mismatch: declared {declared}, actual {actual}")]
    FrameLengthMismatch { declared: usize, actual: usize },

    /// Maps and lists nested deeper than the decoder accepts.
    #[error("Nesting too deep: {0} levels")]
    NestingTooDeep(usize),

    /// A required field is absent.
    #[error("Missing field: {0}")]
    MissingField(String),

    /// A field holds a different type than the caller asked for.
    #[error("Field '{name}' is not {expected}")]
    WrongFieldType { name: String, expected: &'static str },

    /// A text field is not valid UTF-8.
    #[error("Invalid UTF-8 in field '{0}'")]
    InvalidUtf8(String),
}

/// Client-side errors surfaced to callers of the connection and supervisor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Framing or decode failure; fatal to the connection it occurred on.
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] ProtocolError),

    /// The server rejected the credentials.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Socket error or peer close while a request was outstanding.
    #[error("Connection lost")]
    ConnectionLost,

    /// The caller abandoned the wait.
    #[error("Cancelled")]
    Cancelled,

    /// The request did not complete within the configured timeout.
    #[error("Request timed out")]
    Timeout,

    /// A request was issued before the connection was opened.
    #[error("Not connected")]
    NotConnected,

    /// I/O failure while writing to the socket.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        ClientError::Io(value.to_string())
    }
}

impl ClientError {
    /// Returns true if the connection this error came from must be rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::MalformedMessage(_) | ClientError::ConnectionLost | ClientError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_converts_to_malformed() {
        let err: ClientError = ProtocolError::UnknownFieldType(9).into();
        assert!(matches!(err, ClientError::MalformedMessage(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_caller_errors_are_not_fatal() {
        assert!(!ClientError::Cancelled.is_fatal());
        assert!(!ClientError::Timeout.is_fatal());
        assert!(!ClientError::AuthenticationFailed.is_fatal());
    }
}
