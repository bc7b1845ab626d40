//! The `[code, message]` error envelope shared by the router and the
//! built-in methods.

use core::fmt;

use rmpv::Value;

/// Router error codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ErrorCode {
    /// Wrong arity or argument type for an intrinsic or internal method.
    InvalidParams = 1,
    /// No route for the requested method.
    MethodNotAvailable = 2,
    /// Forwarding to the target peer failed at the transport layer.
    FailedToSendRequest = 3,
    /// Unclassified router error.
    Generic = 4,
    /// Duplicate `$/register`.
    RouteAlreadyExists = 5,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParams => write!(f, "invalid params"),
            Self::MethodNotAvailable => write!(f, "method not available"),
            Self::FailedToSendRequest => write!(f, "failed to send request"),
            Self::Generic => write!(f, "generic error"),
            Self::RouteAlreadyExists => write!(f, "route already exists"),
        }
    }
}

/// Build a `[code, message]` wire value with a raw code. Built-in methods
/// use this with their locally-meaningful codes.
pub fn envelope(code: i64, message: impl Into<String>) -> Value {
    Value::Array(vec![Value::from(code), Value::from(message.into())])
}

/// Build the `[code, message]` wire value for a router error response.
pub fn encoded(code: ErrorCode, message: impl Into<String>) -> Value {
    envelope(code as i64, message)
}

/// Failure of the in-process registration API.
#[derive(Debug, Clone)]
pub struct RouteError {
    code: ErrorCode,
    message: String,
}

impl RouteError {
    pub(crate) fn already_exists(route: &str) -> Self {
        Self {
            code: ErrorCode::RouteAlreadyExists,
            message: format!("route already exists: {route}"),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The wire form of this error.
    pub fn to_encoded(&self) -> Value {
        encoded(self.code, self.message.clone())
    }
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RouteError {}
