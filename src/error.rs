//! Gattlink errors

use num_enum::TryFromPrimitive;

/// The error type for device lifecycle and GATT operations
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    message: String,
}

impl Error {
    pub(crate) fn new(
        kind: ErrorKind,
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
        message: String,
    ) -> Self {
        Error { kind, source, message }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::new(kind, None, message.into())
    }

    /// Converts a gateway failure into an [`Error`], classified for the kind of request that produced it.
    pub(crate) fn from_bus(request: BusRequest, err: BusError) -> Self {
        let kind = classify(request, &err);
        Error::new(kind, Some(Box::new(err)), String::new())
    }

    /// Returns the corresponding [`ErrorKind`] for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the message for this error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The structured gateway error this error was built from, if any.
    pub fn bus_error(&self) -> Option<&BusError> {
        self.source.as_ref().and_then(|x| x.downcast_ref::<BusError>())
    }

    /// The Attribute Protocol error reported by the peer, if the gateway included one.
    pub fn att_error(&self) -> Option<AttError> {
        self.bus_error().and_then(BusError::att_error)
    }

    /// Whether the failure is likely to go away if the operation is simply retried.
    ///
    /// Link-layer timeouts and aborted connection attempts fall in this category. The state machine never retries on
    /// its own; this is a hint for callers implementing a retry policy.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            ErrorKind::Timeout | ErrorKind::Busy => true,
            ErrorKind::ConnectFailed => self.bus_error().is_some_and(BusError::is_transient),
            _ => false,
        }
    }

    /// A copy of this error for another waiter. Only a [`BusError`] source survives the copy.
    pub(crate) fn replicate(&self) -> Self {
        Error::new(
            self.kind,
            self.bus_error()
                .map(|x| Box::new(x.clone()) as Box<dyn std::error::Error + Send + Sync + 'static>),
            self.message.clone(),
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.message.is_empty(), &self.source) {
            (true, None) => write!(f, "{}", &self.kind),
            (false, None) => write!(f, "{}: {}", &self.kind, &self.message),
            (true, Some(err)) => write!(f, "{}: {}", &self.kind, err),
            (false, Some(err)) => write!(f, "{}: {} ({})", &self.kind, &self.message, err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|x| {
            let x: &(dyn std::error::Error + 'static) = &**x;
            x
        })
    }
}

/// A list of general categories of error.
#[non_exhaustive]
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// the Bluetooth adapter is not available
    AdapterUnavailable,
    /// permission denied
    PermissionDenied,
    /// connection failed
    ConnectFailed,
    /// the Bluetooth device isn't connected
    NotConnected,
    /// operation failed
    OperationFailed,
    /// a conflicting operation is outstanding
    Busy,
    /// timed out
    Timeout,
    /// the operation is not supported by this characteristic
    NotSupported,
    /// not found
    NotFound,
    /// invalid parameter
    InvalidParameter,
    /// an internal error has occured
    Internal,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            source: None,
            message: String::new(),
        }
    }
}

/// Well-known error names reported by the Bluetooth management service.
pub mod names {
    #![allow(missing_docs)]

    pub const FAILED: &str = "org.bluez.Error.Failed";
    pub const IN_PROGRESS: &str = "org.bluez.Error.InProgress";
    pub const INVALID_ARGUMENTS: &str = "org.bluez.Error.InvalidArguments";
    pub const INVALID_VALUE_LENGTH: &str = "org.bluez.Error.InvalidValueLength";
    pub const INVALID_OFFSET: &str = "org.bluez.Error.InvalidOffset";
    pub const NOT_AUTHORIZED: &str = "org.bluez.Error.NotAuthorized";
    pub const NOT_PERMITTED: &str = "org.bluez.Error.NotPermitted";
    pub const NOT_SUPPORTED: &str = "org.bluez.Error.NotSupported";
    pub const NOT_READY: &str = "org.bluez.Error.NotReady";
    pub const NOT_CONNECTED: &str = "org.bluez.Error.NotConnected";
    pub const ALREADY_CONNECTED: &str = "org.bluez.Error.AlreadyConnected";
    pub const DOES_NOT_EXIST: &str = "org.bluez.Error.DoesNotExist";
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
}

/// A failure reported by the bus gateway for a method call or property access.
///
/// Errors are identified by a dotted error `name` (for example `org.bluez.Error.Failed`) and carry a free-form
/// `message` from the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusError {
    name: String,
    message: String,
}

impl BusError {
    /// Creates a new gateway error
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        BusError {
            name: name.into(),
            message: message.into(),
        }
    }

    /// The dotted error name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The remote error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if this error has the given `name`.
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub(crate) fn is_failed_with(&self, text: &str) -> bool {
        self.is(names::FAILED) && self.message.contains(text)
    }

    /// Returns `true` for gateway replies meaning "the device is not (or no longer) connected".
    pub(crate) fn means_not_connected(&self) -> bool {
        self.is(names::NOT_CONNECTED) || self.is(names::UNKNOWN_OBJECT) || self.is(names::DOES_NOT_EXIST)
    }

    pub(crate) fn is_transient(&self) -> bool {
        const TRANSIENT_REASONS: &[&str] = &[
            "Software caused connection abort",
            "connection-timeout",
            "le-connection-abort-by-local",
            "Page Timeout",
            "Connection timed out",
            "Operation already in progress",
        ];

        self.is(names::NO_REPLY)
            || self.is(names::TIMEOUT)
            || self.is(names::IN_PROGRESS)
            || TRANSIENT_REASONS.iter().any(|reason| self.message.contains(reason))
    }

    /// Extracts an ATT error code from messages like `Operation failed with ATT error: 0x0e`.
    pub fn att_error(&self) -> Option<AttError> {
        let (_, code) = self.message.rsplit_once("ATT error: 0x")?;
        let code = code.get(..2)?;
        u8::from_str_radix(code, 16).ok().map(AttError::from)
    }
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for BusError {}

/// The family of gateway request an error came back from; errors are classified differently per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BusRequest {
    Adapter,
    Discovery,
    Connect,
    Disconnect,
    Characteristic,
}

fn classify(request: BusRequest, err: &BusError) -> ErrorKind {
    if err.is(names::ACCESS_DENIED) || err.is(names::NOT_PERMITTED) || err.is(names::NOT_AUTHORIZED) {
        return ErrorKind::PermissionDenied;
    }

    match request {
        BusRequest::Connect => ErrorKind::ConnectFailed,
        BusRequest::Adapter | BusRequest::Discovery => match err.name() {
            names::NOT_READY | names::UNKNOWN_OBJECT | names::SERVICE_UNKNOWN => ErrorKind::AdapterUnavailable,
            names::IN_PROGRESS => ErrorKind::Busy,
            names::NO_REPLY | names::TIMEOUT => ErrorKind::Timeout,
            names::INVALID_ARGUMENTS => ErrorKind::InvalidParameter,
            names::NOT_SUPPORTED => ErrorKind::NotSupported,
            _ => ErrorKind::OperationFailed,
        },
        BusRequest::Disconnect | BusRequest::Characteristic => match err.name() {
            names::NOT_CONNECTED | names::UNKNOWN_OBJECT | names::DOES_NOT_EXIST => ErrorKind::NotConnected,
            names::IN_PROGRESS => ErrorKind::Busy,
            names::NO_REPLY | names::TIMEOUT => ErrorKind::Timeout,
            names::INVALID_VALUE_LENGTH | names::INVALID_OFFSET | names::INVALID_ARGUMENTS => {
                ErrorKind::InvalidParameter
            }
            names::NOT_SUPPORTED => ErrorKind::NotSupported,
            _ => ErrorKind::OperationFailed,
        },
    }
}

/// Bluetooth Attribute Protocol error codes. See the Bluetooth Core Specification, Vol 3, Part F, §3.4.1.1
#[repr(u8)]
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
pub enum AttErrorCode {
    /// The attribute handle given was not valid on this server.
    InvalidHandle = 0x01,
    /// The attribute cannot be read.
    ReadNotPermitted = 0x02,
    /// The attribute cannot be written.
    WriteNotPermitted = 0x03,
    /// The attribute PDU was invalid.
    InvalidPdu = 0x04,
    /// The attribute requires authentication before it can be read or written.
    InsufficientAuthentication = 0x05,
    /// Attribute server does not support the request received from the client.
    RequestNotSupported = 0x06,
    /// Offset specified was past the end of the attribute.
    InvalidOffset = 0x07,
    /// The attribute requires authorization before it can be read or written.
    InsufficientAuthorization = 0x08,
    /// Too many prepare writes have been queued.
    PrepareQueueFull = 0x09,
    /// No attribute found within the given attribute handle range.
    AttributeNotFound = 0x0a,
    /// The attribute cannot be read or written using the Read Blob Request.
    AttributeNotLong = 0x0b,
    /// The Encryption Key Size used for encrypting this link is insufficient.
    InsufficientEncryptionKeySize = 0x0c,
    /// The attribute value length is invalid for the operation.
    InvalidAttributeValueLength = 0x0d,
    /// The attribute request has encountered an error that was unlikely.
    UnlikelyError = 0x0e,
    /// The attribute requires encryption before it can be read or written.
    InsufficientEncryption = 0x0f,
    /// The attribute type is not a supported grouping attribute.
    UnsupportedGroupType = 0x10,
    /// Insufficient Resources to complete the request.
    InsufficientResources = 0x11,
    /// The server requests the client to rediscover the database.
    DatabaseOutOfSync = 0x12,
    /// The attribute parameter value was not allowed.
    ValueNotAllowed = 0x13,
    /// Write Request Rejected
    WriteRequestRejected = 0xfc,
    /// Client Characteristic Configuration Descriptor Improperly Configured
    CccdImproperlyConfigured = 0xfd,
    /// Procedure Already in Progress
    ProcedureAlreadyInProgress = 0xfe,
    /// Out of Range
    OutOfRange = 0xff,
}

/// Bluetooth Attribute Protocol error. See the Bluetooth Core Specification, Vol 3, Part F, §3.4.1.1
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AttError {
    /// {0}
    Known(AttErrorCode),
    /// application specific error: {0}
    Application(u8),
    /// unknown error: {0}
    Reserved(u8),
}

impl From<u8> for AttError {
    fn from(number: u8) -> Self {
        match AttErrorCode::try_from(number) {
            Ok(code) => AttError::Known(code),
            Err(_) => {
                if (0x80..0xa0).contains(&number) {
                    AttError::Application(number)
                } else {
                    AttError::Reserved(number)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_wrap_the_gateway_reason() {
        let err = Error::from_bus(
            BusRequest::Connect,
            BusError::new(names::FAILED, "br-connection-timeout"),
        );
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);
        assert_eq!(err.bus_error().unwrap().message(), "br-connection-timeout");
        assert!(err.is_transient());
        assert!(err.to_string().contains("br-connection-timeout"));
    }

    #[test]
    fn permission_errors_win_over_request_family() {
        for request in [BusRequest::Discovery, BusRequest::Connect, BusRequest::Characteristic] {
            let err = Error::from_bus(request, BusError::new(names::ACCESS_DENIED, "Root permissions required"));
            assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        }
    }

    #[test]
    fn discovery_not_ready_means_adapter_unavailable() {
        let err = Error::from_bus(BusRequest::Discovery, BusError::new(names::NOT_READY, "Resource Not Ready"));
        assert_eq!(err.kind(), ErrorKind::AdapterUnavailable);
        assert!(!err.is_transient());
    }

    #[test]
    fn characteristic_errors() {
        let err = Error::from_bus(
            BusRequest::Characteristic,
            BusError::new(names::FAILED, "Operation failed with ATT error: 0x0e"),
        );
        assert_eq!(err.kind(), ErrorKind::OperationFailed);
        assert_eq!(err.att_error(), Some(AttError::Known(AttErrorCode::UnlikelyError)));

        let err = Error::from_bus(
            BusRequest::Characteristic,
            BusError::new(names::INVALID_VALUE_LENGTH, ""),
        );
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert_eq!(err.att_error(), None);
    }

    #[test]
    fn att_error_ranges() {
        assert_eq!(AttError::from(0x85), AttError::Application(0x85));
        assert_eq!(AttError::from(0x40), AttError::Reserved(0x40));
        assert_eq!(AttError::from(0x03), AttError::Known(AttErrorCode::WriteNotPermitted));
    }

    #[test]
    fn display_without_source() {
        let err = Error::with_message(ErrorKind::Timeout, "services were not resolved in time");
        assert_eq!(err.to_string(), "timed out: services were not resolved in time");
        assert_eq!(Error::from(ErrorKind::Busy).to_string(), "a conflicting operation is outstanding");
    }
}
