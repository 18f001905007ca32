//! The crate-wide error type and its retryability classification.

use std::io;
use std::time::Duration;

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type used throughout this library.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The service name failed validation (see [`ServerConfig`]).
    ///
    /// [`ServerConfig`]: crate::server::ServerConfig
    #[error("invalid service name: {0}")]
    InvalidServiceName(String),

    /// A UUID string was not a 16-, 32- or 128-bit UUID.
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    /// A path segment contained characters outside `[A-Za-z0-9_]`.
    #[error("invalid object path segment: {0}")]
    InvalidPath(String),

    /// Two tree nodes would end up at the same object path.
    #[error("duplicate object path: {0}")]
    DuplicatePath(String),

    /// An argument was malformed (unknown flag, out-of-range timeout, …).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The system bus could not be reached.
    #[error("system bus unavailable: {0}")]
    BusUnavailable(String),

    /// The well-known bus name could not be acquired, or was lost.
    #[error("bus name lost: {0}")]
    NameLost(String),

    /// BlueZ is present but not ready to serve the request.
    #[error("BlueZ not ready: {0}")]
    NotReady(String),

    /// An adapter, device, interface or property was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The bus or BlueZ denied the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The operation is not supported by this BlueZ version or adapter.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The object or registration already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A bounded wait elapsed before the operation completed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// BlueZ reported the operation as still in progress.
    #[error("operation in progress: {0}")]
    InProgress(String),

    /// A generic failure reported by BlueZ or the bus.
    #[error("operation failed: {0}")]
    Failed(String),

    /// An underlying zbus error that maps onto none of the above.
    #[error(transparent)]
    Zbus(#[from] zbus::Error),

    /// An underlying I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps a zbus error onto the crate taxonomy.
    ///
    /// BlueZ surfaces its errors as named D-Bus errors (`org.bluez.Error.*`);
    /// these are matched by substring on the error name. Standard
    /// `org.freedesktop.DBus.Error.*` replies go through the typed
    /// [`zbus::fdo::Error`] variants.
    pub(crate) fn from_dbus(e: zbus::Error) -> Self {
        match e {
            zbus::Error::MethodError(ref name, ref detail, _) => {
                let text = detail.clone().unwrap_or_else(|| name.to_string());
                classify_error_name(name.as_str(), text)
            }
            zbus::Error::FDO(fdo) => Self::from_fdo(*fdo),
            zbus::Error::InputOutput(io) => {
                Error::Io(io::Error::new(io.kind(), io.to_string()))
            }
            other => Error::Zbus(other),
        }
    }

    pub(crate) fn from_fdo(e: zbus::fdo::Error) -> Self {
        use zbus::fdo::Error as Fdo;
        match e {
            Fdo::AccessDenied(m) | Fdo::AuthFailed(m) => Error::PermissionDenied(m),
            Fdo::NotSupported(m) => Error::NotSupported(m),
            Fdo::ServiceUnknown(m) | Fdo::NameHasNoOwner(m) => Error::NotReady(m),
            Fdo::Timeout(m) | Fdo::TimedOut(m) | Fdo::NoReply(m) => Error::Failed(m),
            Fdo::Disconnected(m) => Error::BusUnavailable(m),
            Fdo::FileExists(m) | Fdo::ObjectPathInUse(m) => Error::AlreadyExists(m),
            Fdo::UnknownObject(m)
            | Fdo::UnknownInterface(m)
            | Fdo::UnknownProperty(m)
            | Fdo::UnknownMethod(m)
            | Fdo::FileNotFound(m) => Error::NotFound(m),
            Fdo::InvalidArgs(m) => Error::InvalidArgument(m),
            Fdo::Failed(m) => Error::Failed(m),
            Fdo::ZBus(e) => Self::from_dbus(e),
            other => Error::Zbus(zbus::Error::FDO(Box::new(other))),
        }
    }

    /// Returns whether a failed operation may be re-attempted with backoff.
    ///
    /// The set follows the BlueZ/D-Bus failure modes that are transient in
    /// practice: daemon restarts, in-flight state changes and socket-level
    /// congestion. Permission and argument errors are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::NotReady(_)
            | Error::Timeout(_)
            | Error::InProgress(_)
            | Error::Failed(_)
            | Error::BusUnavailable(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::NotConnected
            ),
            Error::Zbus(zbus::Error::InputOutput(_)) => true,
            _ => false,
        }
    }
}

/// Maps a raw D-Bus error name onto the taxonomy by substring.
fn classify_error_name(name: &str, text: String) -> Error {
    if name.contains("NotReady") {
        Error::NotReady(text)
    } else if name.contains("InProgress") {
        Error::InProgress(text)
    } else if name.contains("Timeout") || name.contains("TimedOut") {
        Error::Failed(text)
    } else if name.contains("NotPermitted") || name.contains("NotAuthorized") {
        Error::PermissionDenied(text)
    } else if name.contains("NotSupported") {
        Error::NotSupported(text)
    } else if name.contains("AlreadyExists") {
        Error::AlreadyExists(text)
    } else if name.contains("DoesNotExist") || name.contains("NotFound") {
        Error::NotFound(text)
    } else if name.contains("InvalidArg") {
        Error::InvalidArgument(text)
    } else if name.contains("Failed") {
        Error::Failed(text)
    } else {
        Error::Failed(format!("{name}: {text}"))
    }
}

/// An error produced by an application-supplied read/write handler.
///
/// Handler errors are returned to the remote GATT client as named D-Bus
/// errors; they never propagate into the server state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    name: String,
    message: String,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// `org.bluez.Error.Failed`
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new("org.bluez.Error.Failed", message)
    }

    /// `org.bluez.Error.NotPermitted`
    pub fn not_permitted(message: impl Into<String>) -> Self {
        Self::new("org.bluez.Error.NotPermitted", message)
    }

    /// `org.bluez.Error.NotSupported`
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new("org.bluez.Error.NotSupported", message)
    }

    /// `org.bluez.Error.InvalidValueLength`
    pub fn invalid_value_length(message: impl Into<String>) -> Self {
        Self::new("org.bluez.Error.InvalidValueLength", message)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for HandlerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bluez_error_names_classify_by_substring() {
        let e = classify_error_name("org.bluez.Error.NotReady", "powering".into());
        assert!(matches!(e, Error::NotReady(_)));
        assert!(e.is_retryable());

        let e = classify_error_name("org.bluez.Error.InProgress", "busy".into());
        assert!(matches!(e, Error::InProgress(_)));
        assert!(e.is_retryable());

        let e = classify_error_name("org.bluez.Error.Failed", "nope".into());
        assert!(matches!(e, Error::Failed(_)));
        assert!(e.is_retryable());

        let e = classify_error_name("org.bluez.Error.NotSupported", "no".into());
        assert!(matches!(e, Error::NotSupported(_)));
        assert!(!e.is_retryable());

        let e = classify_error_name("org.bluez.Error.AlreadyExists", "dup".into());
        assert!(matches!(e, Error::AlreadyExists(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!Error::PermissionDenied("x".into()).is_retryable());
        assert!(!Error::InvalidArgument("x".into()).is_retryable());
        assert!(!Error::DuplicatePath("/a".into()).is_retryable());
        assert!(!Error::NotFound("hci9".into()).is_retryable());
    }

    #[test]
    fn transient_io_errors_are_retryable() {
        let e = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "t"));
        assert!(e.is_retryable());
        let e = Error::Io(io::Error::new(io::ErrorKind::PermissionDenied, "p"));
        assert!(!e.is_retryable());
    }
}
