use crate::error::{names, BusError};

/// Maps a `bluer` error back onto the management service's error name, so that the same classification applies as
/// for any other gateway.
pub(super) fn bus_error(err: bluer::Error) -> BusError {
    let name = match err.kind {
        bluer::ErrorKind::AlreadyConnected => names::ALREADY_CONNECTED,
        bluer::ErrorKind::DoesNotExist => names::DOES_NOT_EXIST,
        bluer::ErrorKind::InProgress => names::IN_PROGRESS,
        bluer::ErrorKind::InvalidArguments => names::INVALID_ARGUMENTS,
        bluer::ErrorKind::InvalidLength => names::INVALID_VALUE_LENGTH,
        bluer::ErrorKind::InvalidOffset => names::INVALID_OFFSET,
        bluer::ErrorKind::NotAuthorized => names::NOT_AUTHORIZED,
        bluer::ErrorKind::NotPermitted => names::NOT_PERMITTED,
        bluer::ErrorKind::NotReady => names::NOT_READY,
        bluer::ErrorKind::NotSupported => names::NOT_SUPPORTED,
        bluer::ErrorKind::NotFound => names::UNKNOWN_OBJECT,
        bluer::ErrorKind::InvalidAddress(_) | bluer::ErrorKind::InvalidName(_) => names::INVALID_ARGUMENTS,
        _ => names::FAILED,
    };
    BusError::new(name, err.message)
}

pub(super) fn unknown_object(path: &crate::ObjectPath) -> BusError {
    BusError::new(names::UNKNOWN_OBJECT, format!("no such object {path}"))
}
