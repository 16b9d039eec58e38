use std::fmt;

/// Errors that can arise while configuring, connecting, or running an
/// emulated device.
///
/// `ConfigurationError` and `BackendUnavailable` are fatal at connect time.
/// `UpstreamError` only occurs in proxy mode and is ordinarily absorbed by a
/// filter before it reaches the caller. `ProtocolError` is recoverable: the
/// offending request is stalled and logged, emulation continues.
#[derive(Debug)]
pub enum UsbEmuError {
    ConfigurationError(String),
    BackendUnavailable(String),
    UpstreamError(String),
    ProtocolError(String),
}

impl fmt::Display for UsbEmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbEmuError::ConfigurationError(msg) => write!(f, "configuration error: {msg}"),
            UsbEmuError::BackendUnavailable(msg) => write!(f, "backend unavailable: {msg}"),
            UsbEmuError::UpstreamError(msg) => write!(f, "upstream error: {msg}"),
            UsbEmuError::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for UsbEmuError {}

pub type Result<T> = std::result::Result<T, UsbEmuError>;

/// Signal used to unwind out of the event loop when emulation should stop.
/// Not a real error; carried separately from [`UsbEmuError`] so `emulate`
/// can distinguish "the device asked to disconnect" from an actual failure.
#[derive(Debug, Default)]
pub struct EndEmulation;

impl fmt::Display for EndEmulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "emulation ended")
    }
}

impl std::error::Error for EndEmulation {}

/// Outcome of running a device to completion.
#[derive(Debug)]
pub enum RunOutcome {
    Ended,
    Failed(UsbEmuError),
}
