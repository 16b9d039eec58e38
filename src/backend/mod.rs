pub mod vhci;

use crate::config::EmulationConfig;
use crate::error::{Result, UsbEmuError};
use crate::request::ControlRequest;
use crate::types::{Direction, DeviceSpeed};

/// Names of the backends this crate ships, in registration order -- the
/// order [`resolve`] tries them when autodetecting.
pub const REGISTERED_BACKEND_NAMES: &[&str] = &["vhci"];

fn construct(name: &str) -> Option<Box<dyn Backend>> {
    match name {
        "vhci" => Some(Box::new(vhci::VhciBackend::new())),
        _ => None,
    }
}

/// Resolves a concrete backend from an [`EmulationConfig`]: an explicit
/// `backend` name is looked up directly and fails with
/// [`UsbEmuError::BackendUnavailable`] if unrecognized; `None` autodetects
/// across [`REGISTERED_BACKEND_NAMES`] in registration order, failing the
/// same way if none construct.
pub fn resolve(config: &EmulationConfig) -> Result<Box<dyn Backend>> {
    match &config.backend {
        Some(name) => construct(name).ok_or_else(|| {
            UsbEmuError::BackendUnavailable(format!("no registered backend named {name:?}"))
        }),
        None => REGISTERED_BACKEND_NAMES
            .iter()
            .find_map(|name| construct(name))
            .ok_or_else(|| {
                UsbEmuError::BackendUnavailable(
                    "no registered backend was selected by BACKEND or autodetection".into(),
                )
            }),
    }
}

/// Event produced by a backend and consumed by the device's event loop.
///
/// The backend never calls back into [`crate::device::Device`] directly:
/// it only ever hands control requests and bulk/interrupt data upward as
/// events, and receives instructions (ack/stall/send) as plain method
/// calls. This keeps the device <-> backend relationship a one-way
/// borrow in each direction instead of a reference cycle.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A SETUP packet arrived on the control endpoint.
    ControlRequest(ControlRequest),
    /// Data arrived on an OUT endpoint.
    DataOut { endpoint: u8, data: Vec<u8> },
    /// The host issued an IN token on a non-control endpoint and is
    /// waiting for data.
    DataInRequested { endpoint: u8, length: usize },
    /// The host reset the bus.
    BusReset,
}

/// The contract a concrete USB controller driver must satisfy, modeled on
/// the Facedancer backend base class: connect/disconnect bracket the
/// session, `poll` is the non-blocking core of the event loop, and the
/// remaining methods let the device answer requests the backend surfaced
/// to it via [`BackendEvent`].
pub trait Backend {
    /// Brings the backend up and presents the device to the target host
    /// at the given speed. Must be called before `poll`.
    fn connect(&mut self, speed: DeviceSpeed, max_packet_size_ep0: u8) -> Result<()>;

    /// Tears the connection down. Idempotent.
    fn disconnect(&mut self);

    /// Returns the next available event without blocking, or `None` if
    /// nothing is pending right now.
    fn poll(&mut self) -> Result<Option<BackendEvent>>;

    /// Completes the status stage of a control transfer.
    fn ack_status_stage(&mut self, direction: Direction) -> Result<()>;

    /// Stalls the given endpoint (NAKs persistently until cleared).
    fn stall_endpoint(&mut self, endpoint: u8) -> Result<()>;

    /// Clears a halt condition previously placed on the given endpoint.
    fn clear_halt(&mut self, endpoint: u8) -> Result<()>;

    /// Queues `data` to be sent the next time the host issues an IN token
    /// on `endpoint`. For control transfers, `data` must already be
    /// truncated to the request's `wLength`.
    fn send_on_endpoint(&mut self, endpoint: u8, data: &[u8]) -> Result<()>;
}
