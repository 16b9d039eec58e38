//! Software emulation of a USB device, presented to the Linux USB/IP
//! vhci-hcd driver as if it were a real device plugged into the host.
//!
//! [`Device`] declares descriptors, configurations, and control-request
//! handlers through [`DeviceBuilder`], then drives itself against a
//! [`backend::Backend`] (the stock one, [`backend::vhci::VhciBackend`],
//! talks to the kernel over a vhci-hcd socketpair). [`proxy::ProxyDevice`]
//! runs the same kind of session in pass-through mode against a real
//! device reached over `rusb`, with a [`filters::FilterChain`] in between.

pub mod backend;
pub mod config;
pub mod configuration;
pub mod descriptor;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod filters;
pub mod interface;
pub mod proxy;
pub mod request;
pub mod types;

pub use backend::{Backend, BackendEvent};
pub use config::EmulationConfig;
pub use configuration::Configuration;
pub use descriptor::{DeviceDescriptor, DeviceQualifierDescriptor};
pub use device::{Device, DeviceBuilder};
pub use endpoint::Endpoint;
pub use error::{EndEmulation, Result, RunOutcome, UsbEmuError};
pub use executor::{block_on_device, emulate, Executor};
pub use filters::{Filter, FilterChain};
pub use interface::Interface;
pub use proxy::ProxyDevice;
pub use request::{ControlRequest, Handler, HandlerOutcome, Predicate};
pub use types::{DescriptorType, Direction, DeviceSpeed, Recipient, RequestKind, StandardRequest};
