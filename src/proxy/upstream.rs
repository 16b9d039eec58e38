//! The proxy's connection to the real device being impersonated. Grounded
//! on a libusb-backed host device handle; `rusb` is used instead of raw
//! `libusb1-sys` calls because every operation the proxy needs --
//! control/bulk transfers, interface claim/release, clear_halt, reset --
//! is already exposed safely by `rusb::DeviceHandle`.

use std::time::Duration;

use crate::error::{Result, UsbEmuError};
use crate::request::ControlRequest;
use crate::types::{Direction, Recipient, RequestKind};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Contract for whatever the proxy forwards unhandled traffic to. Kept
/// separate from a concrete `rusb` dependency so the proxy's dispatch
/// logic can be exercised with a fake in tests.
pub trait UpstreamDevice {
    fn control_transfer_in(&mut self, req: &ControlRequest) -> Result<Vec<u8>>;
    fn control_transfer_out(&mut self, req: &ControlRequest, data: &[u8]) -> Result<()>;
    fn set_configuration(&mut self, value: u8) -> Result<()>;
    fn set_interface_alt(&mut self, number: u8, alt: u8) -> Result<()>;
    fn read_bulk(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>>;
    fn write_bulk(&mut self, endpoint: u8, data: &[u8]) -> Result<usize>;
    fn clear_halt(&mut self, endpoint: u8) -> Result<()>;
    fn reset(&mut self) -> Result<()>;
}

fn rusb_request_type(req: &ControlRequest) -> u8 {
    let direction = match req.direction {
        Direction::In => rusb::Direction::In,
        Direction::Out => rusb::Direction::Out,
    };
    let kind = match req.kind {
        RequestKind::Standard => rusb::RequestType::Standard,
        RequestKind::Class => rusb::RequestType::Class,
        RequestKind::Vendor => rusb::RequestType::Vendor,
    };
    let recipient = match req.recipient {
        Recipient::Device => rusb::Recipient::Device,
        Recipient::Interface => rusb::Recipient::Interface,
        Recipient::Endpoint => rusb::Recipient::Endpoint,
        Recipient::Other => rusb::Recipient::Other,
    };
    rusb::request_type(direction, kind, recipient)
}

/// Upstream driver backed by a real device reached through libusb.
pub struct RusbUpstream {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    claimed_interfaces: Vec<u8>,
}

impl RusbUpstream {
    /// Opens the first device matching `vendor_id`/`product_id`.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self> {
        let handle = rusb::open_device_with_vid_pid(vendor_id, product_id).ok_or_else(|| {
            UsbEmuError::UpstreamError(format!(
                "no device found for {vendor_id:04x}:{product_id:04x}"
            ))
        })?;
        Ok(Self {
            handle,
            claimed_interfaces: Vec::new(),
        })
    }

    fn claim_interface(&mut self, number: u8) -> Result<()> {
        if self.claimed_interfaces.contains(&number) {
            return Ok(());
        }
        self.handle
            .claim_interface(number)
            .map_err(|e| UsbEmuError::UpstreamError(format!("claim_interface: {e}")))?;
        self.claimed_interfaces.push(number);
        Ok(())
    }
}

impl UpstreamDevice for RusbUpstream {
    fn control_transfer_in(&mut self, req: &ControlRequest) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; req.length as usize];
        let n = self
            .handle
            .read_control(
                rusb_request_type(req),
                req.request,
                req.value,
                req.index,
                &mut buf,
                DEFAULT_TIMEOUT,
            )
            .map_err(|e| UsbEmuError::UpstreamError(format!("control in: {e}")))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn control_transfer_out(&mut self, req: &ControlRequest, data: &[u8]) -> Result<()> {
        self.handle
            .write_control(
                rusb_request_type(req),
                req.request,
                req.value,
                req.index,
                data,
                DEFAULT_TIMEOUT,
            )
            .map_err(|e| UsbEmuError::UpstreamError(format!("control out: {e}")))?;
        Ok(())
    }

    fn set_configuration(&mut self, value: u8) -> Result<()> {
        self.handle
            .set_active_configuration(value)
            .map_err(|e| UsbEmuError::UpstreamError(format!("set_configuration: {e}")))
    }

    fn set_interface_alt(&mut self, number: u8, alt: u8) -> Result<()> {
        self.claim_interface(number)?;
        self.handle
            .set_alternate_setting(number, alt)
            .map_err(|e| UsbEmuError::UpstreamError(format!("set_interface_alt: {e}")))
    }

    fn read_bulk(&mut self, endpoint: u8, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let n = self
            .handle
            .read_bulk(endpoint, &mut buf, DEFAULT_TIMEOUT)
            .map_err(|e| UsbEmuError::UpstreamError(format!("read_bulk: {e}")))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8]) -> Result<usize> {
        self.handle
            .write_bulk(endpoint, data, DEFAULT_TIMEOUT)
            .map_err(|e| UsbEmuError::UpstreamError(format!("write_bulk: {e}")))
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<()> {
        self.handle
            .clear_halt(endpoint)
            .map_err(|e| UsbEmuError::UpstreamError(format!("clear_halt: {e}")))
    }

    fn reset(&mut self) -> Result<()> {
        self.handle
            .reset()
            .map_err(|e| UsbEmuError::UpstreamError(format!("reset: {e}")))
    }
}
