//! Man-in-the-middle session that stands between a real USB device and the
//! target host, forwarding traffic through a [`FilterChain`] instead of
//! answering requests itself. Grounded on Facedancer's `USBProxyDevice`,
//! which re-hosts every SETUP packet and data transfer the application
//! backend reports to whatever device it was constructed against.

pub mod upstream;

use crate::backend::{Backend, BackendEvent};
use crate::error::{EndEmulation, Result};
use crate::filters::FilterChain;
use crate::request::ControlRequest;
use crate::types::{Direction, DeviceSpeed};
use upstream::UpstreamDevice;

/// Ties a target-host-facing [`Backend`] to an upstream device, running
/// every transfer through a [`FilterChain`] in between.
pub struct ProxyDevice {
    backend: Box<dyn Backend>,
    upstream: Box<dyn UpstreamDevice>,
    filters: FilterChain,
    speed: DeviceSpeed,
    max_packet_size_ep0: u8,
}

impl ProxyDevice {
    pub fn new(
        backend: Box<dyn Backend>,
        upstream: Box<dyn UpstreamDevice>,
        filters: FilterChain,
        speed: DeviceSpeed,
        max_packet_size_ep0: u8,
    ) -> Self {
        Self {
            backend,
            upstream,
            filters,
            speed,
            max_packet_size_ep0,
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        self.backend.connect(self.speed, self.max_packet_size_ep0)
    }

    pub fn disconnect(&mut self) {
        self.backend.disconnect();
    }

    /// Runs the proxy loop to completion, polling the backend for events
    /// and relaying each one upstream through the filter chain until the
    /// connection drops.
    pub fn run(&mut self) -> Result<()> {
        self.connect()?;
        loop {
            match self.poll_once() {
                Ok(_) => {}
                Err(EndEmulation) => break,
            }
        }
        self.disconnect();
        Ok(())
    }

    /// Services at most one backend event, returning `Ok(true)` if one was
    /// handled and `Ok(false)` if the backend had nothing pending.
    pub fn poll_once(&mut self) -> std::result::Result<bool, EndEmulation> {
        let event = match self.backend.poll() {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(false),
            Err(_) => return Err(EndEmulation),
        };
        match event {
            BackendEvent::ControlRequest(req) => self.handle_control_request(req),
            BackendEvent::DataOut { endpoint, data } => self.handle_data_out(endpoint, data),
            BackendEvent::DataInRequested { endpoint, length } => {
                self.handle_data_in_requested(endpoint, length)
            }
            BackendEvent::BusReset => {
                let _ = self.upstream.reset();
            }
        }
        Ok(true)
    }

    fn handle_control_request(&mut self, req: ControlRequest) {
        match req.direction {
            Direction::In => self.handle_control_in(req),
            Direction::Out => self.handle_control_out(req),
        }
    }

    fn handle_control_in(&mut self, req: ControlRequest) {
        let (filtered, mut stalled) = self.filters.control_in_setup(req.clone());
        let Some(filtered) = filtered else {
            let _ = self.backend.stall_endpoint(0);
            return;
        };
        if stalled {
            let _ = self.backend.stall_endpoint(0);
            return;
        }

        self.track_set_configuration(&filtered);

        let mut data = match self.upstream.control_transfer_in(&filtered) {
            Ok(data) => data,
            Err(_) => {
                stalled = true;
                Vec::new()
            }
        };
        let (_, filtered_data, stalled) = self.filters.control_in(filtered, data, stalled);
        data = filtered_data;

        if stalled {
            let _ = self.backend.stall_endpoint(0);
            return;
        }
        if self.backend.send_on_endpoint(0, &data).is_ok() {
            let _ = self.backend.ack_status_stage(Direction::In);
        }
    }

    fn handle_control_out(&mut self, req: ControlRequest) {
        let data = req.data.clone();
        let (filtered_req, filtered_data) = self.filters.control_out(Some(req), data);
        let Some(filtered_req) = filtered_req else {
            return;
        };

        self.track_set_configuration(&filtered_req);

        let result = self
            .upstream
            .control_transfer_out(&filtered_req, filtered_data.as_deref().unwrap_or(&[]));
        let stalled = result.is_err();
        let (_, _, stalled) =
            self.filters
                .control_out_stall_hook(filtered_req, filtered_data, stalled);

        if stalled {
            let _ = self.backend.stall_endpoint(0);
        } else {
            let _ = self.backend.ack_status_stage(Direction::Out);
        }
    }

    fn handle_data_out(&mut self, endpoint: u8, data: Vec<u8>) {
        let (endpoint, filtered) = self.filters.out_data(endpoint, Some(data));
        let Some(filtered) = filtered else {
            return;
        };
        let result = self.upstream.write_bulk(endpoint, &filtered);
        if result.is_err() {
            let _ = self.upstream.clear_halt(endpoint);
        }
    }

    /// A failed or timed-out upstream read is not the same as a filter
    /// choosing to absorb the data: the former means there's nothing to
    /// relay this cycle (the target host will just see the IN token go
    /// unanswered and retry), so it returns without touching the backend
    /// at all rather than stalling. Only a filter deliberately dropping a
    /// successfully-read buffer results in a stall.
    fn handle_data_in_requested(&mut self, endpoint: u8, length: usize) {
        let Some(endpoint) = self.filters.in_token(Some(endpoint)) else {
            return;
        };
        let data = match self.upstream.read_bulk(endpoint, length) {
            Ok(data) => data,
            Err(e) => {
                log::debug!("upstream read on endpoint {endpoint:#04x} failed: {e}");
                return;
            }
        };
        let (endpoint, filtered) = self.filters.in_data(endpoint, Some(data));
        match filtered {
            Some(bytes) => {
                let _ = self.backend.send_on_endpoint(endpoint, &bytes);
            }
            None => {
                let _ = self.backend.stall_endpoint(endpoint);
            }
        }
    }

    /// Mirrors a SET_CONFIGURATION / SET_INTERFACE request seen on the
    /// target-host side onto the upstream device so its active
    /// configuration and alternate settings stay in lockstep with what the
    /// target host believes is selected.
    fn track_set_configuration(&mut self, req: &ControlRequest) {
        use crate::types::{Recipient, RequestKind, StandardRequest};
        if req.kind != RequestKind::Standard {
            return;
        }
        match (req.recipient, req.standard_request()) {
            (Recipient::Device, Some(StandardRequest::SetConfiguration)) => {
                let _ = self.upstream.set_configuration(req.value as u8);
            }
            (Recipient::Interface, Some(StandardRequest::SetInterface)) => {
                let _ = self
                    .upstream
                    .set_interface_alt(req.index as u8, req.value as u8);
            }
            _ => {}
        }
    }
}
