use std::collections::BTreeMap;

use packed_struct::types::SizedInteger;
use packed_struct::PackedStruct;

use crate::backend::{Backend, BackendEvent};
use crate::config::EmulationConfig;
use crate::configuration::Configuration;
use crate::descriptor::{
    encode_langid_descriptor, DeviceDescriptor, DeviceQualifierDescriptor, StringTable,
};
use crate::endpoint::Endpoint;
use crate::error::{EndEmulation, Result, UsbEmuError};
use crate::request::{combine_outcomes, dispatch, ControlRequest, Handler, HandlerOutcome, Predicate};
use crate::types::{Direction, DeviceSpeed, Recipient, RequestKind, StandardRequest};

const FEATURE_ENDPOINT_HALT: u16 = 0;
const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

/// A declared USB device: its descriptors, configurations, and the
/// handlers that answer control requests. Owns the backend that presents
/// it to a real or virtual host, and the string table every descriptor
/// draws its indices from.
pub struct Device {
    pub device_descriptor: DeviceDescriptor,
    pub qualifier: DeviceQualifierDescriptor,
    pub configurations: Vec<Configuration>,
    pub strings: StringTable,
    pub lang_ids: Vec<u16>,
    pub speed: DeviceSpeed,
    max_packet_size_ep0: u8,

    address: u8,
    pending_address: Option<u8>,
    active_configuration: Option<u8>,
    active_alt_settings: BTreeMap<u8, u8>,

    handlers: Vec<Handler<Device>>,
    data_out_handlers: Vec<(u8, Box<dyn FnMut(&mut Device, &[u8])>)>,
    data_in_handlers: Vec<(u8, Box<dyn FnMut(&mut Device, usize) -> Vec<u8>>)>,
    backend: Box<dyn Backend>,
}

impl Device {
    pub fn builder(vendor_id: u16, product_id: u16) -> DeviceBuilder {
        DeviceBuilder::new(vendor_id, product_id)
    }

    pub fn active_configuration_value(&self) -> Option<u8> {
        self.active_configuration
    }

    pub fn active_configuration(&self) -> Option<&Configuration> {
        let value = self.active_configuration?;
        self.configurations.iter().find(|c| c.value == value)
    }

    pub fn active_alternate_setting(&self, interface_number: u8) -> u8 {
        self.active_alt_settings
            .get(&interface_number)
            .copied()
            .unwrap_or(0)
    }

    /// Brings the backend up and presents the device to the host. Must be
    /// called before [`Device::run`]. Validates the composed descriptor
    /// tree first and fails with [`UsbEmuError::ConfigurationError`]
    /// without touching the backend if a composition mistake is found.
    pub fn connect(&mut self, config: &EmulationConfig) -> Result<()> {
        log::set_max_level(config.log_level());
        self.validate()?;
        self.backend.connect(self.speed, self.max_packet_size_ep0)
    }

    /// Checks the invariants a composed device must hold before it can be
    /// presented to a host: every registered string fits in its length
    /// byte, no two endpoints in the same interface alternate setting share
    /// an address, no two interface alternate settings in the same
    /// configuration share a (number, alternate) pair, and no endpoint
    /// advertises a zero max packet size.
    fn validate(&self) -> Result<()> {
        self.strings.validate()?;

        for config in &self.configurations {
            let mut seen_alts: Vec<(u8, u8)> = Vec::new();
            for interface in &config.interfaces {
                let key = (interface.number, interface.alternate_setting);
                if seen_alts.contains(&key) {
                    return Err(UsbEmuError::ConfigurationError(format!(
                        "configuration {} has duplicate interface (number={}, alternate={})",
                        config.value, interface.number, interface.alternate_setting
                    )));
                }
                seen_alts.push(key);

                let mut seen_endpoints: Vec<u8> = Vec::new();
                for endpoint in &interface.endpoints {
                    let identifier = endpoint.identifier();
                    if seen_endpoints.contains(&identifier) {
                        return Err(UsbEmuError::ConfigurationError(format!(
                            "interface {} alternate {} has duplicate endpoint address {identifier:#04x}",
                            interface.number, interface.alternate_setting
                        )));
                    }
                    seen_endpoints.push(identifier);

                    if endpoint.max_packet_size == 0 {
                        return Err(UsbEmuError::ConfigurationError(format!(
                            "endpoint {identifier:#04x} on interface {} alternate {} has a zero max packet size",
                            interface.number, interface.alternate_setting
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.backend.disconnect();
        self.address = 0;
        self.active_configuration = None;
        self.active_alt_settings.clear();
    }

    /// Services one pending backend event, if any. Returns `Ok(true)` if
    /// an event was processed. Used by [`crate::executor`] to cooperate
    /// with other tasks (such as a proxy filter chain) in the same
    /// process.
    pub fn poll_once(&mut self) -> std::result::Result<bool, EndEmulation> {
        let event = match self.backend.poll() {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(false),
            Err(e) => {
                log::error!("backend error: {e}");
                return Ok(false);
            }
        };

        match event {
            BackendEvent::ControlRequest(req) => self.handle_control_request(&req),
            BackendEvent::DataOut { endpoint, data } => self.handle_data_out(endpoint, &data),
            BackendEvent::DataInRequested { endpoint, length } => {
                self.handle_data_in_requested(endpoint, length)
            }
            BackendEvent::BusReset => {
                self.address = 0;
                self.active_configuration = None;
                self.active_alt_settings.clear();
            }
        }

        Ok(true)
    }

    /// Runs the device's event loop until emulation ends or the backend
    /// fails.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.poll_once() {
                Ok(_) => {}
                Err(EndEmulation) => return Ok(()),
            }
        }
    }

    fn handle_control_request(&mut self, req: &ControlRequest) {
        let outcome = self.dispatch_recursive(req);
        match outcome {
            HandlerOutcome::NotApplicable => {
                log::warn!("stalling unhandled control request: {req:?}");
                let _ = self.backend.stall_endpoint(0);
            }
            HandlerOutcome::Stall => {
                let _ = self.backend.stall_endpoint(0);
            }
            HandlerOutcome::Ack => {
                if let Err(e) = self.backend.ack_status_stage(req.direction) {
                    log::error!("failed to ack status stage: {e}");
                }
                self.apply_pending_address();
            }
            HandlerOutcome::AckWithData(data) => {
                let data = truncate_for_control_response(data, req);
                if let Err(e) = self.backend.send_on_endpoint(0, &data) {
                    log::error!("failed to send control response: {e}");
                }
            }
        }
    }

    /// Runs the device's own handlers, then recurses into the active
    /// configuration, then each of its active interface alternate
    /// settings, then each of those interfaces' endpoints, folding every
    /// handler list's outcome into one with [`combine_outcomes`]. Each
    /// handler list is taken out of its owner with `std::mem::take` before
    /// running, since every callback needs `&mut Device` and the owner
    /// (`self`, or an entry reached through `self.configurations`) would
    /// otherwise be aliased by the borrow that holds the handler list.
    fn dispatch_recursive(&mut self, req: &ControlRequest) -> HandlerOutcome {
        let handlers = std::mem::take(&mut self.handlers);
        let mut outcome = dispatch(&handlers, self, req);
        self.handlers = handlers;

        let Some(value) = self.active_configuration else {
            return outcome;
        };
        let active_alts = self.active_alt_settings.clone();
        let mut configurations = std::mem::take(&mut self.configurations);

        if let Some(config) = configurations.iter_mut().find(|c| c.value == value) {
            let config_handlers = std::mem::take(&mut config.handlers);
            outcome = combine_outcomes(outcome, dispatch(&config_handlers, self, req));
            config.handlers = config_handlers;

            for interface in config.interfaces.iter_mut() {
                let active_alt = active_alts.get(&interface.number).copied().unwrap_or(0);
                if interface.alternate_setting != active_alt {
                    continue;
                }

                let interface_handlers = std::mem::take(&mut interface.handlers);
                outcome = combine_outcomes(outcome, dispatch(&interface_handlers, self, req));
                interface.handlers = interface_handlers;

                for endpoint in interface.endpoints.iter_mut() {
                    let endpoint_handlers = std::mem::take(&mut endpoint.handlers);
                    outcome = combine_outcomes(outcome, dispatch(&endpoint_handlers, self, req));
                    endpoint.handlers = endpoint_handlers;
                }
            }
        }

        self.configurations = configurations;
        outcome
    }

    fn apply_pending_address(&mut self) {
        if let Some(address) = self.pending_address.take() {
            self.address = address;
        }
    }

    /// Hands `data` to every registered OUT handler for `endpoint`, the
    /// same observer dispatch control requests get, just keyed on
    /// endpoint identifier rather than a [`Predicate`].
    fn handle_data_out(&mut self, endpoint: u8, data: &[u8]) {
        log::debug!("received {} bytes on endpoint {endpoint:#04x}", data.len());
        let mut handlers = std::mem::take(&mut self.data_out_handlers);
        for (identifier, callback) in handlers.iter_mut() {
            if *identifier == endpoint {
                callback(self, data);
            }
        }
        self.data_out_handlers = handlers;
    }

    /// Asks every registered IN handler for `endpoint` to produce up to
    /// `length` bytes and sends the last non-empty answer through
    /// [`Device::send`] so it's split into max-packet-size chunks (and
    /// ZLP'd if needed) rather than handed to the backend as one blob;
    /// with no handler registered, sends an empty response (a single ZLP).
    fn handle_data_in_requested(&mut self, endpoint: u8, length: usize) {
        log::debug!("host requested up to {length} bytes from endpoint {endpoint:#04x}");
        let mut handlers = std::mem::take(&mut self.data_in_handlers);
        let mut response = Vec::new();
        for (identifier, callback) in handlers.iter_mut() {
            if *identifier == endpoint {
                response = callback(self, length);
            }
        }
        self.data_in_handlers = handlers;
        if let Err(e) = self.send(endpoint, &response) {
            log::error!("failed to send IN data on endpoint {endpoint:#04x}: {e}");
        }
    }

    /// Splits `data` into this endpoint's max-packet-size chunks (per USB
    /// 2.0 §5.8.3, appending a trailing zero-length packet when `data` is a
    /// non-zero multiple of the max packet size) and hands each chunk to
    /// the backend in turn.
    pub fn send(&mut self, endpoint: u8, data: &[u8]) -> Result<()> {
        let max_packet_size = self
            .find_endpoint(endpoint)
            .map(|e| e.max_packet_size)
            .ok_or_else(|| {
                UsbEmuError::ProtocolError(format!(
                    "no active endpoint {endpoint:#04x} to send on"
                ))
            })?;

        // `requested_length = data.len() + 1` always treats an exact
        // multiple of the max packet size as "the target may still be
        // expecting more", since `send` has no visibility into how much
        // the host actually asked for -- only the backend event that
        // triggered this call knows that, and by the time `send` runs the
        // response is already final.
        let chunks = crate::endpoint::chunks_for_in_transfer(data, max_packet_size, data.len() + 1);
        for chunk in chunks {
            self.backend.send_on_endpoint(endpoint, chunk)?;
        }
        Ok(())
    }

    fn find_endpoint(&self, identifier: u8) -> Option<&Endpoint> {
        self.active_configuration()?
            .interfaces
            .iter()
            .filter(|i| i.alternate_setting == self.active_alternate_setting(i.number))
            .flat_map(|i| i.endpoints.iter())
            .find(|e| e.matches_identifier(identifier))
    }

    fn find_interface_and_alt(&self, number: u8, alt: u8) -> Option<&crate::interface::Interface> {
        self.active_configuration()?.interface_alt(number, alt)
    }

    fn handle_get_status(&mut self, req: &ControlRequest) -> HandlerOutcome {
        let value: u16 = match req.recipient {
            Recipient::Device => {
                let config = self.active_configuration();
                let self_powered = config.map(|c| c.self_powered).unwrap_or(false);
                let remote_wakeup = config.map(|c| c.remote_wakeup).unwrap_or(false);
                (self_powered as u16) | ((remote_wakeup as u16) << 1)
            }
            Recipient::Interface => 0,
            Recipient::Endpoint => {
                let identifier = (req.index & 0xFF) as u8;
                let halted = self.endpoint_halted(identifier);
                halted as u16
            }
            Recipient::Other => return HandlerOutcome::NotApplicable,
        };
        HandlerOutcome::AckWithData(value.to_le_bytes().to_vec())
    }

    fn endpoint_halted(&self, identifier: u8) -> bool {
        self.active_configuration()
            .into_iter()
            .flat_map(|c| c.interfaces.iter())
            .filter(|i| i.alternate_setting == self.active_alternate_setting(i.number))
            .flat_map(|i| i.endpoints.iter())
            .find(|e| e.matches_identifier(identifier))
            .map(|e| e.is_halted())
            .unwrap_or(false)
    }

    fn set_endpoint_halt(&mut self, identifier: u8, halted: bool) {
        let active_alts = self.active_alt_settings.clone();
        if let Some(value) = self.active_configuration {
            if let Some(config) = self.configurations.iter_mut().find(|c| c.value == value) {
                for interface in config.interfaces.iter_mut() {
                    let active_alt = active_alts.get(&interface.number).copied().unwrap_or(0);
                    if interface.alternate_setting != active_alt {
                        continue;
                    }
                    if let Some(endpoint) = interface.endpoint_by_identifier_mut(identifier) {
                        endpoint.set_halted(halted);
                    }
                }
            }
        }
        if halted {
            let _ = self.backend.stall_endpoint(identifier);
        } else {
            let _ = self.backend.clear_halt(identifier);
        }
    }

    fn handle_clear_feature(&mut self, req: &ControlRequest) -> HandlerOutcome {
        match (req.recipient, req.value) {
            (Recipient::Endpoint, FEATURE_ENDPOINT_HALT) => {
                let identifier = (req.index & 0xFF) as u8;
                self.set_endpoint_halt(identifier, false);
                HandlerOutcome::Ack
            }
            (Recipient::Device, FEATURE_DEVICE_REMOTE_WAKEUP) => {
                if let Some(value) = self.active_configuration {
                    if let Some(config) = self.configurations.iter_mut().find(|c| c.value == value)
                    {
                        config.remote_wakeup = false;
                    }
                }
                HandlerOutcome::Ack
            }
            _ => HandlerOutcome::NotApplicable,
        }
    }

    fn handle_set_feature(&mut self, req: &ControlRequest) -> HandlerOutcome {
        match (req.recipient, req.value) {
            (Recipient::Endpoint, FEATURE_ENDPOINT_HALT) => {
                let identifier = (req.index & 0xFF) as u8;
                self.set_endpoint_halt(identifier, true);
                HandlerOutcome::Ack
            }
            (Recipient::Device, FEATURE_DEVICE_REMOTE_WAKEUP) => {
                if let Some(value) = self.active_configuration {
                    if let Some(config) = self.configurations.iter_mut().find(|c| c.value == value)
                    {
                        config.remote_wakeup = true;
                    }
                }
                HandlerOutcome::Ack
            }
            _ => HandlerOutcome::NotApplicable,
        }
    }

    fn handle_set_address(&mut self, req: &ControlRequest) -> HandlerOutcome {
        if req.recipient != Recipient::Device {
            return HandlerOutcome::NotApplicable;
        }
        // The status stage must be acknowledged at the *old* address;
        // the new address only takes effect afterward. `Device::apply_pending_address`
        // runs once the caller has sent the ack.
        self.pending_address = Some((req.value & 0x7F) as u8);
        HandlerOutcome::Ack
    }

    fn handle_get_descriptor(&mut self, req: &ControlRequest) -> HandlerOutcome {
        if req.recipient != Recipient::Device {
            return HandlerOutcome::NotApplicable;
        }
        let descriptor_type = (req.value >> 8) as u8;
        let index = (req.value & 0xFF) as u8;

        use packed_struct::prelude::PrimitiveEnum;
        let Some(descriptor_type) = crate::types::DescriptorType::from_primitive(descriptor_type)
        else {
            return HandlerOutcome::Stall;
        };

        let data = match descriptor_type {
            crate::types::DescriptorType::Device => self
                .device_descriptor
                .pack()
                .expect("fixed-size device descriptor")
                .to_vec(),
            crate::types::DescriptorType::DeviceQualifier => self
                .qualifier
                .pack()
                .expect("fixed-size qualifier descriptor")
                .to_vec(),
            crate::types::DescriptorType::Configuration => {
                match self.configurations.get(index as usize) {
                    Some(config) => config.descriptor(&mut self.strings),
                    None => return HandlerOutcome::Stall,
                }
            }
            crate::types::DescriptorType::String => {
                if index == 0 {
                    encode_langid_descriptor(&self.lang_ids)
                } else {
                    match self.strings.descriptor(index) {
                        Ok(Some(bytes)) => bytes,
                        Ok(None) => return HandlerOutcome::Stall,
                        Err(e) => {
                            log::error!("string descriptor {index} failed to encode: {e}");
                            return HandlerOutcome::Stall;
                        }
                    }
                }
            }
            _ => return HandlerOutcome::NotApplicable,
        };

        HandlerOutcome::AckWithData(data)
    }

    fn handle_get_configuration(&mut self, req: &ControlRequest) -> HandlerOutcome {
        if req.recipient != Recipient::Device {
            return HandlerOutcome::NotApplicable;
        }
        HandlerOutcome::AckWithData(vec![self.active_configuration.unwrap_or(0)])
    }

    fn handle_set_configuration(&mut self, req: &ControlRequest) -> HandlerOutcome {
        if req.recipient != Recipient::Device {
            return HandlerOutcome::NotApplicable;
        }
        let value = (req.value & 0xFF) as u8;
        if value == 0 {
            self.active_configuration = None;
            self.active_alt_settings.clear();
            return HandlerOutcome::Ack;
        }
        if !self.configurations.iter().any(|c| c.value == value) {
            return HandlerOutcome::Stall;
        }
        self.active_configuration = Some(value);
        self.active_alt_settings.clear();
        HandlerOutcome::Ack
    }

    fn handle_get_interface(&mut self, req: &ControlRequest) -> HandlerOutcome {
        if req.recipient != Recipient::Interface {
            return HandlerOutcome::NotApplicable;
        }
        let number = (req.index & 0xFF) as u8;
        if self.find_interface_and_alt(number, self.active_alternate_setting(number)).is_none() {
            return HandlerOutcome::Stall;
        }
        HandlerOutcome::AckWithData(vec![self.active_alternate_setting(number)])
    }

    fn handle_set_interface(&mut self, req: &ControlRequest) -> HandlerOutcome {
        if req.recipient != Recipient::Interface {
            return HandlerOutcome::NotApplicable;
        }
        let number = (req.index & 0xFF) as u8;
        let alt = (req.value & 0xFF) as u8;
        let Some(interface) = self.find_interface_and_alt(number, alt) else {
            return HandlerOutcome::Stall;
        };

        let identifiers: Vec<u8> = interface.endpoints.iter().map(|e| e.identifier()).collect();
        for identifier in identifiers {
            self.set_endpoint_halt(identifier, false);
        }

        self.active_alt_settings.insert(number, alt);
        HandlerOutcome::Ack
    }
}

/// The default response to a control IN request is truncated to the
/// host's requested `wLength` and never padded -- a short response that
/// happens to land on an exact multiple of the endpoint's max packet size
/// naturally omits the trailing zero-length packet, because nothing asks
/// for more than what's already been sent.
fn truncate_for_control_response(mut data: Vec<u8>, req: &ControlRequest) -> Vec<u8> {
    let requested = req.length as usize;
    if data.len() > requested {
        data.truncate(requested);
    }
    data
}

/// Builder for declaring a [`Device`]'s descriptors and configurations
/// before it connects to a backend.
pub struct DeviceBuilder {
    device_descriptor: DeviceDescriptor,
    configurations: Vec<Configuration>,
    strings: StringTable,
    lang_ids: Vec<u16>,
    speed: DeviceSpeed,
    max_packet_size_ep0: u8,
    handlers: Vec<Handler<Device>>,
    data_out_handlers: Vec<(u8, Box<dyn FnMut(&mut Device, &[u8])>)>,
    data_in_handlers: Vec<(u8, Box<dyn FnMut(&mut Device, usize) -> Vec<u8>>)>,
}

impl DeviceBuilder {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            device_descriptor: DeviceDescriptor::new(vendor_id, product_id, 64),
            configurations: Vec::new(),
            strings: StringTable::new(),
            lang_ids: vec![0x0409], // English (US)
            speed: DeviceSpeed::High,
            max_packet_size_ep0: 64,
            handlers: Vec::new(),
            data_out_handlers: Vec::new(),
            data_in_handlers: Vec::new(),
        }
    }

    pub fn class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.device_descriptor.b_device_class = class;
        self.device_descriptor.b_device_sub_class = subclass;
        self.device_descriptor.b_device_protocol = protocol;
        self
    }

    pub fn device_release(mut self, bcd: u16) -> Self {
        self.device_descriptor.bcd_device = packed_struct::types::Integer::from_primitive(bcd);
        self
    }

    pub fn speed(mut self, speed: DeviceSpeed) -> Self {
        self.speed = speed;
        self.device_descriptor.bcd_usb =
            packed_struct::types::Integer::from_primitive(speed.bcd_usb());
        self
    }

    pub fn max_packet_size_ep0(mut self, size: u8) -> Self {
        self.max_packet_size_ep0 = size;
        self.device_descriptor.b_max_packet_size_0 = size;
        self
    }

    pub fn manufacturer(mut self, s: &str) -> Self {
        self.device_descriptor.i_manufacturer = self.strings.add_string(s, None);
        self
    }

    pub fn product(mut self, s: &str) -> Self {
        self.device_descriptor.i_product = self.strings.add_string(s, None);
        self
    }

    pub fn serial(mut self, s: &str) -> Self {
        self.device_descriptor.i_serial_number = self.strings.add_string(s, None);
        self
    }

    pub fn supported_languages(mut self, lang_ids: Vec<u16>) -> Self {
        self.lang_ids = lang_ids;
        self
    }

    pub fn configuration(mut self, configuration: Configuration) -> Self {
        self.configurations.push(configuration);
        self.device_descriptor.b_num_configurations = self.configurations.len() as u8;
        self
    }

    /// Registers an additional (class or vendor) control request handler,
    /// run alongside the built-in standard-request handlers.
    pub fn handler(
        mut self,
        predicate: Predicate,
        callback: impl Fn(&mut Device, &ControlRequest) -> HandlerOutcome + 'static,
    ) -> Self {
        self.handlers.push(Handler::new(predicate, callback));
        self
    }

    /// Registers a callback invoked with the bytes of every OUT packet
    /// received on `endpoint_identifier` (as returned by
    /// [`crate::types::endpoint_identifier`] or [`crate::endpoint::Endpoint::identifier`]).
    pub fn on_data_out(
        mut self,
        endpoint_identifier: u8,
        callback: impl FnMut(&mut Device, &[u8]) + 'static,
    ) -> Self {
        self.data_out_handlers
            .push((endpoint_identifier, Box::new(callback)));
        self
    }

    /// Registers a callback that produces the bytes sent the next time the
    /// host issues an IN token on `endpoint_identifier`, given the number
    /// of bytes the host is willing to accept.
    pub fn on_data_in(
        mut self,
        endpoint_identifier: u8,
        callback: impl FnMut(&mut Device, usize) -> Vec<u8> + 'static,
    ) -> Self {
        self.data_in_handlers
            .push((endpoint_identifier, Box::new(callback)));
        self
    }

    fn standard_handler(
        request: StandardRequest,
        callback: impl Fn(&mut Device, &ControlRequest) -> HandlerOutcome + 'static,
    ) -> Handler<Device> {
        Handler::new(
            Predicate {
                kind: Some(RequestKind::Standard),
                request: Some(request as u8),
                ..Default::default()
            },
            callback,
        )
    }

    pub fn build(self, backend: Box<dyn Backend>) -> Device {
        let qualifier = DeviceQualifierDescriptor::new(
            &self.device_descriptor,
            self.device_descriptor.b_num_configurations,
        );

        let mut handlers = vec![
            Self::standard_handler(StandardRequest::GetStatus, Device::handle_get_status),
            Self::standard_handler(StandardRequest::ClearFeature, Device::handle_clear_feature),
            Self::standard_handler(StandardRequest::SetFeature, Device::handle_set_feature),
            Self::standard_handler(StandardRequest::SetAddress, Device::handle_set_address),
            Self::standard_handler(StandardRequest::GetDescriptor, Device::handle_get_descriptor),
            Self::standard_handler(
                StandardRequest::GetConfiguration,
                Device::handle_get_configuration,
            ),
            Self::standard_handler(
                StandardRequest::SetConfiguration,
                Device::handle_set_configuration,
            ),
            Self::standard_handler(StandardRequest::GetInterface, Device::handle_get_interface),
            Self::standard_handler(StandardRequest::SetInterface, Device::handle_set_interface),
        ];
        handlers.extend(self.handlers);

        Device {
            device_descriptor: self.device_descriptor,
            qualifier,
            configurations: self.configurations,
            strings: self.strings,
            lang_ids: self.lang_ids,
            speed: self.speed,
            max_packet_size_ep0: self.max_packet_size_ep0,
            address: 0,
            pending_address: None,
            active_configuration: None,
            active_alt_settings: BTreeMap::new(),
            handlers,
            data_out_handlers: self.data_out_handlers,
            data_in_handlers: self.data_in_handlers,
            backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::vhci::VhciBackend;
    use crate::endpoint::Endpoint;
    use crate::interface::Interface;
    use crate::types::TransferType;

    fn build_device() -> Device {
        Device::builder(0x1209, 0x0001)
            .manufacturer("usbemu")
            .product("test device")
            .configuration(
                Configuration::new(1).interface(
                    Interface::new(0, 0, 0xFF, 0, 0)
                        .endpoint(Endpoint::new(1, Direction::In, TransferType::Bulk, 64, 0)),
                ),
            )
            .build(Box::new(VhciBackend::new()))
    }

    fn setup(bm_request_type: u8, request: u8, value: u16, index: u16, length: u16) -> ControlRequest {
        let mut packet = [0u8; 8];
        packet[0] = bm_request_type;
        packet[1] = request;
        packet[2..4].copy_from_slice(&value.to_le_bytes());
        packet[4..6].copy_from_slice(&index.to_le_bytes());
        packet[6..8].copy_from_slice(&length.to_le_bytes());
        ControlRequest::from_setup_packet(&packet).unwrap()
    }

    fn dispatch_test(device: &mut Device, req: &ControlRequest) -> HandlerOutcome {
        let handlers = std::mem::take(&mut device.handlers);
        let outcome = dispatch(&handlers, device, req);
        device.handlers = handlers;
        outcome
    }

    #[test]
    fn get_descriptor_device_returns_18_bytes_truncated_to_request() {
        let mut device = build_device();
        let req = setup(0x80, StandardRequest::GetDescriptor as u8, 0x0100, 0, 8);
        let outcome = dispatch_test(&mut device, &req);
        match outcome {
            HandlerOutcome::AckWithData(data) => assert_eq!(data.len(), 18),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn set_configuration_rejects_unknown_value() {
        let mut device = build_device();
        let req = setup(0x00, StandardRequest::SetConfiguration as u8, 7, 0, 0);
        let outcome = dispatch_test(&mut device, &req);
        assert!(matches!(outcome, HandlerOutcome::Stall));
    }

    #[test]
    fn set_configuration_then_get_configuration_round_trips() {
        let mut device = build_device();
        let set_req = setup(0x00, StandardRequest::SetConfiguration as u8, 1, 0, 0);
        assert!(matches!(dispatch_test(&mut device, &set_req), HandlerOutcome::Ack));

        let get_req = setup(0x80, StandardRequest::GetConfiguration as u8, 0, 0, 1);
        match dispatch_test(&mut device, &get_req) {
            HandlerOutcome::AckWithData(data) => assert_eq!(data, vec![1]),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn interface_handler_only_runs_while_its_alternate_setting_is_active() {
        let mut device = Device::builder(0x1209, 0x0001)
            .configuration(
                Configuration::new(1)
                    .interface(
                        Interface::new(0, 0, 0xFF, 0, 0).handler(
                            Predicate {
                                kind: Some(RequestKind::Vendor),
                                request: Some(1),
                                ..Default::default()
                            },
                            |_device, _req| HandlerOutcome::Ack,
                        ),
                    )
                    .interface(Interface::new(0, 1, 0xFF, 0, 0)),
            )
            .build(Box::new(VhciBackend::new()));

        let set_config = setup(0x00, StandardRequest::SetConfiguration as u8, 1, 0, 0);
        assert!(matches!(device.dispatch_recursive(&set_config), HandlerOutcome::Ack));

        let vendor_req = setup(0x41, 1, 0, 0, 0);
        assert!(matches!(
            device.dispatch_recursive(&vendor_req),
            HandlerOutcome::Ack
        ));

        let set_alt = setup(0x01, StandardRequest::SetInterface as u8, 1, 0, 0);
        assert!(matches!(device.dispatch_recursive(&set_alt), HandlerOutcome::Ack));

        assert!(matches!(
            device.dispatch_recursive(&vendor_req),
            HandlerOutcome::NotApplicable
        ));
    }

    #[test]
    fn endpoint_handler_predicate_masks_reserved_index_bits() {
        let mut device = Device::builder(0x1209, 0x0001)
            .configuration(
                Configuration::new(1).interface(
                    Interface::new(0, 0, 0xFF, 0, 0).endpoint(
                        Endpoint::new(1, Direction::In, TransferType::Bulk, 64, 0).handler(
                            Predicate {
                                kind: Some(RequestKind::Vendor),
                                request: Some(2),
                                ..Default::default()
                            },
                            |_device, _req| HandlerOutcome::Ack,
                        ),
                    ),
                ),
            )
            .build(Box::new(VhciBackend::new()));

        let set_config = setup(0x00, StandardRequest::SetConfiguration as u8, 1, 0, 0);
        assert!(matches!(device.dispatch_recursive(&set_config), HandlerOutcome::Ack));

        // wIndex carries reserved bits 6..4 set alongside endpoint 1 IN (0x81).
        let req = setup(0x42, 2, 0, 0xF1, 0);
        assert!(matches!(device.dispatch_recursive(&req), HandlerOutcome::Ack));
    }

    #[test]
    fn data_out_handler_receives_bytes_for_its_endpoint() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let received_clone = received.clone();
        let mut device = Device::builder(0x1209, 0x0001)
            .configuration(
                Configuration::new(1).interface(Interface::new(0, 0, 0xFF, 0, 0).endpoint(
                    Endpoint::new(1, Direction::Out, TransferType::Bulk, 64, 0),
                )),
            )
            .on_data_out(0x01, move |_device, data| {
                received_clone.borrow_mut().extend_from_slice(data);
            })
            .build(Box::new(VhciBackend::new()));

        device.handle_data_out(0x01, &[1, 2, 3]);
        assert_eq!(*received.borrow(), vec![1, 2, 3]);
    }
}
