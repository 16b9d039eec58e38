use packed_struct::PackedStruct;

use crate::descriptor::{InterfaceDescriptor, StringRef, StringTable};
use crate::device::Device;
use crate::endpoint::Endpoint;
use crate::request::{ControlRequest, Handler, HandlerOutcome, Predicate};
use crate::types::{DescriptorType, Recipient};

/// One alternate setting of a USB interface.
///
/// A logical interface with N alternate settings is represented as N
/// `Interface` values sharing the same `number` but distinct
/// `alternate_setting`; the configuration descriptor lists every alternate
/// setting, while the device tracks which one is currently active per
/// interface number (see [`crate::device::Device::set_interface`]).
pub struct Interface {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string: StringRef,
    pub endpoints: Vec<Endpoint>,
    pub(crate) handlers: Vec<Handler<Device>>,
}

impl Interface {
    pub fn new(number: u8, alternate_setting: u8, class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            number,
            alternate_setting,
            class,
            subclass,
            protocol,
            string: StringRef::None,
            endpoints: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn string(mut self, s: impl Into<StringRef>) -> Self {
        self.string = s.into();
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Registers a control request handler scoped to this interface
    /// alternate setting: it only runs while this alternate setting is
    /// active, and only for requests whose recipient is this interface
    /// (`wIndex` low byte matching [`Interface::number`]) unless the
    /// predicate already overrides those fields explicitly.
    pub fn handler(
        mut self,
        mut predicate: Predicate,
        callback: impl Fn(&mut Device, &ControlRequest) -> HandlerOutcome + 'static,
    ) -> Self {
        predicate.recipient.get_or_insert(Recipient::Interface);
        predicate.number.get_or_insert(self.number as u16);
        self.handlers.push(Handler::new(predicate, callback));
        self
    }

    pub fn endpoint_by_identifier(&self, identifier: u8) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.matches_identifier(identifier))
    }

    pub fn endpoint_by_identifier_mut(&mut self, identifier: u8) -> Option<&mut Endpoint> {
        self.endpoints
            .iter_mut()
            .find(|e| e.matches_identifier(identifier))
    }

    /// Appends this alternate setting's Interface Descriptor, followed by
    /// its Endpoint Descriptors, to a configuration descriptor being
    /// assembled.
    pub fn append_descriptor(&self, out: &mut Vec<u8>, strings: &mut StringTable) {
        let desc = InterfaceDescriptor {
            b_length: 9,
            b_descriptor_type: DescriptorType::Interface as u8,
            b_interface_number: self.number,
            b_alternate_setting: self.alternate_setting,
            b_num_endpoints: self.endpoints.len() as u8,
            b_interface_class: self.class,
            b_interface_subclass: self.subclass,
            b_interface_protocol: self.protocol,
            i_interface: strings.index_of(&self.string),
        };
        out.extend_from_slice(&desc.pack().expect("fixed-size interface descriptor"));
        for endpoint in &self.endpoints {
            out.extend_from_slice(
                &endpoint
                    .descriptor()
                    .pack()
                    .expect("fixed-size endpoint descriptor"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, TransferType};

    #[test]
    fn descriptor_includes_all_endpoints() {
        let iface = Interface::new(0, 0, 0x03, 0, 0)
            .endpoint(Endpoint::new(1, Direction::In, TransferType::Interrupt, 8, 10));
        let mut strings = StringTable::new();
        let mut out = Vec::new();
        iface.append_descriptor(&mut out, &mut strings);
        assert_eq!(out.len(), 9 + 7);
        assert_eq!(out[4], 1); // bNumEndpoints
    }
}
