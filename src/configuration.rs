use packed_struct::prelude::*;

use crate::descriptor::{ConfigurationDescriptorHeader, StringRef, StringTable};
use crate::device::Device;
use crate::interface::Interface;
use crate::request::{ControlRequest, Handler, HandlerOutcome, Predicate};

/// A device configuration: a named bundle of interfaces (each possibly
/// with several alternate settings) that the host selects as a whole via
/// SET_CONFIGURATION.
pub struct Configuration {
    pub value: u8,
    pub string: StringRef,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    pub max_power_ma: u8,
    pub interfaces: Vec<Interface>,
    pub(crate) handlers: Vec<Handler<Device>>,
}

impl Configuration {
    pub fn new(value: u8) -> Self {
        Self {
            value,
            string: StringRef::None,
            self_powered: false,
            remote_wakeup: false,
            max_power_ma: 100,
            interfaces: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Registers a control request handler that runs whenever this
    /// configuration is active, regardless of which interface or endpoint
    /// the request targets.
    pub fn handler(
        mut self,
        predicate: Predicate,
        callback: impl Fn(&mut Device, &ControlRequest) -> HandlerOutcome + 'static,
    ) -> Self {
        self.handlers.push(Handler::new(predicate, callback));
        self
    }

    pub fn string(mut self, s: impl Into<StringRef>) -> Self {
        self.string = s.into();
        self
    }

    pub fn self_powered(mut self, value: bool) -> Self {
        self.self_powered = value;
        self
    }

    pub fn remote_wakeup(mut self, value: bool) -> Self {
        self.remote_wakeup = value;
        self
    }

    pub fn max_power_ma(mut self, ma: u8) -> Self {
        self.max_power_ma = ma;
        self
    }

    pub fn interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Distinct interface numbers in this configuration, regardless of how
    /// many alternate settings each has.
    pub fn interface_numbers(&self) -> Vec<u8> {
        let mut numbers: Vec<u8> = self.interfaces.iter().map(|i| i.number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    }

    pub fn interface_alt(&self, number: u8, alternate_setting: u8) -> Option<&Interface> {
        self.interfaces
            .iter()
            .find(|i| i.number == number && i.alternate_setting == alternate_setting)
    }

    /// Encodes this configuration's descriptor tree: the Configuration
    /// Descriptor header followed by every interface's alternate settings
    /// (each with its own endpoint descriptors), matching what a real
    /// device returns for GET_DESCRIPTOR(CONFIGURATION) -- all alternate
    /// settings are included regardless of which is currently active.
    pub fn descriptor(&self, strings: &mut StringTable) -> Vec<u8> {
        let mut header = ConfigurationDescriptorHeader::new(
            self.value,
            strings.index_of(&self.string),
            self.self_powered,
            self.remote_wakeup,
            self.max_power_ma,
        );
        header.b_num_interfaces = self.interface_numbers().len() as u8;

        let mut body = Vec::new();
        for interface in &self.interfaces {
            interface.append_descriptor(&mut body, strings);
        }

        header.w_total_length = Integer::from_primitive((9 + body.len()) as u16);

        let mut out = header.pack().expect("fixed-size configuration header").to_vec();
        out.extend(body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::types::{Direction, TransferType};

    #[test]
    fn total_length_matches_encoded_size() {
        let config = Configuration::new(1).interface(
            Interface::new(0, 0, 0x03, 0, 0)
                .endpoint(Endpoint::new(1, Direction::In, TransferType::Interrupt, 8, 10)),
        );
        let mut strings = StringTable::new();
        let bytes = config.descriptor(&mut strings);
        let total_length = u16::from_le_bytes([bytes[2], bytes[3]]);
        assert_eq!(total_length as usize, bytes.len());
        assert_eq!(bytes.len(), 9 + 9 + 7);
    }

    #[test]
    fn num_interfaces_counts_distinct_numbers_not_alt_settings() {
        let config = Configuration::new(1)
            .interface(Interface::new(0, 0, 0x03, 0, 0))
            .interface(Interface::new(0, 1, 0x03, 0, 0));
        let mut strings = StringTable::new();
        let bytes = config.descriptor(&mut strings);
        assert_eq!(bytes[4], 1);
    }
}
