#![allow(warnings)]
use packed_struct::prelude::*;

/// Direction of a data transfer, relative to the host.
#[derive(PrimitiveEnum, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    pub fn from_endpoint_address(addr: u8) -> Self {
        if addr & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Transfer type, encoded in bits 1..0 of bmAttributes.
#[derive(PrimitiveEnum, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Synchronization type, encoded in bits 3..2 of bmAttributes for
/// isochronous endpoints.
#[derive(PrimitiveEnum, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SynchronizationType {
    NoSynchronization = 0,
    Asynchronous = 1,
    Adaptive = 2,
    Synchronous = 3,
}

/// Usage type, encoded in bits 5..4 of bmAttributes for isochronous
/// endpoints.
#[derive(PrimitiveEnum, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UsageType {
    Data = 0,
    Feedback = 1,
    ImplicitFeedback = 2,
}

/// bmRequestType bits 6..5: standard, class, or vendor request.
#[derive(PrimitiveEnum, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// bmRequestType bits 4..0: the recipient of a control request.
#[derive(PrimitiveEnum, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Descriptor type (bDescriptorType, wValue high byte).
#[derive(PrimitiveEnum, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
}

/// Standard requests defined in USB 2.0 table 9-4.
#[derive(PrimitiveEnum, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

/// The speed at which the emulated device advertises itself to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeviceSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl DeviceSpeed {
    /// bcdUSB value conventionally associated with this speed, matching the
    /// values the vhci backend maps back to a USBIP speed code.
    pub fn bcd_usb(self) -> u16 {
        match self {
            DeviceSpeed::Low | DeviceSpeed::Full => 0x0110,
            DeviceSpeed::High => 0x0200,
            DeviceSpeed::Super => 0x0300,
            DeviceSpeed::SuperPlus => 0x0310,
        }
    }
}

pub const REQUEST_TYPE_DIRECTION_MASK: u8 = 0b1000_0000;
pub const REQUEST_TYPE_KIND_MASK: u8 = 0b0110_0000;
pub const REQUEST_TYPE_RECIPIENT_MASK: u8 = 0b0001_1111;

/// Mask identifying the endpoint number and direction in an endpoint
/// address or identifier, ignoring the reserved bits 6..4.
pub const ENDPOINT_IDENTIFIER_MASK: u8 = 0b1000_1111;

pub fn endpoint_identifier(number: u8, direction: Direction) -> u8 {
    let dir_bit = match direction {
        Direction::In => 0x80,
        Direction::Out => 0x00,
    };
    (number & 0x0F) | dir_bit
}
