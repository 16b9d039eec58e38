//! Minimal runnable example: a vendor-specific device with one bulk OUT
//! and one bulk IN endpoint that echoes back whatever the host last sent.
//! Run as root after `modprobe vhci-hcd` to attach it to the kernel's
//! USB/IP virtual host controller.

use std::cell::RefCell;
use std::rc::Rc;

use simple_logger::SimpleLogger;

use usbemu::{Configuration, Device, Direction, EmulationConfig, Endpoint, Interface};
use usbemu::types::TransferType;

const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .expect("logger already initialized");

    let config = EmulationConfig::from_env();

    if let Err(e) = usbemu::backend::vhci::load_vhci_hcd() {
        log::error!("failed to load vhci-hcd: {e}");
        return;
    }

    let backend = match usbemu::backend::resolve(&config) {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("failed to select a backend: {e}");
            return;
        }
    };

    let last_message: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let store = last_message.clone();
    let echo = last_message;

    let device = Device::builder(0x1209, 0x000a)
        .class(0xff, 0x00, 0x00)
        .manufacturer("usbemu")
        .product("loopback demo")
        .serial("0001")
        .configuration(
            Configuration::new(1).interface(
                Interface::new(0, 0, 0xff, 0x00, 0x00)
                    .endpoint(Endpoint::new(1, Direction::Out, TransferType::Bulk, 64, 0))
                    .endpoint(Endpoint::new(1, Direction::In, TransferType::Bulk, 64, 0)),
            ),
        )
        .on_data_out(ENDPOINT_OUT, move |_device, data| {
            log::info!("received {} bytes", data.len());
            *store.borrow_mut() = data.to_vec();
        })
        .on_data_in(ENDPOINT_IN, move |_device, length| {
            let mut data = echo.borrow().clone();
            data.truncate(length);
            data
        })
        .build(backend);

    log::info!("device connecting, entering event loop");
    if let Err(e) = usbemu::emulate(device, &config, Vec::new()) {
        log::error!("emulation ended with error: {e}");
    }
}
