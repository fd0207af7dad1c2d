use std::{future::Future, io};

use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::trace;

use crate::{
    config::PortConfig,
    port::{open_blocking, Link, PortDriver},
};

/// Opens real serial ports, 8N1 without flow control.
///
/// On unix the port is opened in exclusive mode,
/// on Windows the OS already refuses a second open.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialDriver;

fn try_create_serial_port(config: &PortConfig) -> io::Result<SerialStream> {
    trace!(port = %config.name, baud = config.baud, "Opening serial port");

    tokio_serial::new(&config.name, config.baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(config.timeout)
        .open_native_async()
        .map_err(io::Error::from)
}

impl PortDriver for SerialDriver {
    type Link = SerialStream;

    fn open(&self, config: &PortConfig) -> impl Future<Output = io::Result<Self::Link>> + Send {
        let config = config.clone();

        open_blocking(move || try_create_serial_port(&config))
    }
}

impl Link for SerialStream {
    fn probe(&mut self) -> bool {
        // A control query, which fails once the device is gone.
        self.bytes_to_read().is_ok()
    }
}
