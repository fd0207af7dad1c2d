/// The real serial port driver.
pub mod serial_port;

/// Finding and classifying the serial ports on this machine.
pub mod discovery;

pub use serial_port::SerialDriver;
