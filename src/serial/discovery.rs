use std::{fmt::Display, io};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tracing::{debug, warn};

use crate::{
    config::{normalize_port, same_port, PairingTable, OUTGOING_PORTS},
    error::PortError,
};

/// What kind of device sits behind a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    /// A port on the machine itself, e.g. a PCI card.
    Physical,

    /// A USB to serial adapter.
    Usb,

    /// A Bluetooth serial link.
    Bluetooth,

    /// A Moxa RealCOM network port.
    Moxa,

    /// One end of a com0com loopback pair.
    Com0com,

    /// Some other virtual port driver.
    OtherVirtual,

    /// No information available.
    Unknown,
}

impl Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PortKind::Physical => "Physical",
            PortKind::Usb => "USB",
            PortKind::Bluetooth => "Bluetooth",
            PortKind::Moxa => "Moxa virtual",
            PortKind::Com0com => "com0com virtual",
            PortKind::OtherVirtual => "Other virtual",
            PortKind::Unknown => "Unknown",
        };

        write!(f, "{s}")
    }
}

/// A serial port found on this machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPort {
    /// The name to open it by.
    pub name: String,

    /// What it is.
    pub kind: PortKind,

    /// Human readable details.
    pub description: String,
}

impl Display for DiscoveredPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}) - {}", self.name, self.kind, self.description)
    }
}

/// Recognize virtual port drivers from whatever text describes the port.
fn virtual_kind(hint: &str) -> Option<PortKind> {
    let hint = hint.to_ascii_lowercase();

    if hint.contains("npdrv") || hint.contains("moxa") {
        Some(PortKind::Moxa)
    } else if ["com0com", "cnca", "cncb"].iter().any(|p| hint.contains(p)) {
        Some(PortKind::Com0com)
    } else if ["virtual", "vspd"].iter().any(|p| hint.contains(p)) {
        Some(PortKind::OtherVirtual)
    } else {
        None
    }
}

/// Classify a port from what the OS reports about it.
pub fn classify(name: &str, port_type: &SerialPortType) -> (PortKind, String) {
    let (fallback, description) = match port_type {
        SerialPortType::UsbPort(info) => {
            let description = [info.manufacturer.as_deref(), info.product.as_deref()]
                .into_iter()
                .flatten()
                .join(" ");
            let description = if description.is_empty() {
                format!("USB {:04x}:{:04x}", info.vid, info.pid)
            } else {
                description
            };

            (PortKind::Usb, description)
        }
        SerialPortType::PciPort => (PortKind::Physical, "PCI serial port".to_owned()),
        SerialPortType::BluetoothPort => (PortKind::Bluetooth, "Bluetooth serial port".to_owned()),
        SerialPortType::Unknown => (PortKind::Unknown, String::new()),
    };

    let kind = virtual_kind(&format!("{name} {description}")).unwrap_or(fallback);

    let description = match (kind, description.is_empty()) {
        (PortKind::Moxa, true) => "Moxa RealCOM virtual port".to_owned(),
        (PortKind::Com0com, true) => "com0com virtual port pair".to_owned(),
        (PortKind::OtherVirtual, true) => "Virtual serial port".to_owned(),
        (_, true) => "Serial port".to_owned(),
        (_, false) => description,
    };

    (kind, description)
}

/// COM ports first in numeric order, then everything else by name.
fn sort_key(name: &str) -> (u8, u32, String) {
    let normalized = normalize_port(name);

    match normalized
        .strip_prefix("COM")
        .and_then(|n| n.parse::<u32>().ok())
    {
        Some(number) => (0, number, normalized),
        None => (1, 0, normalized),
    }
}

/// Sort ports the way an operator expects to see them.
pub fn sort_ports(ports: impl IntoIterator<Item = DiscoveredPort>) -> Vec<DiscoveredPort> {
    ports
        .into_iter()
        .sorted_by_key(|port| sort_key(&port.name))
        .collect()
}

/// List the serial ports on this machine.
pub fn discover() -> Result<Vec<DiscoveredPort>, PortError> {
    let ports = serialport::available_ports().map_err(|e| PortError::Io {
        port: "*".to_owned(),
        source: io::Error::from(e),
    })?;

    let ports = sort_ports(ports.into_iter().map(|info| {
        let (kind, description) = classify(&info.port_name, &info.port_type);

        DiscoveredPort {
            name: info.port_name,
            kind,
            description,
        }
    }));

    debug!(n = ports.len(), "Found serial ports");

    Ok(ports)
}

/// The fixed outgoing ports, for when nothing can be listed.
pub fn fallback_ports() -> Vec<DiscoveredPort> {
    OUTGOING_PORTS
        .iter()
        .map(|name| DiscoveredPort {
            name: (*name).to_owned(),
            kind: PortKind::Unknown,
            description: "Fixed outgoing port (fallback)".to_owned(),
        })
        .collect()
}

/// Like [`discover`], but never fails.
pub fn discover_or_fallback() -> Vec<DiscoveredPort> {
    match discover() {
        Ok(ports) if !ports.is_empty() => ports,
        Ok(_) => {
            warn!("No serial ports found, showing fallback list");
            fallback_ports()
        }
        Err(e) => {
            warn!(%e, "Port enumeration failed, showing fallback list");
            fallback_ports()
        }
    }
}

/// Ports which may be chosen as the incoming port.
///
/// The outgoing ports and their loopback counterparts are excluded.
pub fn incoming_candidates<'a>(
    ports: &'a [DiscoveredPort],
    outgoing: &[&str],
    pairing: &PairingTable,
) -> Vec<&'a DiscoveredPort> {
    ports
        .iter()
        .filter(|port| {
            !outgoing.iter().any(|out| {
                same_port(&port.name, out) || pairing.are_paired(&port.name, out)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn port(name: &str) -> DiscoveredPort {
        DiscoveredPort {
            name: name.to_owned(),
            kind: PortKind::Unknown,
            description: String::new(),
        }
    }

    #[test]
    fn virtual_drivers() {
        assert_eq!(virtual_kind(r"\Device\Npdrv0"), Some(PortKind::Moxa));
        assert_eq!(virtual_kind(r"\Device\com0com10"), Some(PortKind::Com0com));
        assert_eq!(virtual_kind("CNCB0"), Some(PortKind::Com0com));
        assert_eq!(virtual_kind("Eltima VSPD"), Some(PortKind::OtherVirtual));
        assert_eq!(virtual_kind(r"\Device\Serial0"), None);
    }

    #[test]
    fn classify_by_port_type() {
        let (kind, description) = classify("COM1", &SerialPortType::PciPort);
        assert_eq!(kind, PortKind::Physical);
        assert_eq!(description, "PCI serial port");

        let (kind, _) = classify("/dev/rfcomm0", &SerialPortType::BluetoothPort);
        assert_eq!(kind, PortKind::Bluetooth);

        let (kind, description) = classify("CNCA0", &SerialPortType::Unknown);
        assert_eq!(kind, PortKind::Com0com);
        assert_eq!(description, "com0com virtual port pair");
    }

    #[test]
    fn com_ports_sort_numerically_first() {
        let sorted = sort_ports(["/dev/ttyS0", "COM10", "COM9", "com2"].map(port));

        let names = sorted.iter().map(|p| p.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["com2", "COM9", "COM10", "/dev/ttyS0"]);
    }

    #[test]
    fn candidates_exclude_outgoing_and_pairs() {
        let ports = ["COM3", "COM131", "COM132", "COM141", "COM142", "COM88"].map(port);
        let pairing = PairingTable::from_pairs([("COM131", "COM132"), ("COM141", "COM142")]);

        let candidates = incoming_candidates(&ports, &OUTGOING_PORTS, &pairing);

        let names = candidates.iter().map(|p| p.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["COM3", "COM88"]);
    }

    #[test]
    fn fallback_lists_outgoing() {
        let names = fallback_ports()
            .into_iter()
            .map(|p| p.name)
            .collect::<Vec<_>>();

        assert_eq!(names, vec!["COM131", "COM141"]);
    }
}
