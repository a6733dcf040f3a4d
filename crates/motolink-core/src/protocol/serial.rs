//! Serial port handling
//!
//! Provides port enumeration and low-level serial port setup for the ECU link.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::LinkError;

/// Kind of hardware behind a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// USB serial adapter
    Usb,
    /// Bluetooth SPP link
    Bluetooth,
    /// On-board or PCI UART
    Pci,
    /// Driver gave no hint
    Unknown,
}

/// A serial device the ECU cable might be plugged into
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// OS device path, `/dev/ttyUSB0` or `COM3`
    pub name: String,
    /// Bus the port sits on
    pub kind: PortKind,
    /// USB vendor id
    pub vid: Option<u16>,
    /// USB product id
    pub pid: Option<u16>,
    /// USB descriptor strings, when the driver exposes them
    pub manufacturer: Option<String>,
    /// USB product string
    pub product: Option<String>,
    /// USB serial number string
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let mut port = PortInfo::bare(info.port_name);
        match info.port_type {
            SerialPortType::UsbPort(usb) => {
                port.kind = PortKind::Usb;
                port.vid = Some(usb.vid);
                port.pid = Some(usb.pid);
                port.manufacturer = usb.manufacturer;
                port.product = usb.product;
                port.serial_number = usb.serial_number;
            }
            SerialPortType::BluetoothPort => port.kind = PortKind::Bluetooth,
            SerialPortType::PciPort => port.kind = PortKind::Pci,
            SerialPortType::Unknown => {}
        }
        port
    }
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            kind: PortKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// Human readable description for a port picker
    pub fn description(&self) -> String {
        match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) => format!("{p} ({m})"),
            (None, Some(p)) => p.clone(),
            (Some(m), None) => m.clone(),
            (None, None) => match self.kind {
                PortKind::Usb => match (self.vid, self.pid) {
                    (Some(vid), Some(pid)) => format!("USB serial {vid:04x}:{pid:04x}"),
                    _ => "USB serial".to_string(),
                },
                PortKind::Bluetooth => "Bluetooth serial".to_string(),
                PortKind::Pci => "PCI serial".to_string(),
                PortKind::Unknown => "Serial port".to_string(),
            },
        }
    }

    /// Heuristic: Bluetooth or virtual ports that cannot host an ECU cable
    pub fn is_virtual(&self) -> bool {
        if self.kind == PortKind::Bluetooth {
            return true;
        }
        let name = self.name.to_ascii_lowercase();
        let description = self.description().to_ascii_lowercase();
        const NAME_HINTS: [&str; 4] = ["rfcomm", "bluetooth", "bthenum", "pts/"];
        const DESC_HINTS: [&str; 3] = ["bluetooth", "virtual", "com0com"];
        NAME_HINTS.iter().any(|h| name.contains(h))
            || DESC_HINTS.iter().any(|h| description.contains(h))
    }
}

/// Cable adapters first: CDC-ACM, then USB-serial, then COM, each in
/// numeric order; everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    const FAMILIES: [&str; 3] = ["ttyACM", "ttyUSB", "COM"];
    let base = Path::new(name)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(name);
    FAMILIES
        .iter()
        .zip(0u8..)
        .find_map(|(family, rank)| {
            let index = base.strip_prefix(family)?.parse().unwrap_or(usize::MAX);
            Some((rank, index, base.to_string()))
        })
        .unwrap_or((FAMILIES.len() as u8, 0, base.to_string()))
}

/// Cable device nodes udev created but the enumeration API missed
#[cfg(target_os = "linux")]
fn dev_node_ports() -> Vec<PortInfo> {
    let Ok(dir) = fs::read_dir("/dev") else {
        return Vec::new();
    };
    dir.flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|node| node.starts_with("ttyACM") || node.starts_with("ttyUSB"))
        .map(|node| PortInfo::bare(format!("/dev/{node}")))
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn dev_node_ports() -> Vec<PortInfo> {
    Vec::new()
}

/// Every serial port on the system, cable adapters first
pub fn list_ports() -> Vec<PortInfo> {
    let enumerated = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from);

    let mut by_name: BTreeMap<String, PortInfo> = BTreeMap::new();
    for port in enumerated.chain(dev_node_ports()) {
        by_name.entry(port.name.clone()).or_insert(port);
    }

    let mut ports: Vec<PortInfo> = by_name.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// List ports that could host a wired ECU cable
pub fn list_physical_ports() -> Vec<PortInfo> {
    filter_physical(list_ports())
}

fn filter_physical(ports: Vec<PortInfo>) -> Vec<PortInfo> {
    ports.into_iter().filter(|p| !p.is_virtual()).collect()
}

fn map_open_error(name: &str, err: serialport::Error) -> LinkError {
    match err.kind() {
        serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut) => LinkError::Timeout,
        _ => LinkError::PortUnavailable {
            port: name.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Open a serial port
pub fn open_port(
    name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>, LinkError> {
    serialport::new(name, baud_rate)
        .timeout(timeout)
        .open()
        .map_err(|e| map_open_error(name, e))
}

/// 8N1, no flow control, DTR and RTS asserted
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), LinkError> {
    use serialport::{DataBits, FlowControl, Parity, StopBits};

    let name = port.name().unwrap_or_default();
    let fail = |e: serialport::Error| map_open_error(&name, e);

    port.set_data_bits(DataBits::Eight).map_err(fail)?;
    port.set_parity(Parity::None).map_err(fail)?;
    port.set_stop_bits(StopBits::One).map_err(fail)?;
    port.set_flow_control(FlowControl::None).map_err(fail)?;

    // Some K-line adapters power their level shifter from DTR/RTS
    for (line, result) in [
        ("DTR", port.write_data_terminal_ready(true)),
        ("RTS", port.write_request_to_send(true)),
    ] {
        if let Err(e) = result {
            debug!(port = %name, line, error = %e, "serial: could not assert control line");
        }
    }

    Ok(())
}

/// Drop anything buffered in either direction
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), LinkError> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| LinkError::TransportClosed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, kind: PortKind, product: Option<&str>) -> PortInfo {
        PortInfo {
            kind,
            product: product.map(str::to_string),
            ..PortInfo::bare(name.to_string())
        }
    }

    #[test]
    fn test_list_ports_is_sorted() {
        let ports = list_ports();
        let keys: Vec<_> = ports.iter().map(|p| port_sort_key(&p.name)).collect();
        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "COM3",
            "/dev/ttyACM10",
        ];
        let mut sorted = names.clone();
        sorted.sort_by_key(|n| port_sort_key(n));

        assert_eq!(
            sorted,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "COM3",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_virtual_port_filtering() {
        let ports = vec![
            port("/dev/ttyUSB0", PortKind::Usb, Some("FT232R USB UART")),
            port("/dev/rfcomm0", PortKind::Unknown, None),
            port("COM7", PortKind::Bluetooth, None),
            port("COM9", PortKind::Unknown, Some("Standard Serial over Bluetooth link")),
            port("COM12", PortKind::Unknown, Some("com0com - serial port emulator")),
            port("/dev/ttyACM0", PortKind::Usb, None),
        ];

        let kept: Vec<String> = filter_physical(ports).into_iter().map(|p| p.name).collect();
        assert_eq!(kept, vec!["/dev/ttyUSB0", "/dev/ttyACM0"]);
    }

    #[test]
    fn test_description_fallbacks() {
        let mut usb = port("/dev/ttyUSB0", PortKind::Usb, None);
        usb.vid = Some(0x0403);
        usb.pid = Some(0x6001);
        assert_eq!(usb.description(), "USB serial 0403:6001");

        usb.manufacturer = Some("FTDI".to_string());
        usb.product = Some("FT232R".to_string());
        assert_eq!(usb.description(), "FT232R (FTDI)");
    }
}
