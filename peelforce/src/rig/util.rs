//! Serial port discovery.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("Failed to enumerate available serial ports")]
    EnumerationFailed(#[from] serialport::Error),

    #[error("Could not automatically find a rig")]
    AutoDetectionFailed,

    #[error("Found {0} possible rigs; please specify a port explicitly")]
    MultipleRigsFound(usize),
}

/// USB serial bridges commonly found on the rig's microcontroller board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigPortInterface {
    Arduino,
    CH340,
    CP210x,
    FTDI,
    Unknown(u16, u16),
    /// Not a USB port: on-board UART, PCI card, Bluetooth.
    NonUsb,
}

impl RigPortInterface {
    pub fn from_usb_ids(vid: u16, pid: u16) -> RigPortInterface {
        match (vid, pid) {
            (0x2341, _) | (0x2a03, _) => RigPortInterface::Arduino,
            (0x1a86, 0x7523) => RigPortInterface::CH340,
            (0x10c4, 0xea60) => RigPortInterface::CP210x,
            (0x0403, 0x6001) | (0x0403, 0x6015) => RigPortInterface::FTDI,
            (vid, pid) => RigPortInterface::Unknown(vid, pid),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, RigPortInterface::Unknown(..) | RigPortInterface::NonUsb)
    }
}

#[derive(Debug, Clone)]
pub struct SerialDevice {
    pub port: String,
    pub ifc: RigPortInterface,
    pub description: Option<String>,
    /// Hardware identification, e.g. `USB VID:PID=2341:0043 SER=7573`.
    pub hwid: String,
}

/// Lists serial ports. Unless `all` is set, only ports behind a known
/// USB bridge are returned.
pub fn enum_devices(all: bool) -> Result<Vec<SerialDevice>, DetectError> {
    let mut avail_ports = serialport::available_ports()?;
    avail_ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    Ok(avail_ports.iter().filter_map(|p| describe(p, all)).collect())
}

fn describe(p: &serialport::SerialPortInfo, all: bool) -> Option<SerialDevice> {
    use serialport::SerialPortType;

    let (ifc, description, hwid) = match &p.port_type {
        SerialPortType::UsbPort(info) => {
            let mut hwid = format!("USB VID:PID={:04x}:{:04x}", info.vid, info.pid);
            if let Some(serial) = &info.serial_number {
                hwid.push_str(&format!(" SER={}", serial));
            }
            (
                RigPortInterface::from_usb_ids(info.vid, info.pid),
                info.product.clone(),
                hwid,
            )
        }
        SerialPortType::PciPort => (RigPortInterface::NonUsb, None, "PCI".to_string()),
        SerialPortType::BluetoothPort => (RigPortInterface::NonUsb, None, "Bluetooth".to_string()),
        SerialPortType::Unknown => (RigPortInterface::NonUsb, None, "n/a".to_string()),
    };
    if !all {
        if !ifc.is_known() {
            return None;
        }
        #[cfg(target_os = "macos")]
        if p.port_name.starts_with("/dev/tty.") {
            return None;
        }
    }
    Some(SerialDevice {
        port: p.port_name.clone(),
        ifc,
        description,
        hwid,
    })
}

/// Returns the port name of the only rig-like device attached.
pub fn auto_detect_rig() -> Result<String, DetectError> {
    pick_single(enum_devices(false)?)
}

fn pick_single(devices: Vec<SerialDevice>) -> Result<String, DetectError> {
    let mut ports: Vec<String> = devices
        .into_iter()
        .filter(|dev| dev.ifc.is_known())
        .map(|dev| dev.port)
        .collect();

    match ports.len() {
        0 => Err(DetectError::AutoDetectionFailed),
        1 => Ok(ports.remove(0)),
        n => Err(DetectError::MultipleRigsFound(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(port: &str, vid: u16, pid: u16) -> SerialDevice {
        SerialDevice {
            port: port.to_string(),
            ifc: RigPortInterface::from_usb_ids(vid, pid),
            description: None,
            hwid: String::new(),
        }
    }

    #[test]
    fn classifies_bridges() {
        assert_eq!(RigPortInterface::from_usb_ids(0x2341, 0x0043), RigPortInterface::Arduino);
        assert_eq!(RigPortInterface::from_usb_ids(0x1a86, 0x7523), RigPortInterface::CH340);
        assert!(!RigPortInterface::from_usb_ids(0x1234, 0x5678).is_known());
    }

    #[test]
    fn non_usb_ports_are_listed_only_with_all() {
        let uart = serialport::SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: serialport::SerialPortType::Unknown,
        };
        let pci = serialport::SerialPortInfo {
            port_name: "/dev/ttyS4".to_string(),
            port_type: serialport::SerialPortType::PciPort,
        };
        assert!(describe(&uart, false).is_none());
        let listed = describe(&pci, true).unwrap();
        assert_eq!(listed.port, "/dev/ttyS4");
        assert_eq!(listed.ifc, RigPortInterface::NonUsb);
        assert_eq!(listed.hwid, "PCI");
        assert!(describe(&uart, true).is_some());
        assert!(matches!(
            pick_single(vec![SerialDevice {
                port: "/dev/ttyS0".to_string(),
                ifc: RigPortInterface::NonUsb,
                description: None,
                hwid: "n/a".to_string(),
            }]),
            Err(DetectError::AutoDetectionFailed)
        ));
    }

    #[test]
    fn single_known_device_is_picked() {
        let found = pick_single(vec![dev("/dev/ttyUSB9", 0x1234, 1), dev("/dev/ttyACM0", 0x2341, 0x43)]);
        assert_eq!(found.unwrap(), "/dev/ttyACM0");
        assert!(matches!(pick_single(vec![]), Err(DetectError::AutoDetectionFailed)));
        assert!(matches!(
            pick_single(vec![dev("a", 0x2341, 1), dev("b", 0x0403, 0x6001)]),
            Err(DetectError::MultipleRigsFound(2))
        ));
    }
}
