//! Instrument resource addresses
//!
//! Addresses follow the VISA resource-string shape:
//!
//! | Form | Meaning |
//! |------|---------|
//! | `TCPIP[n]::<host>[::<port>]::SOCKET\|INSTR` | raw SCPI socket, port 5025 by default |
//! | `ASRL<path>[::<baud>]::INSTR` | serial line, 9600 baud by default (`ASRL3` means `COM3`) |
//! | `USB[n]::<device-file>::INSTR` | USBTMC character device (`/dev/usbtmc<n>` when omitted) |
//! | `SIM::<name>::INSTR` | in-process virtual instrument |

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default raw-socket SCPI port
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Default serial line speed
pub const DEFAULT_BAUD: u32 = 9600;

#[derive(Error, Debug, PartialEq)]
pub enum ResourceError {
    #[error("Empty resource string")]
    Empty,

    #[error("Unsupported interface in resource '{0}'")]
    UnsupportedInterface(String),

    #[error("Malformed resource '{resource}': {reason}")]
    Malformed { resource: String, reason: String },
}

/// Interface class of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceClass {
    Tcpip,
    Serial,
    Usb,
    Virtual,
    /// Address that could not be parsed
    Unknown,
}

impl InterfaceClass {
    /// USB and serial adapters commonly drop the first query after opening
    pub fn needs_warmup(&self) -> bool {
        matches!(self, InterfaceClass::Usb | InterfaceClass::Serial)
    }
}

impl fmt::Display for InterfaceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceClass::Tcpip => write!(f, "Ethernet"),
            InterfaceClass::Serial => write!(f, "Serial"),
            InterfaceClass::Usb => write!(f, "USB"),
            InterfaceClass::Virtual => write!(f, "Virtual"),
            InterfaceClass::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Where a resource physically lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Serial { path: String, baud: u32 },
    Usb { device: String },
    Virtual { name: String },
}

/// A parsed instrument address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    address: String,
    endpoint: Endpoint,
}

impl Resource {
    /// Parse a resource string
    pub fn parse(raw: &str) -> Result<Self, ResourceError> {
        let address = clean_for_display(raw);
        if address.is_empty() {
            return Err(ResourceError::Empty);
        }

        let parts: Vec<&str> = address.split("::").collect();
        let head = parts[0];
        let upper = head.to_ascii_uppercase();
        let malformed = |reason: &str| ResourceError::Malformed {
            resource: address.clone(),
            reason: reason.to_string(),
        };

        let endpoint = if upper.starts_with("TCPIP") {
            let host = parts
                .get(1)
                .filter(|h| !h.is_empty())
                .ok_or_else(|| malformed("missing host"))?;
            let port = match parts.get(2) {
                Some(p) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => p
                    .parse::<u16>()
                    .map_err(|_| malformed("port out of range"))?,
                _ => DEFAULT_SCPI_PORT,
            };
            Endpoint::Tcp {
                host: host.to_string(),
                port,
            }
        } else if upper.starts_with("ASRL") {
            let rest = &head[4..];
            if rest.is_empty() {
                return Err(malformed("missing serial port"));
            }
            let path = if rest.chars().all(|c| c.is_ascii_digit()) {
                format!("COM{rest}")
            } else {
                rest.to_string()
            };
            let baud = match parts.get(1) {
                Some(b) if !b.is_empty() && b.chars().all(|c| c.is_ascii_digit()) => b
                    .parse::<u32>()
                    .map_err(|_| malformed("baud out of range"))?,
                _ => DEFAULT_BAUD,
            };
            Endpoint::Serial { path, baud }
        } else if upper.starts_with("USB") {
            let device = match parts.get(1) {
                Some(d) if d.starts_with('/') => d.to_string(),
                _ => {
                    let board = &head[3..];
                    let board = if board.is_empty() { "0" } else { board };
                    format!("/dev/usbtmc{board}")
                }
            };
            Endpoint::Usb { device }
        } else if upper == "SIM" {
            let name = parts
                .get(1)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| malformed("missing instrument name"))?;
            Endpoint::Virtual {
                name: name.to_string(),
            }
        } else {
            return Err(ResourceError::UnsupportedInterface(address));
        };

        Ok(Self { address, endpoint })
    }

    /// The cleaned address string this resource was parsed from
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn interface(&self) -> InterfaceClass {
        match self.endpoint {
            Endpoint::Tcp { .. } => InterfaceClass::Tcpip,
            Endpoint::Serial { .. } => InterfaceClass::Serial,
            Endpoint::Usb { .. } => InterfaceClass::Usb,
            Endpoint::Virtual { .. } => InterfaceClass::Virtual,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Drop non-printable characters and surrounding whitespace
pub fn clean_for_display(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Collapse every run of characters outside `[A-Za-z0-9_-]` into one `_`
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcpip_socket_with_port() {
        let r = Resource::parse("TCPIP0::192.168.1.10::5025::SOCKET").unwrap();
        assert_eq!(
            r.endpoint(),
            &Endpoint::Tcp {
                host: "192.168.1.10".into(),
                port: 5025
            }
        );
        assert_eq!(r.interface(), InterfaceClass::Tcpip);
        assert!(!r.interface().needs_warmup());
    }

    #[test]
    fn test_tcpip_instr_defaults_port() {
        let r = Resource::parse("TCPIP::bench-sa.local::INSTR").unwrap();
        assert_eq!(
            r.endpoint(),
            &Endpoint::Tcp {
                host: "bench-sa.local".into(),
                port: DEFAULT_SCPI_PORT
            }
        );
    }

    #[test]
    fn test_serial_forms() {
        let r = Resource::parse("ASRL/dev/ttyUSB0::115200::INSTR").unwrap();
        assert_eq!(
            r.endpoint(),
            &Endpoint::Serial {
                path: "/dev/ttyUSB0".into(),
                baud: 115200
            }
        );
        assert!(r.interface().needs_warmup());

        let r = Resource::parse("ASRL3::INSTR").unwrap();
        assert_eq!(
            r.endpoint(),
            &Endpoint::Serial {
                path: "COM3".into(),
                baud: DEFAULT_BAUD
            }
        );
    }

    #[test]
    fn test_usb_forms() {
        let r = Resource::parse("USB0::/dev/usbtmc2::INSTR").unwrap();
        assert_eq!(
            r.endpoint(),
            &Endpoint::Usb {
                device: "/dev/usbtmc2".into()
            }
        );

        let r = Resource::parse("USB1::0x0957::0x0607::MY47000419::INSTR").unwrap();
        assert_eq!(
            r.endpoint(),
            &Endpoint::Usb {
                device: "/dev/usbtmc1".into()
            }
        );
        assert!(r.interface().needs_warmup());
    }

    #[test]
    fn test_virtual() {
        let r = Resource::parse("SIM::sa1::INSTR").unwrap();
        assert_eq!(r.interface(), InterfaceClass::Virtual);
    }

    #[test]
    fn test_errors() {
        assert_eq!(Resource::parse("  "), Err(ResourceError::Empty));
        assert!(matches!(
            Resource::parse("GPIB0::22::INSTR"),
            Err(ResourceError::UnsupportedInterface(_))
        ));
        assert!(matches!(
            Resource::parse("TCPIP0::"),
            Err(ResourceError::Malformed { .. })
        ));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(
            sanitize("TCPIP0::192.168.1.10::INSTR"),
            "TCPIP0_192_168_1_10_INSTR"
        );
        assert_eq!(sanitize("ASRL/dev/ttyUSB0::INSTR"), "ASRL_dev_ttyUSB0_INSTR");
    }

    #[test]
    fn test_clean_for_display() {
        assert_eq!(clean_for_display("\u{0}USB0::INSTR\r\n"), "USB0::INSTR");
    }
}
