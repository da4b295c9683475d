// src/core/ports.rs

use thiserror::Error;

pub const SMALL_PORT_LIST: &[u16] = &[80, 443];

pub const MEDIUM_PORT_LIST: &[u16] = &[80, 443, 8000, 8080, 8443];

pub const LARGE_PORT_LIST: &[u16] = &[
    80, 81, 443, 591, 2082, 2087, 2095, 2096, 3000, 8000, 8001, 8008, 8080, 8083, 8443, 8834, 8888,
];

pub const XLARGE_PORT_LIST: &[u16] = &[
    80, 81, 300, 443, 591, 593, 832, 981, 1010, 1311, 2082, 2087, 2095, 2096, 2480, 3000, 3128,
    3333, 4243, 4567, 4711, 4712, 4993, 5000, 5104, 5108, 5800, 6543, 7000, 7396, 7474, 8000, 8001,
    8008, 8014, 8042, 8069, 8080, 8081, 8088, 8090, 8091, 8118, 8123, 8172, 8222, 8243, 8280, 8281,
    8333, 8443, 8500, 8834, 8880, 8888, 8983, 9000, 9043, 9060, 9080, 9090, 9091, 9200, 9443, 9800,
    9981, 12443, 16080, 18091, 18092, 20720, 28017,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortListError {
    #[error("invalid port {0:?}")]
    Invalid(String),
    #[error("port list is empty")]
    Empty,
}

/// Resolves a `--ports` value: one of the aliases or a comma-separated list.
pub fn parse_port_list(list: &str) -> Result<Vec<u16>, PortListError> {
    let ports = match list.trim().to_ascii_lowercase().as_str() {
        "small" => SMALL_PORT_LIST.to_vec(),
        "" | "medium" | "default" => MEDIUM_PORT_LIST.to_vec(),
        "large" => LARGE_PORT_LIST.to_vec(),
        "xlarge" | "huge" => XLARGE_PORT_LIST.to_vec(),
        list => {
            let mut ports = Vec::new();
            for raw in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                match raw.parse::<u16>() {
                    Ok(port) if port > 0 => {
                        if !ports.contains(&port) {
                            ports.push(port);
                        }
                    }
                    _ => return Err(PortListError::Invalid(raw.to_string())),
                }
            }
            ports
        }
    };
    if ports.is_empty() {
        return Err(PortListError::Empty);
    }
    Ok(ports)
}
