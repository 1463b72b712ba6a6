use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::NetworkError;

/// One published port, `[[hostIP:]hostPort:]containerPort[/proto]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    /// `None` lets the network pick a free port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: String,
}

impl PortMapping {
    pub fn parse(input: &str) -> Result<Self, NetworkError> {
        let invalid = || NetworkError::InvalidPort(input.to_owned());

        let (rest, protocol) = match input.rsplit_once('/') {
            Some((rest, proto)) => (rest, proto.to_ascii_lowercase()),
            None => (input, "tcp".to_owned()),
        };
        if !matches!(protocol.as_str(), "tcp" | "udp" | "sctp") {
            return Err(invalid());
        }

        // An IPv6 host address is written in brackets.
        let (host_ip, rest) = match rest.strip_prefix('[') {
            Some(bracketed) => {
                let (ip, rest) = bracketed.split_once("]:").ok_or_else(invalid)?;
                (Some(ip.parse::<IpAddr>().map_err(|_| invalid())?), rest)
            }
            None => (None, rest),
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let port = |s: &str| match s.parse::<u16>() {
            Ok(p) if p != 0 => Ok(p),
            _ => Err(invalid()),
        };
        let (host_ip, host_port, container_port) = match (host_ip, parts.as_slice()) {
            (None, [container]) => (None, None, port(container)?),
            (_, [host, container]) => {
                let host_port = if host.is_empty() { None } else { Some(port(host)?) };
                (host_ip, host_port, port(container)?)
            }
            (None, [ip, host, container]) => {
                let ip = ip.parse::<IpAddr>().map_err(|_| invalid())?;
                let host_port = if host.is_empty() { None } else { Some(port(host)?) };
                (Some(ip), host_port, port(container)?)
            }
            _ => return Err(invalid()),
        };

        Ok(Self {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }

    /// The mapping in the form accepted by [`PortMapping::parse`].
    pub fn to_spec(&self) -> String {
        let host_port = self.host_port.map(|p| p.to_string()).unwrap_or_default();
        let container = format!("{}/{}", self.container_port, self.protocol);
        match self.host_ip {
            Some(IpAddr::V6(ip)) => format!("[{ip}]:{host_port}:{container}"),
            Some(IpAddr::V4(ip)) => format!("{ip}:{host_port}:{container}"),
            None if self.host_port.is_some() => format!("{host_port}:{container}"),
            None => container,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_ip {
            Some(IpAddr::V6(ip)) => write!(f, "[{ip}]:")?,
            Some(IpAddr::V4(ip)) => write!(f, "{ip}:")?,
            None => write!(f, "0.0.0.0:")?,
        }
        if let Some(port) = self.host_port {
            write!(f, "{port}")?;
        }
        write!(f, "->{}/{}", self.container_port, self.protocol)
    }
}
