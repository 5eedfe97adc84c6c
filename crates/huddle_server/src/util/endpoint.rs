#![forbid(unsafe_code)]

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
	#[error("endpoint must be non-empty (expected quic://host:port)")]
	Empty,
	#[error("invalid endpoint (expected quic://host:port): {0}")]
	BadScheme(String),
	#[error("invalid endpoint (no path/query/fragment allowed): {0}")]
	TrailingJunk(String),
	#[error("invalid endpoint host: {0}")]
	BadHost(String),
	#[error("invalid endpoint port (expected 1..=65535): {0}")]
	BadPort(String),
	#[error("host must be an IP literal: {0}")]
	NotIpLiteral(String),
}

/// Parsed `quic://host:port` listen or connect address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicEndpoint {
	pub host: String,
	pub port: u16,
}

impl QuicEndpoint {
	/// `host:port`, IPv6 hosts kept bracketed.
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Resolve to a `SocketAddr`; only IP literals are accepted, since the
	/// server binds rather than dials.
	pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
		self.hostport()
			.parse()
			.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
	}

	pub fn parse(s: &str) -> Result<Self, EndpointError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(EndpointError::Empty);
		}

		let rest = s.strip_prefix("quic://").ok_or_else(|| EndpointError::BadScheme(s.to_string()))?;

		if rest.contains('/') || rest.contains('?') || rest.contains('#') {
			return Err(EndpointError::TrailingJunk(s.to_string()));
		}

		let (host, port_str) = rest.rsplit_once(':').ok_or_else(|| EndpointError::BadPort(s.to_string()))?;

		let host = host.trim();
		if host.is_empty() {
			return Err(EndpointError::BadHost(s.to_string()));
		}

		// IPv6 literals must come bracketed so rsplit found the port separator.
		if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
			return Err(EndpointError::BadHost(s.to_string()));
		}

		let port: u16 = port_str.trim().parse().map_err(|_| EndpointError::BadPort(s.to_string()))?;
		if port == 0 {
			return Err(EndpointError::BadPort(s.to_string()));
		}

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_ipv4_and_ipv6() {
		let e = QuicEndpoint::parse("quic://127.0.0.1:18710").unwrap();
		assert_eq!(e.hostport(), "127.0.0.1:18710");
		assert_eq!(e.socket_addr().unwrap().to_string(), "127.0.0.1:18710");

		let e6 = QuicEndpoint::parse("quic://[::1]:18710").unwrap();
		assert_eq!(e6.hostport(), "[::1]:18710");
		assert_eq!(e6.socket_addr().unwrap().to_string(), "[::1]:18710");
	}

	#[test]
	fn rejects_malformed_endpoints() {
		assert_eq!(QuicEndpoint::parse("  "), Err(EndpointError::Empty));
		assert!(matches!(QuicEndpoint::parse("tcp://1.2.3.4:80"), Err(EndpointError::BadScheme(_))));
		assert!(matches!(
			QuicEndpoint::parse("quic://127.0.0.1:18710/path"),
			Err(EndpointError::TrailingJunk(_))
		));
		assert!(matches!(QuicEndpoint::parse("quic://::1:18710"), Err(EndpointError::BadHost(_))));
		assert!(matches!(QuicEndpoint::parse("quic://127.0.0.1:0"), Err(EndpointError::BadPort(_))));
		assert!(matches!(QuicEndpoint::parse("quic://127.0.0.1"), Err(EndpointError::BadPort(_))));
	}

	#[test]
	fn dns_hosts_parse_but_do_not_bind() {
		let e = QuicEndpoint::parse("quic://huddle.example.com:443").unwrap();
		assert_eq!(e.host, "huddle.example.com");
		assert!(matches!(e.socket_addr(), Err(EndpointError::NotIpLiteral(_))));
	}
}
