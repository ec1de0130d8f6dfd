//! Server Descriptor
//!
//! The proxy server parameters handed out by the registration backend.
//! Field names on the wire follow the backend's JSON (`server_ip`,
//! `auth_password`, `obfs_type`, ...).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Obfuscation parameters, only ever built when both halves are present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Obfuscation<'a> {
    /// Obfuscation scheme (e.g. "salamander")
    pub kind: &'a str,
    /// Shared obfuscation secret
    pub secret: &'a str,
}

/// Proxy server descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Server host (IP literal or hostname)
    #[serde(rename = "server_ip")]
    pub address: String,
    /// Server port
    pub port: u16,
    /// Authentication secret
    #[serde(rename = "auth_password")]
    pub secret: String,
    /// Obfuscation type
    #[serde(rename = "obfs_type", default)]
    pub obfs_type: Option<String>,
    /// Obfuscation secret
    #[serde(rename = "obfs_password", default)]
    pub obfs_secret: Option<String>,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,
    /// Canonical connection URI (informational)
    #[serde(default)]
    pub connection_uri: String,
}

impl ServerDescriptor {
    /// Create a descriptor without obfuscation
    pub fn new(address: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            secret: secret.into(),
            obfs_type: None,
            obfs_secret: None,
            insecure: false,
            connection_uri: String::new(),
        }
    }

    /// Attach obfuscation parameters
    pub fn with_obfuscation(mut self, kind: impl Into<String>, secret: impl Into<String>) -> Self {
        self.obfs_type = Some(kind.into());
        self.obfs_secret = Some(secret.into());
        self
    }

    /// Set the insecure-TLS flag
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Obfuscation parameters, `None` unless both type and secret are set
    pub fn obfuscation(&self) -> Option<Obfuscation<'_>> {
        match (self.obfs_type.as_deref(), self.obfs_secret.as_deref()) {
            (Some(kind), Some(secret)) => Some(Obfuscation { kind, secret }),
            _ => None,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn endpoint(&self) -> String {
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => format!("[{}]:{}", addr, self.port),
            _ => format!("{}:{}", self.address, self.port),
        }
    }

    /// Sanity checks for descriptors coming off the wire
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.address.trim().is_empty() {
            return Err(DescriptorError::MissingAddress);
        }
        if self.port == 0 {
            return Err(DescriptorError::InvalidPort);
        }
        if self.secret.is_empty() {
            return Err(DescriptorError::MissingSecret);
        }
        Ok(())
    }
}

impl std::fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.endpoint())
    }
}

/// Descriptor validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("Server address is empty")]
    MissingAddress,

    #[error("Server port must be in 1-65535")]
    InvalidPort,

    #[error("Server secret is empty")]
    MissingSecret,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let json = r#"{
            "server_ip": "203.0.113.5",
            "port": 443,
            "auth_password": "s3cr3t",
            "obfs_type": null,
            "obfs_password": null,
            "insecure": false,
            "connection_uri": "hysteria2://s3cr3t@203.0.113.5:443"
        }"#;

        let server: ServerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(server.address, "203.0.113.5");
        assert_eq!(server.port, 443);
        assert_eq!(server.secret, "s3cr3t");
        assert!(server.obfuscation().is_none());
        assert!(server.validate().is_ok());
    }

    #[test]
    fn test_partial_obfuscation_is_absent() {
        let mut server = ServerDescriptor::new("203.0.113.5", 443, "s3cr3t");
        server.obfs_type = Some("salamander".into());
        assert!(server.obfuscation().is_none());

        let server = server.with_obfuscation("salamander", "hunter2");
        let obfs = server.obfuscation().unwrap();
        assert_eq!(obfs.kind, "salamander");
        assert_eq!(obfs.secret, "hunter2");
    }

    #[test]
    fn test_endpoint() {
        let v4 = ServerDescriptor::new("203.0.113.5", 443, "x");
        assert_eq!(v4.endpoint(), "203.0.113.5:443");

        let v6 = ServerDescriptor::new("2001:db8::1", 8443, "x");
        assert_eq!(v6.to_string(), "[2001:db8::1]:8443");
    }

    #[test]
    fn test_validate() {
        assert_eq!(
            ServerDescriptor::new("", 443, "x").validate(),
            Err(DescriptorError::MissingAddress)
        );
        assert_eq!(
            ServerDescriptor::new("h", 0, "x").validate(),
            Err(DescriptorError::InvalidPort)
        );
        assert_eq!(
            ServerDescriptor::new("h", 1, "").validate(),
            Err(DescriptorError::MissingSecret)
        );
    }
}
