//! Device identity.

use std::fmt;

/// Identity of a managed device: a logical name plus the address it is reached at.
///
/// Two ids are equal only if both name and address match. The `Display`
/// form is just the name, which is what log lines are prefixed with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    name: String,
    host: String,
    port: u16,
}

impl DeviceId {
    /// Create a new device id.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// Logical device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hostname or IP address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// NETCONF port (830 by convention).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` string suitable for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_includes_address() {
        let a = DeviceId::new("dev1", "10.0.0.1", 830);
        let b = DeviceId::new("dev1", "10.0.0.2", 830);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "dev1");
        assert_eq!(a.address(), "10.0.0.1:830");
    }
}
