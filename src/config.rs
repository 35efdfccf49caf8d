use std::env;

/// The externally supplied configuration bag.
///
/// Command-line parsing is out of scope for the framework; the recognized
/// options arrive through the process environment instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestConfig {
    /// Device name to use, or unset to enumerate all devices
    pub device: Option<String>,
    /// Port number to use, or unset to enumerate all ports
    pub port: Option<u8>,
    /// GID table index to use, or unset to enumerate the GID table
    pub gid_index: Option<u16>,
}

/// Environment variable naming the device.
pub const ENV_DEV: &str = "RDMA_TESTKIT_DEV";
/// Environment variable naming the port.
pub const ENV_PORT: &str = "RDMA_TESTKIT_PORT";
/// Environment variable naming the GID index.
pub const ENV_GID: &str = "RDMA_TESTKIT_GID";

impl TestConfig {
    /// Read the configuration bag from the environment. Unparsable numeric
    /// values are treated as unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            device: env::var(ENV_DEV).ok().filter(|name| !name.is_empty()),
            port: env::var(ENV_PORT).ok().and_then(|raw| raw.parse().ok()),
            gid_index: env::var(ENV_GID).ok().and_then(|raw| raw.parse().ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_all_unset() {
        let cfg = TestConfig::default();
        assert!(cfg.device.is_none());
        assert!(cfg.port.is_none());
        assert!(cfg.gid_index.is_none());
    }
}
