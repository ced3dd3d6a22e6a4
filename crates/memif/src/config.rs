//! Construction-time configuration for a memif connection.

use thiserror::Error;

/// Default bytes per ring slot.
pub const DEFAULT_DATAROOM: u32 = 2048;
/// Default ring size exponent (2^10 = 1024 slots per queue).
pub const DEFAULT_RING_SIZE_LOG2: u8 = 10;
/// Largest accepted ring size exponent.
pub const MAX_RING_SIZE_LOG2: u8 = 14;
/// Largest dataroom a slot length field can describe.
pub const MAX_DATAROOM: u32 = u16::MAX as u32;
/// Longest socket path that fits `sockaddr_un.sun_path` with its NUL.
pub const MAX_SOCKET_PATH_LEN: usize = 107;
/// Most queues a single connection may carry.
pub const MAX_QUEUES: u16 = 255;

/// Which side of the shared-memory link this endpoint plays.
///
/// The master listens on the socket and owns ring sizing; the slave connects
/// to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    /// Map an "is server" flag onto a role: servers are masters.
    pub fn from_is_server(is_server: bool) -> Self {
        if is_server {
            Role::Master
        } else {
            Role::Slave
        }
    }

    #[inline]
    pub fn is_master(self) -> bool {
        matches!(self, Role::Master)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Slave => f.write_str("slave"),
        }
    }
}

/// Configuration errors, detected before any transport call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("socket path is empty")]
    EmptySocketPath,

    #[error("socket path is {len} bytes, limit is {max}")]
    SocketPathTooLong { len: usize, max: usize },

    #[error("dataroom must be between 1 and {max} bytes, got {dataroom}")]
    InvalidDataroom { dataroom: u32, max: u32 },

    #[error("ring size exponent must be between 1 and {max}, got {log2}")]
    InvalidRingSize { log2: u8, max: u8 },

    #[error("queue count must be between 1 and {max}, got {count}")]
    InvalidQueueCount { count: u16, max: u16 },
}

/// Fixed configuration of one interface endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Host socket shared by a set of interfaces.
    pub socket_path: String,

    /// Interface identifier, unique per socket.
    pub interface_id: u32,

    pub role: Role,

    /// Bytes per ring slot.
    pub dataroom: u32,

    /// Each queue ring holds `2^ring_size_log2` slots.
    pub ring_size_log2: u8,

    /// Number of parallel queues per direction.
    pub queue_count: u16,

    /// Application identity announced on the socket.
    pub app_name: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            socket_path: String::from("/run/vpp/memif.sock"),
            interface_id: 0,
            role: Role::Slave,
            dataroom: DEFAULT_DATAROOM,
            ring_size_log2: DEFAULT_RING_SIZE_LOG2,
            queue_count: 1,
            app_name: String::from(env!("CARGO_PKG_NAME")),
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration with the required fields and defaults elsewhere.
    pub fn new(socket_path: impl Into<String>, interface_id: u32, role: Role) -> Self {
        Self {
            socket_path: socket_path.into(),
            interface_id,
            role,
            ..Self::default()
        }
    }

    pub fn with_dataroom(mut self, dataroom: u32) -> Self {
        self.dataroom = dataroom;
        self
    }

    pub fn with_ring_size_log2(mut self, log2: u8) -> Self {
        self.ring_size_log2 = log2;
        self
    }

    pub fn with_queue_count(mut self, count: u16) -> Self {
        self.queue_count = count;
        self
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Slots per queue ring.
    #[inline]
    pub fn ring_capacity(&self) -> u32 {
        1u32 << self.ring_size_log2
    }

    /// Largest payload `send` accepts: strictly below `MAX_SEGMENTS * dataroom`.
    #[inline]
    pub fn max_packet_len(&self) -> usize {
        crate::tx::MAX_SEGMENTS * self.dataroom as usize - 1
    }

    /// Check every field; nothing touches the transport until this passes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.is_empty() {
            return Err(ConfigError::EmptySocketPath);
        }
        if self.socket_path.len() > MAX_SOCKET_PATH_LEN {
            return Err(ConfigError::SocketPathTooLong {
                len: self.socket_path.len(),
                max: MAX_SOCKET_PATH_LEN,
            });
        }
        if self.dataroom == 0 || self.dataroom > MAX_DATAROOM {
            return Err(ConfigError::InvalidDataroom {
                dataroom: self.dataroom,
                max: MAX_DATAROOM,
            });
        }
        if self.ring_size_log2 == 0 || self.ring_size_log2 > MAX_RING_SIZE_LOG2 {
            return Err(ConfigError::InvalidRingSize {
                log2: self.ring_size_log2,
                max: MAX_RING_SIZE_LOG2,
            });
        }
        if self.queue_count == 0 || self.queue_count > MAX_QUEUES {
            return Err(ConfigError::InvalidQueueCount {
                count: self.queue_count,
                max: MAX_QUEUES,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::new("/tmp/memif.sock", 7, Role::Master);
        assert_eq!(config.dataroom, 2048);
        assert_eq!(config.ring_size_log2, 10);
        assert_eq!(config.ring_capacity(), 1024);
        assert_eq!(config.queue_count, 1);
        assert_eq!(config.max_packet_len(), 8 * 2048 - 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_role_from_is_server() {
        assert_eq!(Role::from_is_server(true), Role::Master);
        assert_eq!(Role::from_is_server(false), Role::Slave);
        assert!(Role::Master.is_master());
        assert!(!Role::Slave.is_master());
    }

    #[test]
    fn test_socket_path_limits() {
        let empty = ConnectionConfig::new("", 0, Role::Slave);
        assert_eq!(empty.validate(), Err(ConfigError::EmptySocketPath));

        let long = ConnectionConfig::new("x".repeat(MAX_SOCKET_PATH_LEN + 1), 0, Role::Slave);
        assert!(matches!(
            long.validate(),
            Err(ConfigError::SocketPathTooLong { len: 108, max: 107 })
        ));

        let exact = ConnectionConfig::new("x".repeat(MAX_SOCKET_PATH_LEN), 0, Role::Slave);
        exact.validate().unwrap();
    }

    #[test]
    fn test_numeric_limits() {
        let base = ConnectionConfig::new("/tmp/m.sock", 0, Role::Slave);

        assert!(matches!(
            base.clone().with_dataroom(0).validate(),
            Err(ConfigError::InvalidDataroom { .. })
        ));
        assert!(matches!(
            base.clone().with_dataroom(70_000).validate(),
            Err(ConfigError::InvalidDataroom { .. })
        ));
        assert!(matches!(
            base.clone().with_ring_size_log2(0).validate(),
            Err(ConfigError::InvalidRingSize { .. })
        ));
        assert!(matches!(
            base.clone().with_ring_size_log2(15).validate(),
            Err(ConfigError::InvalidRingSize { .. })
        ));
        assert!(matches!(
            base.clone().with_queue_count(0).validate(),
            Err(ConfigError::InvalidQueueCount { .. })
        ));
        base.with_dataroom(200).with_ring_size_log2(4).validate().unwrap();
    }
}
