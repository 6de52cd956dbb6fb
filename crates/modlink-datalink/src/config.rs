//! Session configuration.

use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Connect, send and receive timeouts shared by every session kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub send: Duration,
    pub receive: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_TIMEOUT,
            send: DEFAULT_TIMEOUT,
            receive: DEFAULT_TIMEOUT,
        }
    }
}

impl Timeouts {
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            connect: timeout,
            send: timeout,
            receive: timeout,
        }
    }

    /// Watchdog wake-up period and minimum spacing between reconnect attempts.
    pub fn reconnect_period(&self) -> Duration {
        self.connect * 2
    }
}

/// Endpoint of a TCP or UDP slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    pub host: String,
    pub port: u16,
    /// Fixed local port a TCP session binds before connecting. UDP ignores it.
    pub local_port: Option<u16>,
    pub timeouts: Timeouts,
    /// MBAP protocol identifier sent and expected back.
    pub protocol_id: u16,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            local_port: None,
            timeouts: Timeouts::default(),
            protocol_id: 0,
        }
    }
}

impl SocketConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_protocol_id(mut self, protocol_id: u16) -> Self {
        self.protocol_id = protocol_id;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(feature = "serial")]
pub use serial_config::SerialConfig;

#[cfg(feature = "serial")]
mod serial_config {
    use super::Timeouts;
    use tokio_serial::{DataBits, FlowControl, Parity, StopBits};

    /// Serial line settings for RTU and ASCII sessions.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SerialConfig {
        pub port_name: String,
        pub baud_rate: u32,
        pub data_bits: DataBits,
        pub parity: Parity,
        pub stop_bits: StopBits,
        pub flow_control: FlowControl,
        pub timeouts: Timeouts,
        /// Upper bound on bytes buffered while waiting for one response.
        pub max_frame_len: usize,
    }

    impl Default for SerialConfig {
        fn default() -> Self {
            Self {
                port_name: "COM2".to_string(),
                baud_rate: 9600,
                data_bits: DataBits::Eight,
                parity: Parity::None,
                stop_bits: StopBits::One,
                flow_control: FlowControl::None,
                timeouts: Timeouts::default(),
                max_frame_len: 520,
            }
        }
    }

    impl SerialConfig {
        pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                port_name: port_name.into(),
                baud_rate,
                ..Self::default()
            }
        }

        pub fn with_parity(mut self, parity: Parity) -> Self {
            self.parity = parity;
            self
        }

        pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
            self.timeouts = timeouts;
            self
        }
    }
}
