use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the broker connection, the retry/timeout defaults
/// applied to every delivery, and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub delivery: DeliverySettings,
    pub logging: LoggingSettings,
}

/// Where the broker lives and which exchange pair to use.
///
/// The dead-letter exchange is always `<name>.dead`.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub name: String,
    pub connection_timeout_ms: u64,
    /// `0` leaves the consumer prefetch unlimited.
    pub prefetch_count: u16,
}

/// Defaults applied to message headers that do not carry valid values.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct DeliverySettings {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    /// Declare a `dead.<consumer>` queue for each subscription so dead letters
    /// have somewhere to accumulate.
    pub dead_letter_queues: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub connection: Option<PartialConnectionSettings>,
    pub delivery: Option<PartialDeliverySettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialConnectionSettings {
    pub url: Option<String>,
    pub name: Option<String>,
    pub connection_timeout_ms: Option<u64>,
    pub prefetch_count: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialDeliverySettings {
    pub retry_count: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub dead_letter_queues: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            delivery: DeliverySettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost".to_string(),
            name: "retrysub".to_string(),
            connection_timeout_ms: 30_000,
            prefetch_count: 0,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            retry_count: 10,
            retry_delay_ms: 60_000,
            timeout_ms: 60_000,
            dead_letter_queues: true,
        }
    }
}

impl PartialSettings {
    /// Fills every missing field from `Settings::default()`.
    pub fn merge_with_defaults(self) -> Settings {
        let default = Settings::default();
        let connection = self.connection;
        let delivery = self.delivery;
        let logging = self.logging;

        Settings {
            connection: ConnectionSettings {
                url: connection
                    .as_ref()
                    .and_then(|c| c.url.clone())
                    .unwrap_or(default.connection.url),
                name: connection
                    .as_ref()
                    .and_then(|c| c.name.clone())
                    .unwrap_or(default.connection.name),
                connection_timeout_ms: connection
                    .as_ref()
                    .and_then(|c| c.connection_timeout_ms)
                    .unwrap_or(default.connection.connection_timeout_ms),
                prefetch_count: connection
                    .as_ref()
                    .and_then(|c| c.prefetch_count)
                    .unwrap_or(default.connection.prefetch_count),
            },
            delivery: DeliverySettings {
                retry_count: delivery
                    .as_ref()
                    .and_then(|d| d.retry_count)
                    .unwrap_or(default.delivery.retry_count),
                retry_delay_ms: delivery
                    .as_ref()
                    .and_then(|d| d.retry_delay_ms)
                    .unwrap_or(default.delivery.retry_delay_ms),
                timeout_ms: delivery
                    .as_ref()
                    .and_then(|d| d.timeout_ms)
                    .unwrap_or(default.delivery.timeout_ms),
                dead_letter_queues: delivery
                    .as_ref()
                    .and_then(|d| d.dead_letter_queues)
                    .unwrap_or(default.delivery.dead_letter_queues),
            },
            logging: LoggingSettings {
                level: logging
                    .and_then(|l| l.level)
                    .unwrap_or(default.logging.level),
            },
        }
    }
}
