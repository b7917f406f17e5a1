use std::time::Duration;

use clap::Parser;
use sensor_database::DatabaseConfig;
use uuid::Uuid;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTTS_PORT: u16 = 8883;
/// Kept short so generated ids stay within the 23 characters every broker accepts.
const CLIENT_ID_PREFIX: &str = "sensor_bridge_";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("UnsupportedScheme({})", .0)]
    UnsupportedScheme(String),
    #[error("MissingHost({})", .0)]
    MissingHost(String),
    #[error("InvalidPort({})", .0)]
    InvalidPort(String),
}

/// Bridges sensor readings from an MQTT broker into MySQL.
///
/// Every option can also be set through the environment or a `.env` file.
#[derive(Parser, Debug)]
#[command(name = "sensor_mqtt_bridge", version)]
pub struct Args {
    /// Broker endpoint, e.g. `mqtt://broker.local:1883`
    #[arg(long, env = "MQTT_HOST")]
    pub mqtt_host: String,

    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: String,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: String,

    /// Defaults to a random id, so several bridges can share a broker
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub mqtt_client_id: Option<String>,

    /// Keep-alive interval in seconds
    #[arg(long, default_value_t = 60)]
    pub mqtt_keep_alive: u64,

    /// MySQL server, `host` or `host:port`
    #[arg(long, env = "MYSQL_HOST")]
    pub mysql_host: String,

    #[arg(long, env = "MYSQL_USERNAME")]
    pub mysql_username: String,

    #[arg(long, env = "MYSQL_PASSWORD", hide_env_values = true)]
    pub mysql_password: String,

    /// Maximum number of pooled MySQL connections
    #[arg(
        long,
        default_value_t = sensor_database::DEFAULT_MAX_CONNECTIONS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub pool_size: u32,

    /// Seconds a write waits for a pooled connection
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub pool_timeout: u64,

    /// Messages buffered between the broker and the writers
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
    pub queue_capacity: u32,

    /// HTTP listen port
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,
}

impl Args {
    pub fn broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        Ok(BrokerConfig {
            endpoint: BrokerEndpoint::parse(&self.mqtt_host)?,
            client_id: self
                .mqtt_client_id
                .clone()
                .unwrap_or_else(generated_client_id),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            keep_alive: Duration::from_secs(self.mqtt_keep_alive),
        })
    }

    pub fn database_config(&self) -> DatabaseConfig {
        let mut config = DatabaseConfig::new(
            self.mysql_host.as_str(),
            self.mysql_username.as_str(),
            self.mysql_password.as_str(),
        );
        config.max_connections = self.pool_size;
        config.connection_timeout = Duration::from_secs(self.pool_timeout);
        config
    }
}

fn generated_client_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}", CLIENT_ID_PREFIX, &suffix[..8])
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Accepts `mqtt://`, `tcp://`, `mqtts://` and `ssl://` URLs, or a bare `host[:port]`.
    pub fn parse(endpoint: &str) -> Result<Self, ConfigError> {
        let (tls, rest) = match endpoint.split_once("://") {
            Some(("mqtt" | "tcp", rest)) => (false, rest),
            Some(("mqtts" | "ssl", rest)) => (true, rest),
            Some((scheme, _)) => return Err(ConfigError::UnsupportedScheme(scheme.to_string())),
            None => (false, endpoint),
        };
        let authority = rest.split('/').next().unwrap_or_default();
        let default_port = if tls { DEFAULT_MQTTS_PORT } else { DEFAULT_MQTT_PORT };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidPort(endpoint.to_string()))?;
                (host, port)
            }
            None => (authority, default_port),
        };

        if host.is_empty() {
            return Err(ConfigError::MissingHost(endpoint.to_string()));
        }

        Ok(Self { host: host.to_string(), port, tls })
    }
}

#[derive(Clone)]
pub struct BrokerConfig {
    pub endpoint: BrokerEndpoint,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
}
