use crate::config::{LogFormat, LoggingConfig};
use crate::error::RelayError;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::io::Write;

/// Builds and installs the process logger from an explicit configuration.
/// The level comes from the injected config; `RUST_LOG` still wins when set.
pub fn init(config: &LoggingConfig) -> Result<(), RelayError> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.level.to_string()),
    );

    match config.format {
        LogFormat::Json => {
            builder.format(|buf, record| {
                let timestamp: DateTime<Utc> = Utc::now();
                let entry = json!({
                    "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                    "level": record.level().to_string().to_lowercase(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", entry)
            });
        }
        LogFormat::Text => {
            builder.format(|buf, record| {
                let timestamp: DateTime<Utc> = Utc::now();
                writeln!(
                    buf,
                    "{} [{}] [{}] {}",
                    timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
    }

    builder
        .try_init()
        .map_err(|e| RelayError::Config(format!("Failed to install logger: {}", e)))
}
