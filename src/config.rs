use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// All configuration, loaded from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Deploy environment name (`development`, `production`, ...).
    /// Reported on `GET /` and used to pick the default log filter.
    pub environment: String,
    pub twilio: TwilioConfig,
    pub elevenlabs: ElevenLabsConfig,
    /// Absolute lifetime cap for a media-stream session.
    pub media_stream_timeout: Duration,
    /// Reconnect budget for the agent WebSocket, per session.
    pub max_agent_retries: u32,
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number: String,
}

#[derive(Debug, Clone)]
pub struct ElevenLabsConfig {
    pub agent_id: String,
    pub api_key: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Any missing required variable or unparseable value is an error;
    /// the caller treats that as fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load .env outside tests to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let twilio = TwilioConfig {
            account_sid: required("TWILIO_ACCOUNT_SID")?,
            auth_token: required("TWILIO_AUTH_TOKEN")?,
            phone_number: required("TWILIO_PHONE_NUMBER")?,
        };

        let elevenlabs = ElevenLabsConfig {
            agent_id: required("ELEVENLABS_AGENT_ID")?,
            api_key: required("ELEVENLABS_API_KEY")?,
        };

        let port = parsed("PORT", 8000u16)?;
        let timeout_ms = parsed("MEDIA_STREAM_TIMEOUT_MS", 300_000u64)?;
        let max_agent_retries = parsed("MAX_ELEVENLABS_RETRIES", 3u32)?;

        let environment =
            std::env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string());

        Ok(Self {
            port,
            environment,
            twilio,
            elevenlabs,
            media_stream_timeout: Duration::from_millis(timeout_ms),
            max_agent_retries,
        })
    }

    /// Default tracing filter, overridable via RUST_LOG.
    pub fn default_log_filter(&self) -> &'static str {
        if self.environment == "development" {
            "call_relay=debug,tower_http=info"
        } else {
            "call_relay=info,tower_http=info"
        }
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env() {
        for name in [
            "TWILIO_ACCOUNT_SID",
            "TWILIO_AUTH_TOKEN",
            "TWILIO_PHONE_NUMBER",
            "ELEVENLABS_AGENT_ID",
            "ELEVENLABS_API_KEY",
            "PORT",
            "MEDIA_STREAM_TIMEOUT_MS",
            "MAX_ELEVENLABS_RETRIES",
            "NODE_ENV",
        ] {
            env::remove_var(name);
        }
    }

    fn set_minimal_env() {
        env::set_var("TWILIO_ACCOUNT_SID", "ACxxxxxxxx");
        env::set_var("TWILIO_AUTH_TOKEN", "token");
        env::set_var("TWILIO_PHONE_NUMBER", "+15550001111");
        env::set_var("ELEVENLABS_AGENT_ID", "agent_1");
        env::set_var("ELEVENLABS_API_KEY", "xi-key");
    }

    #[test]
    #[serial]
    fn minimal_env_uses_defaults() {
        clear_env();
        set_minimal_env();

        let config = Config::from_env().expect("config should load");
        assert_eq!(config.port, 8000);
        assert_eq!(config.environment, "development");
        assert_eq!(config.media_stream_timeout, Duration::from_millis(300_000));
        assert_eq!(config.max_agent_retries, 3);
        assert_eq!(config.twilio.phone_number, "+15550001111");
    }

    #[test]
    #[serial]
    fn missing_required_var_errors() {
        clear_env();
        set_minimal_env();
        env::remove_var("ELEVENLABS_API_KEY");

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(name) => assert_eq!(name, "ELEVENLABS_API_KEY"),
            other => panic!("expected MissingVar, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn empty_required_var_is_missing() {
        clear_env();
        set_minimal_env();
        env::set_var("TWILIO_AUTH_TOKEN", "");

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(name) => assert_eq!(name, "TWILIO_AUTH_TOKEN"),
            other => panic!("expected MissingVar, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn invalid_port_errors() {
        clear_env();
        set_minimal_env();
        env::set_var("PORT", "not-a-port");

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(name, raw) => {
                assert_eq!(name, "PORT");
                assert_eq!(raw, "not-a-port");
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn overrides_are_applied() {
        clear_env();
        set_minimal_env();
        env::set_var("PORT", "9100");
        env::set_var("MEDIA_STREAM_TIMEOUT_MS", "60000");
        env::set_var("MAX_ELEVENLABS_RETRIES", "5");
        env::set_var("NODE_ENV", "production");

        let config = Config::from_env().expect("config should load");
        assert_eq!(config.port, 9100);
        assert_eq!(config.media_stream_timeout, Duration::from_millis(60_000));
        assert_eq!(config.max_agent_retries, 5);
        assert_eq!(config.environment, "production");
        assert_eq!(
            config.default_log_filter(),
            "call_relay=info,tower_http=info"
        );
    }
}
