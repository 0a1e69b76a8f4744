use super::{Config, ConfigError};
use url::Url;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid endpoint URL '{}': {}", self.endpoint, e))
        })?;

        if self.connection_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Connection timeout must be greater than 0".to_string(),
            ));
        }

        if let Some(key) = &self.override_instrumentation_key
            && key.trim().is_empty()
        {
            return Err(ConfigError::InvalidConfig(
                "Override instrumentation key must not be blank".to_string(),
            ));
        }

        // Limits, transports and profile names live on the merged channel settings.
        self.channel.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processed(mut config: Config) -> Config {
        config.post_process().unwrap();
        config
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(processed(Config::default()).validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let config = processed(Config {
            endpoint: "not a url".to_string(),
            ..Config::default()
        });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn test_rejects_zero_limits_and_unknown_profile() {
        let config = processed(Config {
            max_events_per_batch: 0,
            ..Config::default()
        });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        let config = processed(Config {
            transmit_profile: "SOMETIMES".to_string(),
            ..Config::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("SOMETIMES"));
    }

    #[test]
    fn test_rejects_zero_connection_timeout() {
        let config = processed(Config {
            connection_timeout_secs: 0,
            ..Config::default()
        });
        assert!(config.validate().is_err());
    }
}
