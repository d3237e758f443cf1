use serde::Deserialize;
use std::fs::File;

#[derive(Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "fedgate".to_string()
}

#[derive(Deserialize)]
pub struct Config {
    pub metrics: Option<MetricsConfig>,
    pub federator: federator::config::Config,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn test_federator_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            federator:
                listener:
                    host: 0.0.0.0
                    port: 8080
                routing:
                    url: http://localhost/routing/1/query
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let metrics = config.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "fedgate");

        assert_eq!(config.federator.listener.port, 8080);
        assert!(config.federator.validate().is_ok());
    }

    #[test]
    fn test_metrics_section_optional() {
        let yaml = r#"
            federator:
                listener:
                    host: 127.0.0.1
                    port: 8080
                routing:
                    url: http://localhost/routing/1/query
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");
        assert!(config.metrics.is_none());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/fedgate.yml"));
        assert!(matches!(err, Err(ConfigError::LoadError(_))));
    }
}
