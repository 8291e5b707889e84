// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a file (YAML or JSON)
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<ProxyConfig> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let config = parse_config(&contents, path)?;
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str, path: &Path) -> Result<ProxyConfig> {
    let is_yaml = matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    );

    let config = if is_yaml {
        serde_yaml::from_str(contents).context("Failed to parse YAML config")?
    } else {
        serde_json::from_str(contents).context("Failed to parse JSON config")?
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let yaml = r#"
backends:
  - id: api-1
    url: http://127.0.0.1:9001
  - id: api-2
    url: http://127.0.0.1:9002
    health_check_path: /healthz
retry:
  max_retries: 1
cache:
  enabled: true
"#;
        let config = parse_config(yaml, Path::new("proxy.yaml")).unwrap();
        config.validate().unwrap();

        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].health_check_path, "/");
        assert_eq!(config.backends[1].health_check_path, "/healthz");
        assert!(config.backends[0].active);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.retry_delay_ms, 100);
        assert!(config.cache.enabled);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_parse_json_backoff() {
        let json = r#"{"retry": {"backoff": {"kind": "exponential", "max_delay_ms": 800}}}"#;
        let config = parse_config(json, Path::new("proxy.json")).unwrap();
        assert_eq!(
            config.retry.backoff,
            BackoffKind::Exponential { max_delay_ms: 800 }
        );
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_config("/definitely/not/here.yaml").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
