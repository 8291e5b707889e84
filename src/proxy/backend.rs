// src/proxy/backend.rs
use crate::config::BackendConfig;
use crate::error::ProxyError;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use url::Url;

/// An upstream endpoint that requests can be forwarded to.
///
/// Everything except the operator-controlled `active` flag is fixed at
/// registration time.
#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub url: Url,
    /// Advisory; round robin ignores it.
    pub weight: u32,
    pub health_check_path: String,
    active: AtomicBool,
}

impl Backend {
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            weight: 1,
            health_check_path: "/".to_string(),
            active: AtomicBool::new(true),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = path.into();
        self
    }

    pub fn with_active(self, active: bool) -> Self {
        self.active.store(active, Ordering::Relaxed);
        self
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, ProxyError> {
        let url = Url::parse(&config.url).map_err(|e| {
            ProxyError::Configuration(format!("backend {}: invalid url {}: {}", config.id, config.url, e))
        })?;

        Ok(Self::new(config.id.clone(), url)
            .with_weight(config.weight)
            .with_health_check_path(config.health_check_path.clone())
            .with_active(config.active))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// `url` with `health_check_path` appended to its path.
    pub fn health_check_url(&self) -> String {
        let base = self.url.as_str().trim_end_matches('/');
        let path = self.health_check_path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    pub(crate) fn validate(&self) -> Result<(), ProxyError> {
        if self.id.trim().is_empty() {
            return Err(ProxyError::Configuration("backend id must not be empty".into()));
        }
        if !matches!(self.url.scheme(), "http" | "https") || self.url.host_str().is_none() {
            return Err(ProxyError::Configuration(format!(
                "backend {}: {} is not an absolute http(s) url",
                self.id, self.url
            )));
        }
        Ok(())
    }

    pub fn info(&self) -> BackendInfo {
        BackendInfo {
            id: self.id.clone(),
            url: self.url.to_string(),
            weight: self.weight,
            is_active: self.is_active(),
            health_check_path: self.health_check_path.clone(),
        }
    }
}

/// Serializable view of a backend for admin listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendInfo {
    pub id: String,
    pub url: String,
    pub weight: u32,
    pub is_active: bool,
    pub health_check_path: String,
}
