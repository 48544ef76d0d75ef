// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration structures for the operator.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reconciler::{PodTemplate, DEFAULT_CONTAINER_PORT, DEFAULT_POD_IMAGE, DEFAULT_PORT_NAME};

/// Main configuration for the dummy operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Process-wide settings.
    #[serde(default)]
    pub generic: GenericConfig,

    /// Shape of the pods created for Dummies.
    #[serde(default)]
    pub pod: PodConfig,

    /// Retry backoff for failed reconciliations.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl OperatorConfig {
    /// Checks the configuration for values the operator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.generic.concurrent_dummy_syncs == 0 {
            return Err(Error::config("concurrentDummySyncs must be at least 1"));
        }
        if self.pod.image.trim().is_empty() {
            return Err(Error::config("pod image must not be empty"));
        }
        if !(1..=65535).contains(&self.pod.container_port) {
            return Err(Error::config(format!(
                "pod containerPort {} is outside 1..=65535",
                self.pod.container_port
            )));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(Error::config(format!(
                "backoff baseDelay {} exceeds maxDelay {}",
                humantime::format_duration(self.backoff.base_delay),
                humantime::format_duration(self.backoff.max_delay)
            )));
        }
        Ok(())
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Namespace to watch. All namespaces when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Address of the health server.
    #[serde(default = "default_healthz_bind_address")]
    pub healthz_bind_address: String,

    /// Port of the health server.
    #[serde(default = "default_healthz_bind_port")]
    pub healthz_bind_port: u16,

    /// Number of Dummies reconciled in parallel.
    #[serde(default = "default_concurrent_dummy_syncs")]
    pub concurrent_dummy_syncs: u16,

    /// How long to wait for controllers to stop on shutdown.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GenericConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            namespace: None,
            healthz_bind_address: default_healthz_bind_address(),
            healthz_bind_port: default_healthz_bind_port(),
            concurrent_dummy_syncs: default_concurrent_dummy_syncs(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_healthz_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_bind_port() -> u16 {
    8081
}

fn default_concurrent_dummy_syncs() -> u16 {
    5
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Pod template settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    /// Container image.
    #[serde(default = "default_image")]
    pub image: String,

    /// Name of the container port.
    #[serde(default = "default_port_name")]
    pub port_name: String,

    /// Container port number.
    #[serde(default = "default_container_port")]
    pub container_port: i32,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            port_name: default_port_name(),
            container_port: default_container_port(),
        }
    }
}

impl From<&PodConfig> for PodTemplate {
    fn from(config: &PodConfig) -> Self {
        PodTemplate {
            image: config.image.clone(),
            port_name: config.port_name.clone(),
            container_port: config.container_port,
        }
    }
}

fn default_image() -> String {
    DEFAULT_POD_IMAGE.to_string()
}

fn default_port_name() -> String {
    DEFAULT_PORT_NAME.to_string()
}

fn default_container_port() -> i32 {
    DEFAULT_CONTAINER_PORT
}

/// Retry backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay after the first failure.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for the delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

/// Module for duration serialization/deserialization with human-readable format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OperatorConfig::default();
        assert_eq!(config.generic.concurrent_dummy_syncs, 5);
        assert_eq!(config.generic.healthz_bind_port, 8081);
        assert_eq!(config.pod.image, "nginx:alpine");
        assert_eq!(config.pod.container_port, 80);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let yaml = r#"
generic:
  namespace: dummies
  shutdownTimeout: 1m
pod:
  image: nginx:1.27-alpine
backoff:
  baseDelay: 500ms
  maxDelay: 2m
"#;

        let config: OperatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.generic.namespace.as_deref(), Some("dummies"));
        assert_eq!(config.generic.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(config.generic.concurrent_dummy_syncs, 5);
        assert_eq!(config.pod.image, "nginx:1.27-alpine");
        assert_eq!(config.pod.port_name, "http");
        assert_eq!(config.backoff.base_delay, Duration::from_millis(500));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(120));

        let template = PodTemplate::from(&config.pod);
        assert_eq!(template.image, "nginx:1.27-alpine");
        assert_eq!(template.container_port, 80);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: OperatorConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.backoff.max_delay, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = OperatorConfig::default();
        config.generic.concurrent_dummy_syncs = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = OperatorConfig::default();
        config.pod.image = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.pod.container_port = 70000;
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.backoff.base_delay = Duration::from_secs(600);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds maxDelay"));
    }
}
