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

//! Error types for store access and reconciliation.

use thiserror::Error;

use crate::store::ObjectKey;

/// Errors surfaced by the store and the reconciler.
///
/// Everything but [`Error::Config`] is retryable from the dispatcher's point
/// of view. The reconciler only ever swallows [`Error::NotFound`] for the
/// owner lookup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested object does not exist.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Kind of the missing object.
        kind: &'static str,
        /// Namespace and name of the missing object.
        key: ObjectKey,
    },

    /// A write was rejected because of a stale resource version, or a create
    /// collided with an existing object.
    #[error("conflict on {kind} {key}: {message}")]
    Conflict {
        /// Kind of the object being written.
        kind: &'static str,
        /// Namespace and name of the object being written.
        key: ObjectKey,
        /// Message reported by the store.
        message: String,
    },

    /// The store could not be reached, such as a refused connection or a
    /// timeout.
    #[error("store unavailable: {0}")]
    Transient(String),

    /// Any other Kubernetes API error.
    #[error("kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    /// Serialization of an object failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An object is missing metadata required by the reconciler.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Invalid operator configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classifies a `kube::Error` returned for the object `kind` at `key`.
    ///
    /// HTTP 404 becomes [`Error::NotFound`]; HTTP 409 (both `Conflict` and
    /// `AlreadyExists`) becomes [`Error::Conflict`]. Connection and
    /// transport failures become [`Error::Transient`].
    pub fn from_kube(kind: &'static str, key: &ObjectKey, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound {
                kind,
                key: key.clone(),
            },
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict {
                kind,
                key: key.clone(),
                message: resp.message,
            },
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                Self::Transient(format!("{kind} {key}: {err}"))
            }
            other => Self::Kube(other),
        }
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create an invalid object error with the given message
    pub fn invalid_object(msg: impl Into<String>) -> Self {
        Self::InvalidObject(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns true if the object did not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if a write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if the dispatcher should retry the pass.
    ///
    /// Configuration errors are raised before any controller starts, so they
    /// are the only non-retryable kind.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}

/// Result type for store and reconcile operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from apiserver"),
            reason: reason.to_string(),
            code,
        })
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "test-dummy")
    }

    #[test]
    fn test_not_found_is_classified() {
        let err = Error::from_kube("Pod", &key(), api_error(404, "NotFound"));
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert_eq!(err.to_string(), "Pod default/test-dummy not found");
    }

    #[test]
    fn test_conflict_and_already_exists_are_conflicts() {
        let err = Error::from_kube("Dummy", &key(), api_error(409, "Conflict"));
        assert!(err.is_conflict());

        let err = Error::from_kube("Pod", &key(), api_error(409, "AlreadyExists"));
        assert!(err.is_conflict());
        assert!(err.to_string().contains("AlreadyExists from apiserver"));
    }

    #[test]
    fn test_other_api_errors_stay_opaque() {
        let err = Error::from_kube("Pod", &key(), api_error(500, "InternalError"));
        assert!(matches!(err, Error::Kube(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_only_config_errors_are_terminal() {
        assert!(Error::transient("connection refused").is_retryable());
        assert!(Error::invalid_object("missing uid").is_retryable());
        assert!(!Error::config("concurrency must be positive").is_retryable());
    }

    #[test]
    fn test_transport_failures_are_transient() {
        let err = Error::from_kube("Dummy", &key(), kube::Error::Service("connection refused".into()));
        assert!(matches!(err, Error::Transient(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Dummy default/test-dummy"));
    }
}
