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

//! Dummy custom resource definition.
//!
//! A `Dummy` carries an arbitrary message. The operator echoes the message
//! into the status and runs one nginx pod per `Dummy`, reporting the pod's
//! lifecycle back through `status.podStatus`.

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of a Dummy.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "anynines.interview.com",
    version = "v1",
    kind = "Dummy",
    plural = "dummies",
    shortname = "dmy",
    status = "DummyStatus",
    namespaced,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".spec.message"}"#,
    printcolumn = r#"{"name":"PodStatus","type":"string","jsonPath":".status.podStatus"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DummySpec {
    /// Arbitrary string data
    pub message: String,
}

/// Observed state of a Dummy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DummyStatus {
    /// Last value of `spec.message` copied by the operator
    #[serde(default)]
    pub spec_echo: String,

    /// Lifecycle of the pod owned by this Dummy
    #[serde(default)]
    pub pod_status: PodStatus,
}

/// Lifecycle of the child pod as reported in `status.podStatus`.
///
/// Serialized as `""`, `"Pending"`, `"Running"` or `"Removing"`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum PodStatus {
    /// No pod state observed yet
    #[default]
    #[serde(rename = "")]
    Unknown,
    /// Pod accepted but not yet running
    Pending,
    /// Pod running
    Running,
    /// Pod has a deletion timestamp
    Removing,
}

impl PodStatus {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PodStatus::Unknown => "",
            PodStatus::Pending => "Pending",
            PodStatus::Running => "Running",
            PodStatus::Removing => "Removing",
        }
    }

    /// Returns true if no pod state has been recorded.
    pub fn is_unknown(&self) -> bool {
        matches!(self, PodStatus::Unknown)
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Dummy {
    /// Returns the status, or the empty status if none has been written yet.
    pub fn status_or_default(&self) -> DummyStatus {
        self.status.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_pod_status_wire_format() {
        let status = DummyStatus {
            spec_echo: "hello".to_string(),
            pod_status: PodStatus::Unknown,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["specEcho"], "hello");
        assert_eq!(json["podStatus"], "");

        let parsed: DummyStatus =
            serde_json::from_str(r#"{"specEcho":"x","podStatus":"Removing"}"#).unwrap();
        assert_eq!(parsed.pod_status, PodStatus::Removing);
    }

    #[test]
    fn test_missing_status_fields_default() {
        let parsed: DummyStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, DummyStatus::default());
        assert!(parsed.pod_status.is_unknown());
    }

    #[test]
    fn test_crd_metadata() {
        let crd = Dummy::crd();
        assert_eq!(crd.spec.group, "anynines.interview.com");
        assert_eq!(crd.spec.names.plural, "dummies");
        assert_eq!(crd.spec.names.kind, "Dummy");
        assert_eq!(crd.spec.scope, "Namespaced");

        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1");
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }
}
