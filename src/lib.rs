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

//! dummy-operator - reconciles `Dummy` custom resources into nginx pods.
//!
//! This library provides:
//! - The `Dummy` custom resource types
//! - The reconciler and the typed store it runs against
//! - An in-memory store for tests
//! - The controller wiring, manager, health server and configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controller_manager;
pub mod crd;
pub mod error;
pub mod health;
pub mod memory_store;
pub mod reconciler;
pub mod store;

// Re-export commonly used types
pub use config::OperatorConfig;
pub use controller::{Controller, ControllerError, DummyController};
pub use controller_context::{Backoff, ControllerContext};
pub use controller_manager::ControllerManager;
pub use crd::{Dummy, DummySpec, DummyStatus, PodStatus};
pub use error::{Error, Result};
pub use memory_store::MemoryStore;
pub use reconciler::{PodTemplate, ReconcileOutcome, Reconciler};
pub use store::{KubeStore, ObjectKey, Store};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the operator, used in logs.
pub const OPERATOR_NAME: &str = "dummy-operator";
