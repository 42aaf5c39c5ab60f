//! The seam between the core and user scenarios.
//!
//! Scenario specs are opaque strings; an injected [`ScenarioResolver`]
//! turns a spec into a [`Scenario`] plus the journey functions to run.  How
//! the embedding binary builds that mapping (a registry of builtins, config
//! files, anything else) is its own business.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use stampede_error::{ErrorCodes, StampedeError};
use stampede_types::Scenario;
use thiserror::Error;

use crate::context::Context;

/// Why a single request execution failed; `kind` becomes the `error` label
/// on `journey_failures_total`.
#[derive(Clone, Debug, PartialEq)]
pub struct JourneyError {
    pub kind: String,
    pub message: String,
}

impl JourneyError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        JourneyError {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JourneyError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for JourneyError {}

pub type JourneyFuture = BoxFuture<'static, Result<(), JourneyError>>;

/// One request execution: runs inside a fresh [`Context`], optionally with
/// the next datapool item.
pub type JourneyFn = Arc<dyn Fn(Context, Option<String>) -> JourneyFuture + Send + Sync>;

/// A resolved scenario: the schedule plus a journey function per journey
/// spec it names.
#[derive(Clone)]
pub struct ResolvedScenario {
    pub scenario: Scenario,
    pub journeys: HashMap<String, JourneyFn>,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("unknown scenario spec {0:?}")]
    UnknownSpec(String),
    #[error("invalid scenario spec {spec:?}: {reason}")]
    Invalid { spec: String, reason: String },
}

impl StampedeError for ResolveError {
    fn code(&self) -> ErrorCodes {
        match self {
            ResolveError::UnknownSpec(_) => ErrorCodes::NotFound,
            ResolveError::Invalid { .. } => ErrorCodes::InvalidArgument,
        }
    }
}

pub trait ScenarioResolver: Send + Sync {
    fn resolve(&self, spec: &str) -> Result<ResolvedScenario, ResolveError>;
}
