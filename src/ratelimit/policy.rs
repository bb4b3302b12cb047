//! Rate limit policies and their configuration format.
//!
//! A [`Policy`] is the immutable description of how one protected operation
//! is limited. Policies are usually built from [`PolicyRule`] entries in a
//! YAML document and collected into a [`PolicySet`] keyed by name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::key::KeyMode;
use crate::error::{Result, TurnstileError};

/// Limits applied to one protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    max_requests: u64,
    window: Duration,
    redirect_target: Option<String>,
    mode: KeyMode,
    scope: Option<String>,
}

impl Policy {
    /// Create a policy allowing `max_requests` per `window`, keyed by address.
    ///
    /// Both values must be non-zero.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self> {
        if max_requests == 0 {
            return Err(TurnstileError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "window must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            max_requests,
            window,
            redirect_target: None,
            mode: KeyMode::default(),
            scope: None,
        })
    }

    /// Send denied requests to `target` instead of a plain rejection.
    pub fn with_redirect(mut self, target: impl Into<String>) -> Self {
        self.redirect_target = Some(target.into());
        self
    }

    /// Partition quota by `mode`.
    pub fn with_mode(mut self, mode: KeyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Namespace this policy's counters so they are not shared with other
    /// policies using the same store.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect_target.as_deref()
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

/// A policy as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Number of requests allowed per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Where denied requests should be sent
    #[serde(default)]
    pub redirect_target: Option<String>,
    /// Key mode name, `by_address` when omitted
    #[serde(default)]
    pub mode: Option<String>,
    /// Counter namespace
    #[serde(default)]
    pub scope: Option<String>,
}

impl PolicyRule {
    /// Validate this rule into a [`Policy`].
    pub fn to_policy(&self) -> Result<Policy> {
        let mut policy = Policy::new(self.max_requests, Duration::from_secs(self.window_secs))?;

        if let Some(ref mode) = self.mode {
            policy = policy.with_mode(mode.parse()?);
        }
        if let Some(ref target) = self.redirect_target {
            policy = policy.with_redirect(target.clone());
        }
        if let Some(ref scope) = self.scope {
            policy = policy.with_scope(scope.clone());
        }

        Ok(policy)
    }
}

#[derive(Debug, Deserialize)]
struct PolicyDocument {
    policies: HashMap<String, PolicyRule>,
}

/// Named policies. Names are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    policies: HashMap<String, Policy>,
}

impl PolicySet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a map of rules into a set.
    pub fn from_rules(rules: &HashMap<String, PolicyRule>) -> Result<Self> {
        let mut set = Self::new();
        for (name, rule) in rules {
            let policy = rule
                .to_policy()
                .map_err(|e| TurnstileError::Config(format!("policy '{}': {}", name, e)))?;
            set.insert(name, policy);
        }
        Ok(set)
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    ///
    /// Accepts either a document with a top-level `policies` map or the bare
    /// map itself.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(document) = serde_yaml::from_str::<PolicyDocument>(yaml) {
            return Self::from_rules(&document.policies);
        }

        let rules: HashMap<String, PolicyRule> = serde_yaml::from_str(yaml).map_err(|e| {
            TurnstileError::Config(format!("Failed to parse rate limit policies: {}", e))
        })?;
        Self::from_rules(&rules)
    }

    /// Add or replace a named policy.
    pub fn insert(&mut self, name: &str, policy: Policy) -> Option<Policy> {
        self.policies.insert(name.to_ascii_lowercase(), policy)
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.get(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Iterate over policy names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}
