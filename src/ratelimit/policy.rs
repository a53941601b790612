//! Rate limit policies and the catalog that resolves them by name.
//!
//! A policy is a named `{limit, window}` pair applied to one category of
//! sensitive operation. The catalog ships with built-in policies for the
//! authentication flows and can be extended or overridden from YAML:
//!
//! ```yaml
//! policies:
//!   login:
//!     limit: 5
//!     window_ms: 900000
//!   invite:
//!     limit: 20
//!     window_ms: 86400000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Policy applied to login attempts.
pub const LOGIN: &str = "login";
/// Policy applied to account sign-ups.
pub const SIGNUP: &str = "signup";
/// Policy applied to password reset requests.
pub const PASSWORD_RESET: &str = "password-reset";

/// Policies that must resolve before the limiter starts serving checks.
pub const REQUIRED_POLICIES: [&str; 3] = [LOGIN, SIGNUP, PASSWORD_RESET];

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// A limit and the fixed window it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum requests allowed per window
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub const fn new(limit: u64, window_ms: u64) -> Self {
        Self { limit, window_ms }
    }

    /// Build a config from a [`Duration`] window.
    pub fn per(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.limit == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}' must have a positive limit",
                name
            )));
        }
        if self.window_ms == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}' must have a positive window",
                name
            )));
        }
        Ok(())
    }
}

/// Static mapping from policy name to [`RateLimitConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyCatalog {
    #[serde(default)]
    policies: BTreeMap<String, RateLimitConfig>,
}

impl Default for PolicyCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PolicyCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    /// The built-in authentication policies.
    pub fn builtin() -> Self {
        Self::new()
            .with_policy(LOGIN, RateLimitConfig::new(5, 15 * MINUTE_MS))
            .with_policy(SIGNUP, RateLimitConfig::new(3, HOUR_MS))
            .with_policy(PASSWORD_RESET, RateLimitConfig::new(3, HOUR_MS))
    }

    /// Add or replace a policy.
    pub fn with_policy(mut self, name: &str, config: RateLimitConfig) -> Self {
        self.policies.insert(name.to_string(), config);
        self
    }

    /// Built-in policies, overridden by the file at `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin();
        if let Some(path) = path {
            catalog.merge(Self::from_file(path)?);
        }
        Ok(catalog)
    }

    /// Load a catalog from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a catalog from a YAML string.
    ///
    /// Accepts either a bare `name -> {limit, window_ms}` map or a document
    /// with a top-level `policies` key.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(policies) = serde_yaml::from_str::<BTreeMap<String, RateLimitConfig>>(yaml) {
            return Ok(Self { policies });
        }

        serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::Config(format!("Failed to parse rate limit policies: {}", e))
        })
    }

    /// Overlay `other` on top of this catalog.
    pub fn merge(&mut self, other: PolicyCatalog) {
        self.policies.extend(other.policies);
    }

    /// Check that every required policy exists and every policy is usable.
    ///
    /// Meant to run once at startup; a failure here is fatal.
    pub fn validate(&self, required: &[&str]) -> Result<()> {
        for name in required {
            if !self.policies.contains_key(*name) {
                return Err(TollgateError::Config(format!(
                    "missing required rate limit policy '{}'",
                    name
                )));
            }
        }
        for (name, config) in &self.policies {
            config.validate(name)?;
        }
        Ok(())
    }

    /// Look up a policy.
    pub fn get(&self, name: &str) -> Option<&RateLimitConfig> {
        self.policies.get(name)
    }

    /// Look up a policy, treating an unknown name as an error.
    pub fn resolve(&self, name: &str) -> Result<&RateLimitConfig> {
        self.get(name)
            .ok_or_else(|| TollgateError::UnknownPolicy(name.to_string()))
    }

    /// Policy names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
