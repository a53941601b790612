//! Counter key generation.

/// A key that uniquely identifies a rate limit counter.
///
/// The window length is part of the key so that two policies sharing an
/// identifier (e.g. the same email for `login` and `password-reset`) never
/// share a counter unless their windows are identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// Who is being limited: a user ID, IP address, email address, ...
    pub identifier: String,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(identifier: &str, window_ms: u64) -> Self {
        Self {
            identifier: identifier.to_string(),
            window_ms,
        }
    }

    /// Render the key as `identifier:window_ms`.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.identifier, self.window_ms)
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.identifier, self.window_ms)
    }
}
