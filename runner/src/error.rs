// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt;

/// A request-scoped failure. The transport layer surfaces `message` to the
/// caller with `Ok=false` and an HTTP 400; no [`RunError`] is ever fatal to
/// the process.
#[derive(Debug, Clone)]
pub struct RunError {
    pub message: String,
}

impl RunError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RunError {}
