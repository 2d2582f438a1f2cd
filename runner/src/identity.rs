// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;

use parking_lot::Mutex;

/// Assigns a stable, monotonically numbered identifier to each client, used
/// solely to correlate a request's timing log entries. Has no security role.
#[derive(Default)]
pub struct IdentityTracker {
    counts: Mutex<HashMap<String, u64>>,
}

impl IdentityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `"{client}#{n}"`, where `n` increments every time this client
    /// identity is seen by this process.
    pub fn identify(&self, client: &str) -> String {
        let mut counts = self.counts.lock();
        let count = counts.entry(client.to_string()).or_insert(0);
        *count += 1;
        format!("{client}#{count}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_per_client() {
        let tracker = IdentityTracker::new();
        assert_eq!(tracker.identify("1.2.3.4"), "1.2.3.4#1");
        assert_eq!(tracker.identify("1.2.3.4"), "1.2.3.4#2");
        assert_eq!(tracker.identify("5.6.7.8"), "5.6.7.8#1");
        assert_eq!(tracker.identify("1.2.3.4"), "1.2.3.4#3");
    }
}
