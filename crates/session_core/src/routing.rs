use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Short-lived map of outbound message id to the target it was sent to.
///
/// Only used to spot delivery receipts that come back for a different
/// address than the one we sent to.
#[derive(Debug)]
pub struct RouteTracker {
    ttl: Duration,
    routes: HashMap<String, (String, Instant)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteCheck {
    Unknown,
    Matches,
    Mismatch { expected: String },
}

impl RouteTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            routes: HashMap::new(),
        }
    }

    pub fn record(&mut self, message_id: impl Into<String>, target: impl Into<String>) {
        self.record_at(message_id.into(), target.into(), Instant::now());
    }

    fn record_at(&mut self, message_id: String, target: String, now: Instant) {
        let ttl = self.ttl;
        self.routes
            .retain(|_, (_, recorded_at)| now.duration_since(*recorded_at) < ttl);
        self.routes.insert(message_id, (target, now));
    }

    pub fn check(&self, message_id: &str, remote_target: &str) -> RouteCheck {
        match self.routes.get(message_id) {
            Some((expected, recorded_at)) if recorded_at.elapsed() < self.ttl => {
                if expected == remote_target {
                    RouteCheck::Matches
                } else {
                    RouteCheck::Mismatch {
                        expected: expected.clone(),
                    }
                }
            }
            _ => RouteCheck::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/routing_tests.rs"]
mod tests;
