use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::application::lock_unpoisoned;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CooldownDecision {
    Accepted,
    BelowThreshold,
    CoolingDown { remaining: Duration },
}

/// Per-class "last accepted" timestamps. Check and update happen under one lock,
/// so two callers can never both pass for the same class.
#[derive(Default)]
pub struct CooldownGate {
    last_accepted: Mutex<HashMap<String, Instant>>,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(
        &self,
        class: &str,
        confidence: f32,
        threshold: f32,
        interval: Duration,
        now: Instant,
    ) -> CooldownDecision {
        // strictly greater; NaN never passes
        if !(confidence > threshold) {
            return CooldownDecision::BelowThreshold;
        }
        let mut last = lock_unpoisoned(&self.last_accepted);
        if let Some(previous) = last.get(class) {
            let elapsed = now.saturating_duration_since(*previous);
            if elapsed < interval {
                return CooldownDecision::CoolingDown {
                    remaining: interval - elapsed,
                };
            }
        }
        last.insert(class.to_string(), now);
        CooldownDecision::Accepted
    }
}
