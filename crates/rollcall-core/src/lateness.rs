//! Late-arrival policy: cutoff time, running late count, escalation.

use chrono::{NaiveTime, Timelike};

const DEFAULT_CUTOFF_HOUR: u32 = 8;
const DEFAULT_CUTOFF_MINUTE: u32 = 30;
const DEFAULT_ESCALATION_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatePolicy {
    /// Local time of day after which an arrival counts as late.
    pub cutoff: NaiveTime,
    /// A person joins the late-comers roster once their count exceeds this.
    pub escalation_threshold: u32,
}

impl Default for LatePolicy {
    fn default() -> Self {
        Self {
            cutoff: NaiveTime::from_hms_opt(DEFAULT_CUTOFF_HOUR, DEFAULT_CUTOFF_MINUTE, 0)
                .unwrap_or(NaiveTime::MIN),
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
        }
    }
}

impl LatePolicy {
    /// Parse an `HH:MM` cutoff.
    pub fn parse_cutoff(text: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(text.trim(), "%H:%M").ok()
    }

    /// Strictly after the cutoff. Sub-second precision is ignored, so the
    /// whole 08:30:00 second is still on time.
    pub fn is_late(&self, local_time: NaiveTime) -> bool {
        let t = local_time.with_nanosecond(0).unwrap_or(local_time);
        t > self.cutoff
    }

    pub fn next_late_count(&self, prior: u32, is_late: bool) -> u32 {
        if is_late {
            prior.saturating_add(1)
        } else {
            prior
        }
    }

    pub fn escalates(&self, late_count: u32) -> bool {
        late_count > self.escalation_threshold
    }
}
