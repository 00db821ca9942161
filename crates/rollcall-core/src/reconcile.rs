//! One attendance row per person per day, keeping the best detection.
//!
//! Repeat detections within a day are resolved at write time: the row with
//! the highest confidence wins, and the day's late count is derived from the
//! person's last record before that day, so re-detections never count twice.

/// What to do with an incoming detection given today's existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayDecision {
    /// No row yet for this person today.
    Insert,
    /// Incoming detection beats today's row; overwrite it.
    Replace,
    /// Today's row is at least as confident; drop the incoming detection.
    KeepExisting,
}

impl DayDecision {
    pub fn decide(existing_confidence: Option<f32>, incoming_confidence: f32) -> Self {
        match existing_confidence {
            None => DayDecision::Insert,
            Some(existing) if incoming_confidence > existing => DayDecision::Replace,
            Some(_) => DayDecision::KeepExisting,
        }
    }

    pub fn writes(self) -> bool {
        !matches!(self, DayDecision::KeepExisting)
    }
}

/// Index of the row that survives when collapsing same-day duplicates.
///
/// Highest confidence wins; ties go to the earliest index. `None` for an
/// empty slice.
pub fn survivor(confidences: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &c) in confidences.iter().enumerate() {
        if best.map_or(true, |(_, b)| c > b) {
            best = Some((i, c));
        }
    }
    best.map(|(i, _)| i)
}
