//! rollcall-core: attendance decision logic.
//!
//! Matches query face descriptors against the registered gallery, decides
//! lateness, and resolves same-day repeat detections down to a single
//! record per person. Face detection and descriptor extraction happen
//! outside this crate; only their numeric output is consumed here.

pub mod descriptor;
pub mod lateness;
pub mod matcher;
pub mod reconcile;
pub mod records;

pub use descriptor::{Descriptor, DescriptorError, DESCRIPTOR_DIM};
pub use lateness::LatePolicy;
pub use matcher::{EuclideanMatcher, Gallery, GalleryEntry, MatchResult, Matcher};
pub use reconcile::DayDecision;
pub use records::{AttendanceRecord, LateComer, Person, PersonInfo, RecordFilter, RecordStats};
