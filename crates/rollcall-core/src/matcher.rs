//! Nearest-neighbour matching of a query descriptor against the gallery.

use crate::descriptor::Descriptor;

/// Maximum Euclidean distance accepted as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// One registered face available for recognition.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub person_id: String,
    pub descriptor: Descriptor,
}

/// The set of registered descriptors a query is compared against.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    skipped: usize,
}

impl Gallery {
    /// Build a gallery from stored `(person_id, descriptor_text)` rows.
    ///
    /// Rows whose descriptor does not parse are logged and left out; one bad
    /// row never prevents the rest from loading.
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut gallery = Self::default();
        for (person_id, text) in rows {
            match Descriptor::parse(&text) {
                Ok(descriptor) => gallery.entries.push(GalleryEntry {
                    person_id,
                    descriptor,
                }),
                Err(err) => {
                    tracing::warn!(
                        person_id = %person_id,
                        error = %err,
                        "skipping unparsable stored descriptor"
                    );
                    gallery.skipped += 1;
                }
            }
        }
        gallery
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of stored rows left out because their descriptor was malformed.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl From<Vec<GalleryEntry>> for Gallery {
    fn from(entries: Vec<GalleryEntry>) -> Self {
        Self {
            entries,
            skipped: 0,
        }
    }
}

/// Result of matching a query against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// ID of the matched person (if any).
    pub person_id: Option<String>,
    /// Distance of the accepted candidate, if one was accepted.
    pub distance: Option<f32>,
    /// `max(0, 1 - distance)` for a match, 0.0 otherwise.
    pub confidence: f32,
    /// Smallest distance seen across the gallery, accepted or not.
    pub nearest_distance: Option<f32>,
}

impl MatchResult {
    fn unknown(nearest_distance: Option<f32>) -> Self {
        Self {
            matched: false,
            person_id: None,
            distance: None,
            confidence: 0.0,
            nearest_distance,
        }
    }
}

/// Map a distance to a confidence score in [0, 1].
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance).max(0.0)
}

/// Strategy for comparing a query descriptor against the gallery.
pub trait Matcher {
    fn compare(&self, query: &Descriptor, gallery: &Gallery) -> MatchResult;
}

/// Euclidean-distance matcher with a fixed acceptance threshold.
///
/// Scans the whole gallery. A candidate is accepted only if it is strictly
/// closer than the best accepted so far and strictly under the threshold.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Descriptor, gallery: &Gallery) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;
        let mut nearest: Option<f32> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            let distance = query.euclidean_distance(&entry.descriptor);
            if nearest.map_or(true, |n| distance < n) {
                nearest = Some(distance);
            }

            let best_distance = best.map_or(f32::INFINITY, |(_, d)| d);
            if distance < best_distance && distance < self.threshold {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) => MatchResult {
                matched: true,
                person_id: Some(gallery.entries()[idx].person_id.clone()),
                distance: Some(distance),
                confidence: confidence_from_distance(distance),
                nearest_distance: nearest,
            },
            None => MatchResult::unknown(nearest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DESCRIPTOR_DIM;

    /// Descriptor at `offset` along axis 0 from the origin.
    fn at(offset: f32) -> Descriptor {
        let mut values = vec![0.0; DESCRIPTOR_DIM];
        values[0] = offset;
        Descriptor::new(values).unwrap()
    }

    fn entry(id: &str, d: Descriptor) -> GalleryEntry {
        GalleryEntry {
            person_id: id.into(),
            descriptor: d,
        }
    }

    #[test]
    fn test_exact_query_matches_with_full_confidence() {
        let gallery = Gallery::from(vec![entry("a", at(0.9)), entry("b", at(0.3))]);
        let result = EuclideanMatcher::default().compare(&at(0.3), &gallery);
        assert!(result.matched);
        assert_eq!(result.person_id.as_deref(), Some("b"));
        assert_eq!(result.distance, Some(0.0));
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_single_candidate_at_045() {
        // "Asha" is the only candidate, 0.45 away.
        let gallery = Gallery::from(vec![entry("asha", at(0.45))]);
        let result = EuclideanMatcher::default().compare(&at(0.0), &gallery);
        assert!(result.matched);
        assert_eq!(result.person_id.as_deref(), Some("asha"));
        assert!((result.confidence - 0.55).abs() < 1e-5);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let gallery = Gallery::from(vec![entry("a", at(0.6)), entry("b", at(0.8))]);
        let result = EuclideanMatcher::default().compare(&at(0.0), &gallery);
        assert!(!result.matched);
        assert_eq!(result.person_id, None);
        assert_eq!(result.confidence, 0.0);
        assert!((result.nearest_distance.unwrap() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_picks_closest_of_several_qualifying() {
        let gallery = Gallery::from(vec![
            entry("far", at(0.5)),
            entry("close", at(0.1)),
            entry("mid", at(0.3)),
        ]);
        let result = EuclideanMatcher::default().compare(&at(0.0), &gallery);
        assert_eq!(result.person_id.as_deref(), Some("close"));
    }

    #[test]
    fn test_tie_keeps_first_seen() {
        let gallery = Gallery::from(vec![entry("first", at(0.2)), entry("second", at(-0.2))]);
        let result = EuclideanMatcher::default().compare(&at(0.0), &gallery);
        assert_eq!(result.person_id.as_deref(), Some("first"));
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let result = EuclideanMatcher::default().compare(&at(0.0), &Gallery::default());
        assert!(!result.matched);
        assert_eq!(result.nearest_distance, None);
    }

    #[test]
    fn test_custom_threshold() {
        let gallery = Gallery::from(vec![entry("a", at(0.45))]);
        let strict = EuclideanMatcher { threshold: 0.4 };
        assert!(!strict.compare(&at(0.0), &gallery).matched);
    }

    #[test]
    fn test_from_rows_skips_malformed() {
        let good = at(0.1).to_json();
        let rows = vec![
            ("a".to_string(), good.clone()),
            ("broken".to_string(), "[1, 2".to_string()),
            ("short".to_string(), "[0.1]".to_string()),
            ("b".to_string(), good),
        ];
        let gallery = Gallery::from_rows(rows);
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.skipped(), 2);
        let ids: Vec<_> = gallery.entries().iter().map(|e| e.person_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn test_confidence_floor() {
        assert_eq!(confidence_from_distance(1.7), 0.0);
    }
}
