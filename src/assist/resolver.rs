//! Strategies mapping raw assistive input onto a candidate name.

/// The outcome of matching raw input against the ballot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Exactly one candidate, with its name as written on the ballot.
    Match(String),
    /// Several candidates fit equally well.
    Ambiguous(Vec<String>),
    NoMatch,
}

/// Resolve raw input (a transcript, a gesture label) to one candidate.
pub trait CandidateResolver: Send + Sync {
    fn resolve(&self, raw: &str, candidates: &[String]) -> Resolution;
}

/// Minimum similarity for a spoken name to count as a match.
pub const SPEECH_THRESHOLD: f64 = 0.6;

/// Fuzzy matching of a transcript against candidate names.
///
/// Both sides are trimmed and lower-cased, then scored by normalised
/// Levenshtein similarity.
#[derive(Debug, Clone, Copy)]
pub struct SpeechResolver {
    threshold: f64,
}

impl Default for SpeechResolver {
    fn default() -> Self {
        Self {
            threshold: SPEECH_THRESHOLD,
        }
    }
}

impl SpeechResolver {
    pub const fn with_threshold(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl CandidateResolver for SpeechResolver {
    fn resolve(&self, raw: &str, candidates: &[String]) -> Resolution {
        let spoken = raw.trim().to_lowercase();
        if spoken.is_empty() {
            return Resolution::NoMatch;
        }

        let mut best_score = f64::MIN;
        let mut best: Vec<&String> = Vec::new();
        for candidate in candidates {
            let target = candidate.trim().to_lowercase();
            let score = similarity(&spoken, &target);
            if score > best_score {
                best_score = score;
                best.clear();
                best.push(candidate);
            } else if score == best_score {
                best.push(candidate);
            }
        }

        if best.is_empty() || best_score < self.threshold {
            return Resolution::NoMatch;
        }
        match best.as_slice() {
            [only] => Resolution::Match(only.to_string()),
            tied => Resolution::Ambiguous(tied.iter().map(|c| c.to_string()).collect()),
        }
    }
}

/// `1 - distance / longer length`, so identical strings score 1 and
/// entirely different ones 0.
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

/// Gesture labels reported by the recogniser, in code order.
const GESTURE_WORDS: [&str; 10] = [
    "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
];

/// Read a 1-based gesture code from a digit string or a number word.
pub fn gesture_code(raw: &str) -> Option<usize> {
    let raw = raw.trim().to_lowercase();
    if let Ok(code) = raw.parse::<usize>() {
        return Some(code);
    }
    GESTURE_WORDS
        .iter()
        .position(|word| *word == raw)
        .map(|index| index + 1)
}

/// Maps a 1-based gesture code to the candidate at that position.
#[derive(Debug, Default, Clone, Copy)]
pub struct GestureResolver;

impl CandidateResolver for GestureResolver {
    fn resolve(&self, raw: &str, candidates: &[String]) -> Resolution {
        match gesture_code(raw) {
            Some(code) if code >= 1 => candidates
                .get(code - 1)
                .map(|c| Resolution::Match(c.clone()))
                .unwrap_or(Resolution::NoMatch),
            _ => Resolution::NoMatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballot(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn misheard_name_recovers_ballot_spelling() {
        let candidates = ballot(&["Alice", "Bob"]);
        let speech = SpeechResolver::default();
        assert_eq!(
            speech.resolve("alise", &candidates),
            Resolution::Match("Alice".into())
        );
        assert_eq!(
            speech.resolve("  BOB ", &candidates),
            Resolution::Match("Bob".into())
        );
        assert_eq!(speech.resolve("zebra", &candidates), Resolution::NoMatch);
        assert_eq!(speech.resolve("", &candidates), Resolution::NoMatch);
    }

    #[test]
    fn ties_are_ambiguous() {
        let candidates = ballot(&["Ann", "Anne", "Bob"]);
        assert_eq!(
            SpeechResolver::default().resolve("anna", &candidates),
            Resolution::Ambiguous(vec!["Ann".into(), "Anne".into()])
        );
    }

    #[test]
    fn threshold_bounds_acceptance() {
        // One edit in five characters scores 0.8.
        let candidates = ballot(&["Alice"]);
        assert_eq!(
            SpeechResolver::with_threshold(0.75).resolve("alise", &candidates),
            Resolution::Match("Alice".into())
        );
        assert_eq!(
            SpeechResolver::with_threshold(0.85).resolve("alise", &candidates),
            Resolution::NoMatch
        );
        // "bop" against "bob" is 0.67, "bxx" is 0.33.
        let candidates = ballot(&["Bob"]);
        assert!(matches!(
            SpeechResolver::default().resolve("bop", &candidates),
            Resolution::Match(_)
        ));
        assert_eq!(
            SpeechResolver::default().resolve("bxx", &candidates),
            Resolution::NoMatch
        );
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("bob", "bob"), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        // Three edits over seven characters.
        assert!((similarity("kitten", "sitting") - 4.0 / 7.0).abs() < 1e-9);
        // Scored per character, not per byte.
        assert!((similarity("zoë", "zoe") - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn gesture_codes_are_one_based() {
        let candidates = ballot(&["Alice", "Bob"]);
        let gesture = GestureResolver;
        assert_eq!(
            gesture.resolve("1", &candidates),
            Resolution::Match("Alice".into())
        );
        assert_eq!(
            gesture.resolve("Two", &candidates),
            Resolution::Match("Bob".into())
        );
        assert_eq!(gesture.resolve("3", &candidates), Resolution::NoMatch);
        assert_eq!(gesture.resolve("0", &candidates), Resolution::NoMatch);
        assert_eq!(gesture.resolve("wave", &candidates), Resolution::NoMatch);
        assert_eq!(gesture_code(" Three "), Some(3));
    }
}
