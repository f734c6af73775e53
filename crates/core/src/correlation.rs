//! Correlation identifiers tying a dispatched workflow run to the report
//! artifact it eventually uploads.
//!
//! The hub embeds the id in each dispatch record; the downstream job copies
//! it into its `report.json`. Matching the two is the ground truth when run
//! ids drift under eventual consistency.

/// Build the correlation id for a dispatched run.
///
/// Pure string composition; inputs are not normalized, so callers must
/// supply canonical values. Identical inputs always yield the identical id.
pub fn generate(run_id: u64, attempt: u64, config_name: &str) -> String {
    format!("{run_id}-{attempt}-{config_name}")
}

/// Check a report's correlation id against the expected one.
///
/// An empty `expected` disables validation entirely (trust mode). A
/// non-empty `expected` with an empty or absent `actual` is a failure:
/// absence of an expectation is "don't care", but an expectation with no
/// answer is not a match.
pub fn validate(expected: &str, actual: Option<&str>) -> bool {
    if expected.is_empty() {
        return true;
    }
    matches!(actual, Some(actual) if actual == expected)
}

#[cfg(test)]
mod tests {
    use super::{generate, validate};

    #[test]
    fn test_generate_deterministic() {
        let a = generate(12345, 1, "web-frontend");
        let b = generate(12345, 1, "web-frontend");
        assert_eq!(a, b);
        assert_eq!(a, "12345-1-web-frontend");
        assert_ne!(generate(12345, 2, "web-frontend"), a);
    }

    #[test]
    fn test_validate() {
        let cases: &[(&str, Option<&str>, bool)] = &[
            ("", None, true),
            ("", Some(""), true),
            ("", Some("anything"), true),
            ("123-1-web", None, false),
            ("123-1-web", Some(""), false),
            ("123-1-web", Some("123-2-web"), false),
            ("123-1-web", Some("123-1-web"), true),
        ];
        for &(expected, actual, result) in cases {
            assert_eq!(validate(expected, actual), result, "validate({expected:?}, {actual:?})");
        }
    }
}
