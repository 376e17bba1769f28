//! Topic filter validation and wildcard matching.

use std::fmt;

use thiserror::Error;

/// Errors produced when validating topic names and filters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// Topic names and filters must contain at least one character.
    #[error("Topic filter is empty")]
    Empty,

    /// Topic names and filters must not contain the NUL character.
    #[error("Topic filter contains a NUL character")]
    ContainsNul,

    /// `#` must occupy a whole level and must be the last level.
    #[error("Multi-level wildcard '#' misplaced in '{0}'")]
    MisplacedMultiLevelWildcard(String),

    /// `+` must occupy a whole level.
    #[error("Single-level wildcard '+' misplaced in '{0}'")]
    MisplacedSingleLevelWildcard(String),

    /// Topic names used for publishing may not contain wildcards.
    #[error("Topic name '{0}' contains a wildcard")]
    WildcardInTopicName(String),
}

/// A validated MQTT topic filter.
///
/// Filters support the single-level `+` and multi-level `#` wildcards.
/// Two filters denote the same subscription exactly when their validated
/// strings are equal; MQTT filters are case-sensitive and level-exact, so
/// no further normalization is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicFilter(String);

impl TopicFilter {
    /// Creates a validated topic filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter is empty, contains NUL, or places a
    /// wildcard where MQTT forbids one.
    pub fn new<S>(filter: S) -> Result<Self, FilterError>
    where
        S: Into<String>,
    {
        let filter = filter.into();
        if filter.is_empty() {
            return Err(FilterError::Empty);
        }
        if filter.contains('\0') {
            return Err(FilterError::ContainsNul);
        }

        let level_count = filter.split('/').count();
        for (i, level) in filter.split('/').enumerate() {
            if level.contains('#') && (level != "#" || i + 1 != level_count) {
                return Err(FilterError::MisplacedMultiLevelWildcard(filter));
            }
            if level.contains('+') && level != "+" {
                return Err(FilterError::MisplacedSingleLevelWildcard(filter));
            }
        }

        Ok(Self(filter))
    }

    /// The validated filter string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this filter contains a wildcard level.
    #[must_use]
    pub fn has_wildcards(&self) -> bool {
        self.0.split('/').any(|level| level == "+" || level == "#")
    }

    /// Whether a published topic matches this filter.
    ///
    /// `+` matches exactly one level, `#` matches the remaining levels
    /// including zero (so `a/#` matches `a` itself). Empty levels from
    /// leading, trailing or doubled slashes are ordinary levels.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let mut filter_levels = self.0.split('/');
        let mut topic_levels = topic.split('/');

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (None, None) => return true,
                // '#' is validated to be the final level.
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => {}
                (Some(filter_level), Some(topic_level)) if filter_level == topic_level => {}
                _ => return false,
            }
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for TopicFilter {
    type Error = FilterError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TopicFilter> for String {
    fn from(filter: TopicFilter) -> Self {
        filter.0
    }
}

/// Validates a topic name used for publishing.
///
/// # Errors
///
/// Returns an error if the name is empty, contains NUL, or contains a
/// wildcard character.
pub fn validate_topic_name(topic: &str) -> Result<(), FilterError> {
    if topic.is_empty() {
        return Err(FilterError::Empty);
    }
    if topic.contains('\0') {
        return Err(FilterError::ContainsNul);
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(FilterError::WildcardInTopicName(topic.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::new(s).unwrap()
    }

    #[test]
    fn exact_match() {
        assert!(filter("temp").matches("temp"));
        assert!(filter("sensors/temp").matches("sensors/temp"));
        assert!(!filter("sensors/temp").matches("sensors/humidity"));
        assert!(!filter("sensors/temp").matches("sensors"));
        assert!(!filter("sensors").matches("sensors/temp"));
    }

    #[test]
    fn plus_wildcard() {
        assert!(filter("+").matches("temp"));
        assert!(filter("sensors/+/temp").matches("sensors/room1/temp"));
        assert!(!filter("sensors/+/temp").matches("sensors/room1/temp/extra"));
        assert!(filter("+/temp").matches("abc/temp"));
        assert!(!filter("+/temp").matches("xyz/abc/temp"));
        assert!(filter("sensors/+").matches("sensors/value"));
        assert!(!filter("sensors/+").matches("sensors"));
        assert!(filter("+/+/c").matches("a/b/c"));
        assert!(!filter("+/+/+").matches("a/b"));
    }

    #[test]
    fn hash_wildcard() {
        assert!(filter("#").matches("anything"));
        assert!(filter("#").matches("any/thing/at/any/level"));
        assert!(filter("sensors/#").matches("sensors"));
        assert!(filter("sensors/#").matches("sensors/temp/room1"));
        assert!(!filter("sensors/#").matches("other/temp"));
        assert!(!filter("sensors/temp/#").matches("sensors"));
    }

    #[test]
    fn plus_and_hash_combined() {
        assert!(filter("sensors/+/#").matches("sensors/temp"));
        assert!(filter("sensors/+/#").matches("sensors/temp/room1"));
        assert!(filter("sensors/+/temp/#").matches("sensors/room1/temp"));
    }

    #[test]
    fn empty_levels_are_ordinary_levels() {
        assert!(filter("sensors//temp").matches("sensors//temp"));
        assert!(filter("sensors/").matches("sensors/"));
        assert!(filter("/temp").matches("/temp"));
        assert!(!filter("sensors/temp").matches("sensors//temp"));
        assert!(filter("sensors/+/temp").matches("sensors//temp"));
    }

    #[test]
    fn case_sensitive() {
        assert!(filter("Sensors/Temp").matches("Sensors/Temp"));
        assert!(!filter("sensors/temp").matches("Sensors/Temp"));
    }

    #[test]
    fn shadow_style_filters() {
        let f = filter("$aws/things/+/shadow/update/delta");
        assert!(f.matches("$aws/things/thing-1/shadow/update/delta"));
        assert!(!f.matches("$aws/things/thing-1/shadow/update/accepted"));
    }

    #[test]
    fn rejects_misplaced_wildcards() {
        assert!(TopicFilter::new("sensors/#/temp").is_err());
        assert!(TopicFilter::new("sensors/temp#").is_err());
        assert!(TopicFilter::new("sensor+/temp").is_err());
        assert!(TopicFilter::new("sensors/te+mp").is_err());
        assert!(TopicFilter::new("").is_err());
        assert!(TopicFilter::new("a/\0/b").is_err());
    }

    #[test]
    fn accepts_wildcard_only_filters() {
        assert!(TopicFilter::new("#").is_ok());
        assert!(TopicFilter::new("+").is_ok());
        assert!(TopicFilter::new("+/#").is_ok());
    }

    #[test]
    fn topic_name_validation() {
        assert!(validate_topic_name("sensors/temp").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("sensors/+").is_err());
        assert!(validate_topic_name("sensors/#").is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn level() -> impl Strategy<Value = String> {
            "[a-z0-9]{1,8}"
        }

        fn topic() -> impl Strategy<Value = String> {
            prop::collection::vec(level(), 1..6).prop_map(|levels| levels.join("/"))
        }

        proptest! {
            #[test]
            fn topic_matches_itself(t in topic()) {
                prop_assert!(filter(&t).matches(&t));
            }

            #[test]
            fn hash_matches_everything(t in topic()) {
                prop_assert!(filter("#").matches(&t));
            }

            #[test]
            fn plus_substitution_matches(t in topic(), idx in 0usize..6) {
                let mut levels: Vec<&str> = t.split('/').collect();
                let idx = idx % levels.len();
                levels[idx] = "+";
                let f = levels.join("/");
                prop_assert!(filter(&f).matches(&t));
            }

            #[test]
            fn extra_level_never_matches_without_hash(t in topic()) {
                let longer = format!("{t}/extra");
                prop_assert!(!filter(&t).matches(&longer));
            }
        }
    }
}
