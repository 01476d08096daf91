use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use regex::Regex;

/// A compiled regular expression literal. Identity is the source
/// pattern, so structurally equal literals dedup to one pool entry.
#[derive(Debug, Clone)]
pub struct RegExp {
    pattern: String,
    compiled: Rc<Regex>,
}

impl RegExp {
    pub fn new(pattern: impl Into<String>) -> Result<RegExp, regex::Error> {
        let pattern = pattern.into();
        let compiled = Rc::new(Regex::new(&pattern)?);
        Ok(RegExp { pattern, compiled })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, subject: &str) -> bool {
        self.compiled.is_match(subject)
    }

    /// Capture groups of the first match; group 0 is the whole match.
    pub fn captures(&self, subject: &str) -> Option<Vec<String>> {
        self.compiled.captures(subject).map(|caps| {
            (0..caps.len())
                .map(|i| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect()
        })
    }
}

impl PartialEq for RegExp {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for RegExp {}

impl Hash for RegExp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
    }
}

impl fmt::Display for RegExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.pattern)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn equality_is_by_pattern() {
        let a = RegExp::new("^/static/.*$").unwrap();
        let b = RegExp::new("^/static/.*$").unwrap();
        let c = RegExp::new("^/api/.*$").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn captures_include_whole_match() {
        let re = RegExp::new(r"^(\w+)=(\w+)$").unwrap();
        let caps = re.captures("key=value").unwrap();
        assert_eq!(caps, vec!["key=value", "key", "value"]);
    }
}
