use dashmap::DashMap;
use regex::Regex;
use tracing::error;

const GLOB_CHARS: &[char] = &['*', '?'];

/// How a special (non-exact) entry matches a name.
enum Wildcard {
    Glob(glob::Pattern),
    Regex(Regex),
}

/// Multi-pattern deny store. Exact names live in one map, glob and regex
/// patterns in another; lookup order is exact, then glob, then regex, and
/// any hit blocks. Non-regex keys are lowercased; regex keys keep their
/// original `~pattern` form.
pub struct BlockStore {
    exact: DashMap<String, bool>,
    special: DashMap<String, Wildcard>,
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore {
    pub fn new() -> Self {
        Self {
            exact: DashMap::new(),
            special: DashMap::new(),
        }
    }

    /// Insert a key, classifying by shape: `~`-prefixed keys compile to a
    /// regex (invalid patterns are logged and skipped), keys containing `*`
    /// or `?` become globs, everything else is an exact name.
    pub fn set(&self, key: &str) {
        if let Some(expr) = key.strip_prefix('~') {
            match Regex::new(expr) {
                Ok(re) => {
                    self.special.insert(key.to_string(), Wildcard::Regex(re));
                }
                Err(err) => {
                    error!("invalid regexp entry: `{}` {}", key, err);
                }
            }
        } else if key.contains(GLOB_CHARS) {
            let lowered = key.to_lowercase();
            match glob::Pattern::new(&lowered) {
                Ok(pattern) => {
                    self.special.insert(lowered, Wildcard::Glob(pattern));
                }
                Err(err) => {
                    error!("invalid glob entry: `{}` {}", key, err);
                }
            }
        } else {
            self.exact.insert(key.to_lowercase(), true);
        }
    }

    pub fn remove(&self, key: &str) {
        if key.starts_with('~') {
            self.special.remove(key);
        } else if key.contains(GLOB_CHARS) {
            self.special.remove(&key.to_lowercase());
        } else {
            self.exact.remove(&key.to_lowercase());
        }
    }

    /// Presence probe by stored key (no pattern evaluation).
    pub fn get(&self, key: &str) -> Option<bool> {
        if key.starts_with('~') {
            self.special.contains_key(key).then_some(true)
        } else if key.contains(GLOB_CHARS) {
            self.special
                .contains_key(&key.to_lowercase())
                .then_some(true)
        } else {
            self.exact.get(&key.to_lowercase()).map(|v| *v)
        }
    }

    /// Whether `name` is blocked by any entry.
    pub fn exists(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_lowercase();

        if self.exact.contains_key(&name) {
            return true;
        }

        self.special.iter().any(|entry| match entry.value() {
            Wildcard::Glob(pattern) => pattern.matches(&name),
            Wildcard::Regex(re) => re.is_match(&name),
        })
    }

    /// Number of exact entries; patterns are not counted.
    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.special.is_empty()
    }

    /// Stored special-pattern keys, for the admin API listing.
    pub fn special_keys(&self) -> Vec<String> {
        self.special.iter().map(|e| e.key().clone()).collect()
    }
}
