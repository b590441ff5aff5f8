//! Build environment variables.
//!
//! Supports references like:
//! - `${WORKSPACE}` / `$WORKSPACE` - another variable of the same environment
//!
//! Unknown references are preserved verbatim so that the shell can still see them.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Variables that identify a build. They are applied last when the
/// environment is assembled, so no node, job or wrapper value can replace them.
pub const CHARACTERISTIC_VARS: &[&str] = &[
    "BUILD_NUMBER",
    "BUILD_ID",
    "BUILD_TAG",
    "JOB_NAME",
    "WORKSPACE",
    "NODE_NAME",
    "EXECUTOR_NUMBER",
];

// Matches ${NAME} and $NAME
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

/// Ordered map of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars {
    vars: BTreeMap<String, String>,
}

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    /// Later values replace earlier ones.
    pub fn override_all<'a>(&mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (k, v) in vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Expand `${VAR}` and `$VAR` references in `input` using this environment.
    pub fn expand(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match self.vars.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Resolve references between variables of this environment
    /// (e.g. `PATH=$HOME/bin`). Each value is expanded against the
    /// environment as it was before resolution, so cycles cannot loop.
    pub fn resolve(&mut self) {
        let snapshot = self.clone();
        for value in self.vars.values_mut() {
            if value.contains('$') {
                *value = snapshot.expand(value);
            }
        }
    }

    pub fn is_characteristic(key: &str) -> bool {
        CHARACTERISTIC_VARS.contains(&key)
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.vars
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

impl FromIterator<(String, String)> for EnvVars {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}
