use std::collections::HashMap;
use std::sync::Arc;

pub const ENV_FLAG_PREFIX: &str = "FLAG_";

const TRUTHY: &[&str] = &["1", "true", "on", "yes"];
const FALSY: &[&str] = &["0", "false", "off", "no"];

/// Process-scope key/value lookup. Abstracted so tests never have to mutate
/// real process environment.
pub trait EnvSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

#[derive(Clone, Default)]
pub struct StaticEnv {
    vars: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }
}

impl EnvSource for StaticEnv {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

/// Deterministic flag key -> variable name transform: prefixed, upper-cased,
/// anything outside [a-zA-Z0-9] becomes an underscore.
pub fn env_var_name(key: &str) -> String {
    let mut name = String::with_capacity(ENV_FLAG_PREFIX.len() + key.len());
    name.push_str(ENV_FLAG_PREFIX);
    for c in key.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_uppercase());
        } else {
            name.push('_');
        }
    }
    name
}

fn parse_override(raw: &str) -> Option<bool> {
    let word = raw.trim().to_ascii_lowercase();
    if TRUTHY.contains(&word.as_str()) {
        Some(true)
    } else if FALSY.contains(&word.as_str()) {
        Some(false)
    } else {
        // Unrecognized vocabulary means no override, not an error
        None
    }
}

#[derive(Clone)]
pub struct EnvironmentOverrideResolver {
    source: Arc<dyn EnvSource>,
}

impl EnvironmentOverrideResolver {
    pub fn new(source: impl EnvSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    pub fn from_process_env() -> Self {
        Self::new(ProcessEnv)
    }

    /// An explicit per-flag override, or `None` when the variable is absent
    /// or holds an unrecognized word.
    pub fn lookup(&self, key: &str) -> Option<bool> {
        let raw = self.source.get(&env_var_name(key))?;
        parse_override(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_name_transform_is_deterministic() {
        assert_eq!(env_var_name("dark-mode"), "FLAG_DARK_MODE");
        assert_eq!(env_var_name("new-checkout"), "FLAG_NEW_CHECKOUT");
        assert_eq!(env_var_name("a.b c"), "FLAG_A_B_C");
    }

    #[test]
    fn accepts_the_fixed_truthy_and_falsy_vocabularies() {
        for word in ["1", "true", "on", "yes", "TRUE", " Yes "] {
            assert_eq!(parse_override(word), Some(true), "{word:?}");
        }
        for word in ["0", "false", "off", "no", "OFF"] {
            assert_eq!(parse_override(word), Some(false), "{word:?}");
        }
    }

    #[test]
    fn unrecognized_words_are_no_override() {
        for word in ["", "enabled", "2", "maybe", "truthy"] {
            assert_eq!(parse_override(word), None, "{word:?}");
        }
    }

    #[test]
    fn lookup_resolves_through_the_source() {
        let env = StaticEnv::new()
            .set("FLAG_DARK_MODE", "on")
            .set("FLAG_NEW_CHECKOUT", "garbage");
        let resolver = EnvironmentOverrideResolver::new(env);

        assert_eq!(resolver.lookup("dark-mode"), Some(true));
        assert_eq!(resolver.lookup("new-checkout"), None);
        assert_eq!(resolver.lookup("file-uploads"), None);
    }
}
