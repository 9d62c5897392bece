use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagCategory {
    Core,
    Module,
    Experimental,
    Ui,
    Admin,
}

impl FlagCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagCategory::Core => "core",
            FlagCategory::Module => "module",
            FlagCategory::Experimental => "experimental",
            FlagCategory::Ui => "ui",
            FlagCategory::Admin => "admin",
        }
    }
}

impl std::fmt::Display for FlagCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlagCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core" => Ok(FlagCategory::Core),
            "module" => Ok(FlagCategory::Module),
            "experimental" => Ok(FlagCategory::Experimental),
            "ui" => Ok(FlagCategory::Ui),
            "admin" => Ok(FlagCategory::Admin),
            invalid => Err(format!("{} is not a valid flag category", invalid)),
        }
    }
}

/// A flag known at build time, with the value it takes when neither an
/// environment override nor a stored override exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagDefinition {
    pub key: String,
    pub category: FlagCategory,
    pub default_enabled: bool,
}

impl FlagDefinition {
    pub fn new(key: &str, category: FlagCategory, default_enabled: bool) -> Self {
        Self {
            key: key.to_string(),
            category,
            default_enabled,
        }
    }
}

/// Flags shipped with this build. Deploying a new flag means adding it here.
const BUILTIN_FLAGS: &[(&str, FlagCategory, bool)] = &[
    ("dark-mode", FlagCategory::Ui, false),
    ("maintenance-banner", FlagCategory::Core, false),
    ("file-uploads", FlagCategory::Core, true),
    ("new-checkout", FlagCategory::Module, false),
    ("inventory-export", FlagCategory::Module, true),
    ("experimental-search", FlagCategory::Experimental, false),
    ("admin-audit-log", FlagCategory::Admin, true),
];

/// Immutable key -> definition table. The only mutable source of truth for
/// flag values is the store, never this table.
pub struct StaticDefaultsTable {
    defs: HashMap<String, FlagDefinition>,
}

impl StaticDefaultsTable {
    pub fn new(defs: Vec<FlagDefinition>) -> Self {
        let defs = defs.into_iter().map(|d| (d.key.clone(), d)).collect();
        Self { defs }
    }

    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_FLAGS
                .iter()
                .map(|(key, category, default_enabled)| {
                    FlagDefinition::new(key, *category, *default_enabled)
                })
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&FlagDefinition> {
        self.defs.get(key)
    }

    /// Unknown keys fail closed to disabled.
    pub fn default_enabled(&self, key: &str) -> bool {
        self.defs.get(key).map(|d| d.default_enabled).unwrap_or(false)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
