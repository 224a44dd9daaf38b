//! Configuration: relation naming and prune strategy.
//!
//! ## Environment
//!
//! [`ClosureSchema::from_env`] reads, falling back to the defaults below:
//! - `CLOSURE_DIRECT_TABLE` (default: `node_relations`)
//! - `CLOSURE_ANCESTRY_TABLE` (default: `node_ancestry`)
//! - `CLOSURE_PARENT_COLUMN` (default: `parent_node_id`)
//! - `CLOSURE_CHILD_COLUMN` (default: `child_node_id`)
//! - `CLOSURE_ANCESTOR_COLUMN` (default: `ancestor_node_id`)
//! - `CLOSURE_DESCENDANT_COLUMN` (default: `descendant_node_id`)
//!
//! [`PruneStrategy::from_env`] reads `CLOSURE_PRUNE_STRATEGY` (`local` or
//! `rederive`, default: `local`).

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// How closure rows are selected for deletion when a direct edge is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PruneStrategy {
    /// Keep a candidate row only when an alternate path runs through the cut
    /// parent's other children or the cut child's other parents.
    ///
    /// Paths through any other node are not detected, so rows that are still
    /// justified can be deleted on some multi-parent shapes.
    #[default]
    Local,
    /// Apply the local check, then re-verify every row it would delete by
    /// walking the remaining direct edges. Exact, at the cost of one query
    /// per breadth-first layer per affected ancestor.
    Rederive,
}

impl PruneStrategy {
    /// Read `CLOSURE_PRUNE_STRATEGY`, falling back to [`Local`](Self::Local)
    /// when it is unset or unrecognized.
    pub fn from_env() -> Self {
        match std::env::var("CLOSURE_PRUNE_STRATEGY") {
            Ok(value) => value.parse().unwrap_or_else(|err: UnknownStrategy| {
                tracing::warn!(error = %err, "Falling back to local prune strategy");
                Self::Local
            }),
            Err(_) => Self::Local,
        }
    }
}

/// A prune strategy name that is neither `local` nor `rederive`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown prune strategy {0:?}; expected \"local\" or \"rederive\"")]
pub struct UnknownStrategy(pub String);

impl FromStr for PruneStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "" => Ok(Self::Local),
            "rederive" => Ok(Self::Rederive),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

impl std::fmt::Display for PruneStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Rederive => write!(f, "rederive"),
        }
    }
}

/// Invalid relation naming.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// A name is not a plain SQL identifier.
    #[error("Invalid SQL identifier for {field}: {value:?}")]
    InvalidIdentifier {
        /// Which setting held the bad value.
        field: &'static str,
        /// The rejected value.
        value: String,
    },
    /// Two settings that must differ share a name.
    #[error("Duplicate name {0:?}: tables and the columns within each table must be distinct")]
    Duplicate(String),
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
    })
}

fn key_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_ ]{0,31}(\([0-9]{1,5}\))?$").expect("key type pattern is valid")
    })
}

/// Table and column names for the two relations.
///
/// Names are interpolated into SQL, so every one of them must pass
/// [`validate`](Self::validate) before a backend uses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureSchema {
    /// Table holding direct parent → child edges.
    pub direct_table: String,
    /// Table holding ancestor → descendant closure rows.
    pub ancestry_table: String,
    /// Parent column of the direct table.
    pub parent_column: String,
    /// Child column of the direct table.
    pub child_column: String,
    /// Ancestor column of the ancestry table.
    pub ancestor_column: String,
    /// Descendant column of the ancestry table.
    pub descendant_column: String,
}

impl Default for ClosureSchema {
    fn default() -> Self {
        Self::for_entity("node")
    }
}

impl ClosureSchema {
    /// Conventional names for an entity: `{entity}_relations(parent_{entity}_id, child_{entity}_id)`
    /// and `{entity}_ancestry(ancestor_{entity}_id, descendant_{entity}_id)`.
    pub fn for_entity(entity: &str) -> Self {
        Self {
            direct_table: format!("{entity}_relations"),
            ancestry_table: format!("{entity}_ancestry"),
            parent_column: format!("parent_{entity}_id"),
            child_column: format!("child_{entity}_id"),
            ancestor_column: format!("ancestor_{entity}_id"),
            descendant_column: format!("descendant_{entity}_id"),
        }
    }

    /// Load names from environment variables with conventional defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, default: String| std::env::var(name).unwrap_or(default);
        Self {
            direct_table: var("CLOSURE_DIRECT_TABLE", defaults.direct_table),
            ancestry_table: var("CLOSURE_ANCESTRY_TABLE", defaults.ancestry_table),
            parent_column: var("CLOSURE_PARENT_COLUMN", defaults.parent_column),
            child_column: var("CLOSURE_CHILD_COLUMN", defaults.child_column),
            ancestor_column: var("CLOSURE_ANCESTOR_COLUMN", defaults.ancestor_column),
            descendant_column: var("CLOSURE_DESCENDANT_COLUMN", defaults.descendant_column),
        }
    }

    /// Check that every name is a plain identifier and that no names collide.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let fields = [
            ("direct_table", &self.direct_table),
            ("ancestry_table", &self.ancestry_table),
            ("parent_column", &self.parent_column),
            ("child_column", &self.child_column),
            ("ancestor_column", &self.ancestor_column),
            ("descendant_column", &self.descendant_column),
        ];
        for (field, value) in fields {
            if !identifier_pattern().is_match(value) {
                return Err(SchemaError::InvalidIdentifier {
                    field,
                    value: value.clone(),
                });
            }
        }

        let distinct = |names: &[&String]| -> Result<(), SchemaError> {
            let mut seen = BTreeSet::new();
            for name in names {
                if !seen.insert(name.to_lowercase()) {
                    return Err(SchemaError::Duplicate((*name).clone()));
                }
            }
            Ok(())
        };
        distinct(&[&self.direct_table, &self.ancestry_table])?;
        distinct(&[&self.parent_column, &self.child_column])?;
        distinct(&[&self.ancestor_column, &self.descendant_column])?;
        Ok(())
    }

    /// `CREATE TABLE IF NOT EXISTS` statements for both relations.
    ///
    /// `key_type` is the SQL column type of node keys (e.g. `BIGINT`, `UUID`,
    /// `VARCHAR(64)`).
    pub fn create_tables_sql(&self, key_type: &str) -> Result<String, SchemaError> {
        self.validate()?;
        if !key_type_pattern().is_match(key_type) {
            return Err(SchemaError::InvalidIdentifier {
                field: "key_type",
                value: key_type.to_string(),
            });
        }
        let Self {
            direct_table: d,
            ancestry_table: a,
            parent_column: p,
            child_column: c,
            ancestor_column: anc,
            descendant_column: desc,
        } = self;
        Ok(format!(
            r#"
CREATE TABLE IF NOT EXISTS {d} (
    {p} {key_type} NOT NULL,
    {c} {key_type} NOT NULL,
    PRIMARY KEY ({p}, {c}),
    CONSTRAINT {d}_no_self_loop CHECK ({p} <> {c})
);

CREATE INDEX IF NOT EXISTS idx_{d}_{c}
    ON {d}({c}, {p});

CREATE TABLE IF NOT EXISTS {a} (
    {anc} {key_type} NOT NULL,
    {desc} {key_type} NOT NULL,
    PRIMARY KEY ({anc}, {desc}),
    CONSTRAINT {a}_irreflexive CHECK ({anc} <> {desc})
);

CREATE INDEX IF NOT EXISTS idx_{a}_{desc}
    ON {a}({desc}, {anc});
"#
        ))
    }
}
