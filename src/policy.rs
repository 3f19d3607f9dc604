//! Capability Policy System
//!
//! Executed candidate code can only reach builtins that belong to an allowed
//! capability group. The policy is the single source of truth shared by:
//!
//! 1. **The static analyzer** - flags imports and calls of denied groups
//!    before anything runs
//! 2. **The interpreter** - refuses denied builtins at call time as a second
//!    gate
//! 3. **The prompt builder** - tells the model which functions exist, so the
//!    generated code and the sandbox agree on the surface
//!
//! Filesystem, network and process groups have recognized names but no
//! implementation anywhere in the crate; denying them is the default and
//! allowing them only changes how a call is classified, never what it can do.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// CAPABILITY GROUPS
// ============================================================================

/// A named family of builtins the sandbox can expose to candidate code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityGroup {
    /// Tabular data manipulation (select, filter, group, ...)
    Tabular,
    /// Numeric computation over columns and arrays
    Numeric,
    /// Static chart rendering
    Plotting,
    /// Filesystem access. Recognized, never implemented.
    Filesystem,
    /// Network access. Recognized, never implemented.
    Network,
    /// Process spawning and environment access. Recognized, never implemented.
    Process,
}

impl CapabilityGroup {
    /// The module name candidate code uses in `import` statements.
    pub fn module_name(&self) -> &'static str {
        match self {
            CapabilityGroup::Tabular => "tabular",
            CapabilityGroup::Numeric => "numeric",
            CapabilityGroup::Plotting => "charts",
            CapabilityGroup::Filesystem => "fs",
            CapabilityGroup::Network => "net",
            CapabilityGroup::Process => "process",
        }
    }

    /// Resolve an import target back to its group.
    pub fn from_module(name: &str) -> Option<CapabilityGroup> {
        let root = name.split('.').next().unwrap_or(name);
        CapabilityGroup::ALL
            .iter()
            .copied()
            .find(|g| g.module_name() == root)
    }

    /// Builtin function names owned by this group.
    pub fn builtins(&self) -> &'static [&'static str] {
        match self {
            CapabilityGroup::Tabular => &[
                "table",
                "columns",
                "row_count",
                "select",
                "filter",
                "sort_by",
                "head",
                "group_by",
                "unique",
                "emit_table",
            ],
            CapabilityGroup::Numeric => &[
                "mean", "sum", "min", "max", "count", "median", "std", "abs", "sqrt", "round",
            ],
            CapabilityGroup::Plotting => &["bar_chart", "line_chart", "histogram"],
            CapabilityGroup::Filesystem => &["read_file", "write_file", "list_dir", "remove_file"],
            CapabilityGroup::Network => &["fetch", "http_get", "download"],
            CapabilityGroup::Process => &["shell", "exec", "spawn", "env_var"],
        }
    }

    /// Which group owns a builtin name, if any. Names outside every group
    /// (core builtins like `show` and `len`) return `None`.
    pub fn of_function(name: &str) -> Option<CapabilityGroup> {
        CapabilityGroup::ALL
            .iter()
            .copied()
            .find(|g| g.builtins().contains(&name))
    }

    pub fn description(&self) -> &'static str {
        match self {
            CapabilityGroup::Tabular => "tabular data manipulation",
            CapabilityGroup::Numeric => "numeric computation",
            CapabilityGroup::Plotting => "static chart rendering",
            CapabilityGroup::Filesystem => "filesystem access",
            CapabilityGroup::Network => "network access",
            CapabilityGroup::Process => "process execution",
        }
    }

    pub const ALL: [CapabilityGroup; 6] = [
        CapabilityGroup::Tabular,
        CapabilityGroup::Numeric,
        CapabilityGroup::Plotting,
        CapabilityGroup::Filesystem,
        CapabilityGroup::Network,
        CapabilityGroup::Process,
    ];
}

impl fmt::Display for CapabilityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.module_name())
    }
}

// ============================================================================
// CAPABILITY POLICY - the allow-list
// ============================================================================

/// The explicit allow-list of capability groups reachable from executed code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityPolicy {
    allowed: BTreeSet<CapabilityGroup>,
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self::analysis_default()
    }
}

impl CapabilityPolicy {
    // ========================================================================
    // TEMPLATES
    // ========================================================================

    /// Tabular + numeric + plotting. The standard policy for data analysis,
    /// the analogue of a pandas/numpy/matplotlib whitelist.
    pub fn analysis_default() -> Self {
        Self {
            allowed: [
                CapabilityGroup::Tabular,
                CapabilityGroup::Numeric,
                CapabilityGroup::Plotting,
            ]
            .into_iter()
            .collect(),
        }
    }

    /// Tabular + numeric, no chart rendering.
    pub fn no_plotting() -> Self {
        Self {
            allowed: [CapabilityGroup::Tabular, CapabilityGroup::Numeric]
                .into_iter()
                .collect(),
        }
    }

    /// Nothing allowed. Every grouped builtin and every import is refused.
    pub fn locked_down() -> Self {
        Self {
            allowed: BTreeSet::new(),
        }
    }

    // ========================================================================
    // BUILDERS
    // ========================================================================

    pub fn allow(mut self, group: CapabilityGroup) -> Self {
        self.allowed.insert(group);
        self
    }

    pub fn deny(mut self, group: CapabilityGroup) -> Self {
        self.allowed.remove(&group);
        self
    }

    // ========================================================================
    // CHECKS
    // ========================================================================

    pub fn is_allowed(&self, group: CapabilityGroup) -> bool {
        self.allowed.contains(&group)
    }

    /// Allowed groups in stable order, for prompt building and logs.
    pub fn allowed_groups(&self) -> impl Iterator<Item = CapabilityGroup> + '_ {
        self.allowed.iter().copied()
    }

    /// Comma-separated allowed module names, `none` when everything is denied.
    pub fn describe_allowed(&self) -> String {
        if self.allowed.is_empty() {
            return "none".to_string();
        }
        self.allowed_groups()
            .map(|g| g.module_name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Classify a call to `name`: `Ok(())` if it is a core builtin or owned
    /// by an allowed group, `Err(group)` if its owner is denied.
    pub fn check_function(&self, name: &str) -> std::result::Result<(), CapabilityGroup> {
        match CapabilityGroup::of_function(name) {
            Some(group) if !self.is_allowed(group) => Err(group),
            _ => Ok(()),
        }
    }
}
