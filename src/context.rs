//! Environment context supplied by the upstream analyzer.
//!
//! The engine never inspects the project itself; everything it knows
//! about the target environment arrives through [`EnvironmentContext`],
//! a read-only bag of facts (framework, package manager, runtime
//! version, OS, complexity tier) plus a free-form key/value map used
//! for `${key}` template substitution in solution steps.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Read-only facts about the target project and runtime.
///
/// All named fields are optional because the analyzer may not be able
/// to determine them; scoring terms that depend on an absent fact
/// simply contribute nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentContext {
    /// Detected framework, e.g. "express", "next", "actix".
    #[serde(default)]
    pub framework: Option<String>,
    /// Detected package manager, e.g. "npm", "pnpm", "cargo".
    #[serde(default)]
    pub package_manager: Option<String>,
    /// Runtime version string, e.g. "18.17.0" or "1.81".
    #[serde(default)]
    pub runtime_version: Option<String>,
    /// Operating system, e.g. "linux", "darwin", "windows".
    #[serde(default)]
    pub operating_system: Option<String>,
    /// Project complexity tier, e.g. "simple", "moderate", "complex".
    #[serde(default)]
    pub complexity_tier: Option<String>,
    /// Free-form facts for template substitution (module names,
    /// ports, paths discovered by the analyzer).
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

impl EnvironmentContext {
    /// Major component of `runtime_version`, if it parses.
    pub fn runtime_major(&self) -> Option<u32> {
        self.runtime_version
            .as_deref()?
            .trim_start_matches('v')
            .split('.')
            .next()?
            .parse()
            .ok()
    }

    /// Look up a substitution variable. Named fields shadow the
    /// free-form map so templates can always reach e.g.
    /// `${package_manager}` even when the analyzer put nothing in
    /// `vars`.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "framework" => self.framework.as_deref(),
            "package_manager" => self.package_manager.as_deref(),
            "runtime_version" => self.runtime_version.as_deref(),
            "operating_system" => self.operating_system.as_deref(),
            "complexity_tier" => self.complexity_tier.as_deref(),
            other => self.vars.get(other).map(String::as_str),
        }
    }

    /// Compact identity string recorded with each application outcome,
    /// e.g. `linux/express/18`.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}/{}/{}",
            self.operating_system.as_deref().unwrap_or("unknown"),
            self.framework.as_deref().unwrap_or("none"),
            self.runtime_major()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        )
    }
}
