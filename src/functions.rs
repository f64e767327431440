//! Python functions made importable from executed code.
//!
//! Each configured function is Python source plus the packages and
//! imports it needs. At start-up the executor writes them all into one
//! module in the working directory and installs the packages, so blocks
//! can `from <module> import <name>`.

use std::collections::BTreeSet;

use serde::Deserialize;

/// A Python function with the requirements needed to run it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FunctionWithRequirements {
    /// Source of exactly one top-level function.
    pub code: String,

    /// Packages to `pip install`, version specifiers allowed.
    #[serde(default)]
    pub python_packages: Vec<String>,

    /// Module names (`numpy`) or full import statements
    /// (`from pathlib import Path`).
    #[serde(default)]
    pub global_imports: Vec<String>,
}

impl FunctionWithRequirements {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.python_packages.extend(packages.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_imports<I, S>(mut self, imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_imports.extend(imports.into_iter().map(Into::into));
        self
    }

    /// Name of the top-level function the source defines, if exactly one.
    pub fn name(&self) -> Option<&str> {
        let mut names = self.code.lines().filter_map(|line| {
            let rest = line
                .strip_prefix("async def ")
                .or_else(|| line.strip_prefix("def "))?;
            let end = rest.find('(')?;
            Some(rest[..end].trim())
        });
        let name = names.next()?;
        names.next().is_none().then_some(name)
    }
}

fn import_statement(import: &str) -> String {
    let import = import.trim();
    if import.starts_with("import ") || import.starts_with("from ") {
        import.to_string()
    } else {
        format!("import {import}")
    }
}

/// Source of the functions module: the deduplicated imports of every
/// function, then each function body.
pub fn build_functions_file(functions: &[FunctionWithRequirements]) -> String {
    let imports: BTreeSet<String> = functions
        .iter()
        .flat_map(|f| f.global_imports.iter())
        .map(|i| import_statement(i))
        .collect();

    let mut content = imports.into_iter().collect::<Vec<_>>().join("\n");
    content.push_str("\n\n");
    for function in functions {
        content.push_str(function.code.trim_end());
        content.push_str("\n\n");
    }
    content
}

/// Every package any function needs, deduplicated and sorted.
pub fn required_packages(functions: &[FunctionWithRequirements]) -> Vec<String> {
    functions
        .iter()
        .flat_map(|f| f.python_packages.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Whether `name` can be used as a Python module name.
pub fn is_module_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
