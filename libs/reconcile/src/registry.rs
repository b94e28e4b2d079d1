//! Program registry.
//!
//! Maps program names to how their artifacts are named and launched. The
//! registry is built once from configuration and shared explicitly.

use std::collections::BTreeMap;

use convoy_id::ProgramName;
use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

/// How a program's artifact is named and its binary launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub name: ProgramName,
    /// Directory of the artifact on remote sources, relative to the source
    /// root. Defaults to the program name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Binary file name inside the install directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Extra arguments passed on every launch.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProgramSpec {
    pub fn new(name: ProgramName) -> Self {
        Self {
            name,
            artifact: None,
            binary: None,
            args: Vec::new(),
        }
    }

    pub fn artifact_path(&self) -> &str {
        self.artifact.as_deref().unwrap_or(self.name.as_str())
    }

    pub fn binary_name(&self) -> &str {
        self.binary.as_deref().unwrap_or(self.name.as_str())
    }
}

/// The set of programs the agent knows how to run.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    programs: BTreeMap<ProgramName, ProgramSpec>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_programs(
        programs: impl IntoIterator<Item = ProgramSpec>,
    ) -> Result<Self, ResolveError> {
        let mut registry = Self::new();
        for program in programs {
            registry.register(program)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, program: ProgramSpec) -> Result<(), ResolveError> {
        if self.programs.contains_key(&program.name) {
            return Err(ResolveError::DuplicateProgram(program.name));
        }
        self.programs.insert(program.name.clone(), program);
        Ok(())
    }

    pub fn get(&self, name: &ProgramName) -> Option<&ProgramSpec> {
        self.programs.get(name)
    }

    pub fn contains(&self, name: &ProgramName) -> bool {
        self.programs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &ProgramName> {
        self.programs.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(name: &str) -> ProgramSpec {
        ProgramSpec::new(ProgramName::parse(name).unwrap())
    }

    #[test]
    fn test_register_and_lookup() {
        let registry =
            ComponentRegistry::from_programs([program("filebeat"), program("metricbeat")]).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&ProgramName::parse("filebeat").unwrap()));
        assert!(!registry.contains(&ProgramName::parse("auditbeat").unwrap()));

        let names: Vec<_> = registry.names().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["filebeat", "metricbeat"]);
    }

    #[test]
    fn test_duplicate_program_rejected() {
        let err = ComponentRegistry::from_programs([program("filebeat"), program("filebeat")])
            .unwrap_err();
        assert!(matches!(err, ResolveError::DuplicateProgram(_)));
    }

    #[test]
    fn test_names_default_to_program() {
        let mut p = program("endpoint");
        assert_eq!(p.artifact_path(), "endpoint");
        assert_eq!(p.binary_name(), "endpoint");

        p.artifact = Some("security/endpoint".to_string());
        p.binary = Some("endpoint-security".to_string());
        assert_eq!(p.artifact_path(), "security/endpoint");
        assert_eq!(p.binary_name(), "endpoint-security");
    }
}
