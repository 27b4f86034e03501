//! Workflow definition registry
//!
//! Definitions are validated once, when they are registered. A definition
//! that made it into the registry is guaranteed to have unique phase ids,
//! known dependencies declared before their dependents, and no cycles, so
//! nothing downstream re-checks the graph at run time.

use gantry_core::{GantryConfig, GantryError, Result, WorkflowDefinition};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

const BUILTIN_RUST: &str = include_str!("../definitions/rust.toml");
const BUILTIN_PYTHON: &str = include_str!("../definitions/python.toml");

/// Catalog of validated workflow definitions, keyed by id
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: BTreeMap<String, WorkflowDefinition>,
}

impl DefinitionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in definitions
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(parse_toml(BUILTIN_RUST)?)?;
        registry.register(parse_toml(BUILTIN_PYTHON)?)?;
        Ok(registry)
    }

    /// Built-ins plus everything in the configured definitions directory
    pub fn from_config(config: &GantryConfig) -> Result<Self> {
        let mut registry = Self::with_builtins()?;
        if let Some(dir) = &config.definitions_dir {
            let loaded = registry.load_dir(dir)?;
            info!("Loaded {} workflow definition(s) from {}", loaded, dir.display());
        }
        Ok(registry)
    }

    /// Validate and add a definition, replacing any with the same id
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<()> {
        validate_definition(&definition)?;
        debug!(
            "Registered definition {} ({} phases)",
            definition.id,
            definition.phases.len()
        );
        self.definitions.insert(definition.id.clone(), definition);
        Ok(())
    }

    /// Load every `.toml` and `.json` file in `dir`
    ///
    /// Files are read in name order. Any malformed or cyclic file aborts the
    /// load with that file's error.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("toml") | Some("json")
                )
            })
            .collect();
        paths.sort();

        for path in &paths {
            self.register(load_file(path)?)?;
        }

        Ok(paths.len())
    }

    /// Look up a definition by id
    pub fn get(&self, id: &str) -> Result<&WorkflowDefinition> {
        self.definitions
            .get(id)
            .ok_or_else(|| GantryError::DefinitionNotFound(id.to_string()))
    }

    /// First definition (by id) targeting `technology`, case-insensitive
    pub fn by_technology(&self, technology: &str) -> Result<&WorkflowDefinition> {
        self.definitions
            .values()
            .find(|d| d.technology.eq_ignore_ascii_case(technology))
            .ok_or_else(|| {
                GantryError::DefinitionNotFound(format!(
                    "no definition for technology '{}'",
                    technology
                ))
            })
    }

    /// All definitions ordered by id
    pub fn list(&self) -> Vec<&WorkflowDefinition> {
        self.definitions.values().collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Parse a definition from TOML
pub fn parse_toml(content: &str) -> Result<WorkflowDefinition> {
    toml::from_str(content).map_err(|e| GantryError::InvalidDefinition(e.to_string()))
}

/// Parse a definition from JSON
pub fn parse_json(content: &str) -> Result<WorkflowDefinition> {
    serde_json::from_str(content).map_err(|e| GantryError::InvalidDefinition(e.to_string()))
}

fn load_file(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)?;
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_json(&content),
        _ => parse_toml(&content),
    };
    parsed.map_err(|e| match e {
        GantryError::InvalidDefinition(msg) => {
            GantryError::InvalidDefinition(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

/// Check the structural rules every registered definition must satisfy
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<()> {
    if definition.id.trim().is_empty() {
        return Err(GantryError::InvalidDefinition(
            "definition id must not be empty".to_string(),
        ));
    }
    if definition.phases.is_empty() {
        return Err(GantryError::InvalidDefinition(format!(
            "{} declares no phases",
            definition.id
        )));
    }

    let mut seen = HashSet::new();
    for phase in &definition.phases {
        if !seen.insert(phase.id.as_str()) {
            return Err(GantryError::InvalidDefinition(format!(
                "{}: duplicate phase id '{}'",
                definition.id, phase.id
            )));
        }
        if phase.timeout == 0 {
            return Err(GantryError::InvalidDefinition(format!(
                "{}: phase '{}' has a zero timeout",
                definition.id, phase.id
            )));
        }
    }

    for phase in &definition.phases {
        for dep in &phase.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(GantryError::InvalidDefinition(format!(
                    "{}: phase '{}' depends on unknown phase '{}'",
                    definition.id, phase.id, dep
                )));
            }
        }
    }

    if let Some(cycle) = find_cycle(definition) {
        return Err(GantryError::CyclicDependency {
            definition: definition.id.clone(),
            cycle: cycle.join(" -> "),
        });
    }

    // Acyclic at this point, but dependents must still come after their deps
    for (index, phase) in definition.phases.iter().enumerate() {
        for dep in &phase.dependencies {
            let dep_index = definition.phase_index(dep).unwrap_or(usize::MAX);
            if dep_index >= index {
                return Err(GantryError::InvalidDefinition(format!(
                    "{}: phase '{}' depends on '{}', which is declared after it",
                    definition.id, phase.id, dep
                )));
            }
        }
    }

    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search for a dependency cycle, returning its path
fn find_cycle(definition: &WorkflowDefinition) -> Option<Vec<String>> {
    fn visit<'a>(
        id: &'a str,
        definition: &'a WorkflowDefinition,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(id, Mark::Visiting);
        stack.push(id);

        if let Some(phase) = definition.phase(id) {
            for dep in &phase.dependencies {
                if let Some(cycle) = visit(dep, definition, marks, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    definition
        .phases
        .iter()
        .find_map(|phase| visit(&phase.id, definition, &mut marks, &mut stack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const THREE_STEP: &str = r#"
        id = "three"
        name = "Three step"
        technology = "go"

        [[phases]]
        id = "a"
        name = "A"
        agent_type = "w"
        method = "a"

        [[phases]]
        id = "b"
        name = "B"
        agent_type = "w"
        method = "b"
        dependencies = ["a"]
        approval_required = true

        [[phases]]
        id = "c"
        name = "C"
        agent_type = "w"
        method = "c"
        dependencies = ["b"]
    "#;

    #[test]
    fn test_builtins_load() {
        let registry = DefinitionRegistry::with_builtins().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_technology("Rust").unwrap().id, "rust-delivery");
        assert_eq!(registry.by_technology("python").unwrap().id, "python-delivery");
        assert!(matches!(
            registry.by_technology("cobol"),
            Err(GantryError::DefinitionNotFound(_))
        ));
    }

    #[test]
    fn test_defaults_applied() {
        let def = parse_toml(THREE_STEP).unwrap();
        let a = def.phase("a").unwrap();
        assert_eq!(a.timeout, 300);
        assert_eq!(a.max_retries, 0);
        assert!(!a.approval_required);
        assert!(def.phase("b").unwrap().approval_required);
        validate_definition(&def).unwrap();
    }

    #[test]
    fn test_cycle_rejected() {
        let def = parse_json(
            r#"{
                "id": "loop", "name": "Loop", "technology": "x",
                "phases": [
                    {"id": "a", "name": "A", "agent_type": "w", "method": "a",
                     "dependencies": ["b"]},
                    {"id": "b", "name": "B", "agent_type": "w", "method": "b",
                     "dependencies": ["a"]}
                ]
            }"#,
        )
        .unwrap();

        match validate_definition(&def) {
            Err(GantryError::CyclicDependency { definition, cycle }) => {
                assert_eq!(definition, "loop");
                assert!(cycle.contains("a -> b -> a") || cycle.contains("b -> a -> b"));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let mut def = parse_toml(THREE_STEP).unwrap();
        def.phases[0].dependencies.push("a".to_string());
        assert!(matches!(
            validate_definition(&def),
            Err(GantryError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_and_forward_dependencies() {
        let mut def = parse_toml(THREE_STEP).unwrap();
        def.phases[2].dependencies.push("ghost".to_string());
        assert!(matches!(
            validate_definition(&def),
            Err(GantryError::InvalidDefinition(_))
        ));

        let mut forward = parse_toml(THREE_STEP).unwrap();
        forward.phases[0].dependencies.push("c".to_string());
        forward.phases[1].dependencies.clear();
        forward.phases[2].dependencies.clear();
        match validate_definition(&forward) {
            Err(GantryError::InvalidDefinition(msg)) => assert!(msg.contains("declared after")),
            other => panic!("expected ordering error, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_phase_ids() {
        let mut def = parse_toml(THREE_STEP).unwrap();
        def.phases[2].id = "a".to_string();
        assert!(matches!(
            validate_definition(&def),
            Err(GantryError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_load_dir_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        let custom = BUILTIN_RUST.replace("Rust delivery pipeline", "Custom Rust");
        std::fs::write(dir.path().join("rust.toml"), custom).unwrap();
        std::fs::write(dir.path().join("three.toml"), THREE_STEP).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = DefinitionRegistry::with_builtins().unwrap();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 2);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("rust-delivery").unwrap().name, "Custom Rust");
        assert_eq!(registry.by_technology("GO").unwrap().id, "three");
    }

    #[test]
    fn test_malformed_file_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();

        let mut registry = DefinitionRegistry::new();
        assert!(matches!(
            registry.load_dir(dir.path()),
            Err(GantryError::InvalidDefinition(_))
        ));
        assert!(registry.is_empty());
    }
}
