//! Connector registry
//!
//! Maps a connector kind from configuration (`"memory"`, `"directory"`, ...)
//! to a constructor. Additional kinds can be registered before the service
//! resolves its `[[connectors]]` entries.

use crate::connector::{Result, StorageConnector, StorageError};
use crate::directory::DirectoryConnector;
use crate::memory::MemoryConnector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// One `[[connectors]]` configuration entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorSpec {
    /// Registered connector kind
    pub kind: String,
    /// Unique connector name
    pub name: String,
    /// Base path for filesystem-backed kinds
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ConnectorSpec {
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            kind: "memory".to_string(),
            name: name.into(),
            path: None,
        }
    }

    pub fn directory(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: "directory".to_string(),
            name: name.into(),
            path: Some(path.into()),
        }
    }
}

/// Constructor for one connector kind
pub type ConnectorFactory =
    Box<dyn Fn(&ConnectorSpec) -> Result<Arc<dyn StorageConnector>> + Send + Sync>;

/// Registry of connector constructors keyed by kind
pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    /// Empty registry
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in `memory` and `directory` kinds
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", |spec| {
            Ok(Arc::new(MemoryConnector::new(&spec.name)) as Arc<dyn StorageConnector>)
        });
        registry.register("directory", |spec| {
            let path = spec.path.as_ref().ok_or_else(|| {
                StorageError::InvalidConfig(format!(
                    "connector {} of kind directory needs a path",
                    spec.name
                ))
            })?;
            Ok(Arc::new(DirectoryConnector::new(&spec.name, path)) as Arc<dyn StorageConnector>)
        });
        registry
    }

    /// Register (or replace) the constructor for `kind`
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&ConnectorSpec) -> Result<Arc<dyn StorageConnector>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Build one connector
    pub fn build(&self, spec: &ConnectorSpec) -> Result<Arc<dyn StorageConnector>> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| StorageError::UnknownKind(spec.kind.clone()))?;
        factory(spec)
    }

    /// Build every configured connector, rejecting duplicate names
    pub fn build_all(&self, specs: &[ConnectorSpec]) -> Result<Vec<Arc<dyn StorageConnector>>> {
        let mut seen = std::collections::HashSet::new();
        specs
            .iter()
            .map(|spec| {
                if !seen.insert(spec.name.as_str()) {
                    return Err(StorageError::InvalidConfig(format!(
                        "duplicate connector name {}",
                        spec.name
                    )));
                }
                self.build(spec)
            })
            .collect()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let registry = ConnectorRegistry::new();
        assert_eq!(registry.kinds(), vec!["directory", "memory"]);

        let conn = registry.build(&ConnectorSpec::memory("m0")).unwrap();
        assert_eq!(conn.name(), "m0");

        let conn = registry
            .build(&ConnectorSpec::directory("d0", "/tmp/cloudraid-d0"))
            .unwrap();
        assert_eq!(conn.name(), "d0");
    }

    #[test]
    fn test_unknown_kind() {
        let registry = ConnectorRegistry::new();
        let spec = ConnectorSpec {
            kind: "dropbox".into(),
            name: "db".into(),
            path: None,
        };
        assert!(matches!(
            registry.build(&spec),
            Err(StorageError::UnknownKind(kind)) if kind == "dropbox"
        ));
    }

    #[test]
    fn test_directory_requires_path() {
        let registry = ConnectorRegistry::new();
        let spec = ConnectorSpec {
            kind: "directory".into(),
            name: "d".into(),
            path: None,
        };
        assert!(matches!(
            registry.build(&spec),
            Err(StorageError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_custom_kind_and_duplicates() {
        let mut registry = ConnectorRegistry::empty();
        registry.register("mock", |spec| {
            Ok(Arc::new(MemoryConnector::new(format!("mock-{}", spec.name)))
                as Arc<dyn StorageConnector>)
        });
        let specs = vec![
            ConnectorSpec {
                kind: "mock".into(),
                name: "a".into(),
                path: None,
            },
            ConnectorSpec {
                kind: "mock".into(),
                name: "b".into(),
                path: None,
            },
        ];
        let built = registry.build_all(&specs).unwrap();
        assert_eq!(built[1].name(), "mock-b");

        let dupes = vec![specs[0].clone(), specs[0].clone()];
        assert!(registry.build_all(&dupes).is_err());
    }

    #[test]
    fn test_spec_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            connectors: Vec<ConnectorSpec>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [[connectors]]
            kind = "directory"
            name = "local0"
            path = "/var/lib/cloudraid/c0"

            [[connectors]]
            kind = "memory"
            name = "scratch"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.connectors.len(), 2);
        assert_eq!(parsed.connectors[0], ConnectorSpec::directory("local0", "/var/lib/cloudraid/c0"));
        assert_eq!(parsed.connectors[1].path, None);
    }
}
