//! Task type registry.
//!
//! Task types ship as packages named `pipeline-orchestrator-extension-<type>`.
//! A [`PackageCatalog`] collects whatever packages the binary links in; the
//! [`TaskRegistry`] checks each package a pipeline needs once, at load time,
//! and afterwards only hands out constructors.

use crate::config::TaskType;
use crate::errors::{LoaderError, LoaderErrorKind};
use crate::handler::TaskHandler;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Package name prefix for task types.
pub const PACKAGE_PREFIX: &str = "pipeline-orchestrator-extension-";

/// The version of this crate, checked against package requirements.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds a fresh handler for one instance.
pub type TaskConstructor = Arc<dyn Fn() -> Box<dyn TaskHandler> + Send + Sync>;

/// One method of the handler contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// `initialize`
    Initialize,
    /// `execute`
    Execute,
    /// `get_output_data`
    GetOutputData,
    /// `cleanup`
    Cleanup,
}

impl Capability {
    /// The capability set every package must expose.
    pub const REQUIRED: [Self; 4] = [Self::Initialize, Self::Execute, Self::GetOutputData, Self::Cleanup];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialize => "initialize",
            Self::Execute => "execute",
            Self::GetOutputData => "get_output_data",
            Self::Cleanup => "cleanup",
        };
        write!(f, "{s}")
    }
}

/// An installable task type.
#[derive(Clone)]
pub struct TaskPackage {
    package_name: String,
    version: Version,
    min_core_version: Version,
    capabilities: BTreeSet<Capability>,
    constructor: TaskConstructor,
}

impl TaskPackage {
    /// Creates a package exposing every capability and requiring core 0.1.0.
    pub fn new<F>(package_name: impl Into<String>, version: Version, constructor: F) -> Self
    where
        F: Fn() -> Box<dyn TaskHandler> + Send + Sync + 'static,
    {
        Self {
            package_name: package_name.into(),
            version,
            min_core_version: Version::new(0, 1, 0),
            capabilities: Capability::REQUIRED.into_iter().collect(),
            constructor: Arc::new(constructor),
        }
    }

    /// Sets the minimum compatible core version.
    #[must_use]
    pub fn with_min_core_version(mut self, version: Version) -> Self {
        self.min_core_version = version;
        self
    }

    /// Replaces the declared capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Returns the package name.
    #[must_use]
    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// Returns the package version.
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Returns the task type name this package provides, if it follows the
    /// naming convention. Dashes in the suffix map to underscores.
    #[must_use]
    pub fn type_name(&self) -> Option<String> {
        self.package_name
            .strip_prefix(PACKAGE_PREFIX)
            .filter(|suffix| !suffix.is_empty())
            .map(|suffix| suffix.replace('-', "_"))
    }

    fn check(&self, type_name: &str, core: &Version) -> Result<(), LoaderError> {
        let missing: Vec<String> = Capability::REQUIRED
            .iter()
            .filter(|c| !self.capabilities.contains(*c))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(LoaderError::new(
                LoaderErrorKind::MissingCapability,
                type_name,
                format!("package '{}' does not expose: {}", self.package_name, missing.join(", ")),
            ));
        }

        if core < &self.min_core_version {
            return Err(LoaderError::new(
                LoaderErrorKind::IncompatibleVersion,
                type_name,
                format!(
                    "package '{}' {} requires core >= {}, running {core}",
                    self.package_name, self.version, self.min_core_version
                ),
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for TaskPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPackage")
            .field("package_name", &self.package_name)
            .field("version", &self.version)
            .field("min_core_version", &self.min_core_version)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Packages available to this process.
#[derive(Debug, Clone, Default)]
pub struct PackageCatalog {
    packages: Vec<TaskPackage>,
}

impl PackageCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a package.
    pub fn register(&mut self, package: TaskPackage) {
        self.packages.push(package);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_package(mut self, package: TaskPackage) -> Self {
        self.register(package);
        self
    }

    /// Returns packages following the naming convention, keyed by type name.
    ///
    /// Packages outside the convention are ignored. Two packages claiming
    /// one type are reported as an invalid package for that type.
    pub fn discover(&self) -> Result<BTreeMap<String, &TaskPackage>, LoaderError> {
        let mut found: BTreeMap<String, &TaskPackage> = BTreeMap::new();
        for package in &self.packages {
            let Some(type_name) = package.type_name() else {
                debug!(package = %package.package_name(), "Ignoring package outside the extension naming convention");
                continue;
            };
            if let Some(existing) = found.get(&type_name) {
                return Err(LoaderError::new(
                    LoaderErrorKind::InvalidPackage,
                    type_name,
                    format!(
                        "provided by both '{}' and '{}'",
                        existing.package_name(),
                        package.package_name()
                    ),
                ));
            }
            found.insert(type_name, package);
        }
        Ok(found)
    }

    /// Number of registered packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Closed mapping from task type to constructor.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    constructors: BTreeMap<TaskType, TaskConstructor>,
}

impl TaskRegistry {
    /// Validates the packages for `required` types against this core.
    pub fn load<'a>(
        catalog: &PackageCatalog,
        required: impl IntoIterator<Item = &'a TaskType>,
    ) -> Result<Self, LoaderError> {
        let core = Version::parse(CORE_VERSION).map_err(|e| {
            LoaderError::new(LoaderErrorKind::IncompatibleVersion, "core", format!("bad core version: {e}"))
        })?;
        Self::load_with_core_version(catalog, required, &core)
    }

    /// Like [`load`](Self::load) against an explicit core version.
    pub fn load_with_core_version<'a>(
        catalog: &PackageCatalog,
        required: impl IntoIterator<Item = &'a TaskType>,
        core: &Version,
    ) -> Result<Self, LoaderError> {
        let available = catalog.discover()?;
        let mut constructors = BTreeMap::new();

        for task_type in required {
            if constructors.contains_key(task_type) {
                continue;
            }
            let package = available
                .get(task_type.as_str())
                .ok_or_else(|| LoaderError::unknown_type(task_type.as_str()))?;
            package.check(task_type.as_str(), core)?;
            info!(
                task_type = %task_type,
                package = %package.package_name(),
                version = %package.version(),
                "Loaded task type"
            );
            constructors.insert(task_type.clone(), Arc::clone(&package.constructor));
        }

        for unused in available.keys().filter(|t| !constructors.keys().any(|k| k.as_str() == t.as_str())) {
            debug!(task_type = %unused, "Installed task type not used by this pipeline");
        }

        Ok(Self { constructors })
    }

    /// Registers a constructor directly, bypassing package checks.
    #[must_use]
    pub fn with_constructor(mut self, task_type: TaskType, constructor: TaskConstructor) -> Self {
        self.constructors.insert(task_type, constructor);
        self
    }

    /// Returns true if the type is loaded.
    #[must_use]
    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.constructors.contains_key(task_type)
    }

    /// Returns the constructor for a loaded type.
    pub fn constructor(&self, task_type: &TaskType) -> Result<TaskConstructor, LoaderError> {
        self.constructors.get(task_type).cloned().ok_or_else(|| {
            warn!(task_type = %task_type, "Constructor requested for unloaded task type");
            LoaderError::unknown_type(task_type.as_str())
        })
    }

    /// Returns the loaded type names.
    pub fn task_types(&self) -> impl Iterator<Item = &TaskType> {
        self.constructors.keys()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTask;

    fn package(name: &str) -> TaskPackage {
        TaskPackage::new(name, Version::new(1, 0, 0), || Box::new(MockTask::new()))
    }

    fn types(names: &[&str]) -> Vec<TaskType> {
        names.iter().map(|n| TaskType::new(*n).unwrap()).collect()
    }

    #[test]
    fn test_type_name_from_package() {
        assert_eq!(
            package("pipeline-orchestrator-extension-cloud-init").type_name().as_deref(),
            Some("cloud_init")
        );
        assert_eq!(package("some-other-crate").type_name(), None);
        assert_eq!(package(PACKAGE_PREFIX).type_name(), None);
    }

    #[test]
    fn test_dashed_package_serves_underscored_section() {
        assert!(TaskType::new("cloud-init").is_err());
        let catalog = PackageCatalog::new().with_package(package("pipeline-orchestrator-extension-cloud-init"));

        let registry = TaskRegistry::load(&catalog, &types(&["cloud_init"])).unwrap();
        assert!(registry.contains(&TaskType::new("cloud_init").unwrap()));
    }

    #[test]
    fn test_load_required_types() {
        let catalog = PackageCatalog::new()
            .with_package(package("pipeline-orchestrator-extension-terraform"))
            .with_package(package("pipeline-orchestrator-extension-shell"))
            .with_package(package("unrelated"));

        let registry = TaskRegistry::load(&catalog, &types(&["terraform"])).unwrap();
        assert!(registry.contains(&TaskType::new("terraform").unwrap()));
        assert!(!registry.contains(&TaskType::new("shell").unwrap()));
        assert!(registry.constructor(&TaskType::new("terraform").unwrap()).is_ok());
    }

    #[test]
    fn test_unknown_type() {
        let catalog = PackageCatalog::new().with_package(package("pipeline-orchestrator-extension-shell"));
        let err = TaskRegistry::load(&catalog, &types(&["ansible"])).unwrap_err();
        assert_eq!(err.kind, LoaderErrorKind::UnknownType);
        assert_eq!(err.type_name, "ansible");
    }

    #[test]
    fn test_missing_capability() {
        let catalog = PackageCatalog::new().with_package(
            package("pipeline-orchestrator-extension-shell")
                .with_capabilities([Capability::Initialize, Capability::Execute, Capability::Cleanup]),
        );
        let err = TaskRegistry::load(&catalog, &types(&["shell"])).unwrap_err();
        assert_eq!(err.kind, LoaderErrorKind::MissingCapability);
        assert!(err.message.contains("get_output_data"));
    }

    #[test]
    fn test_incompatible_version() {
        let catalog = PackageCatalog::new().with_package(
            package("pipeline-orchestrator-extension-shell").with_min_core_version(Version::new(9, 0, 0)),
        );
        let err = TaskRegistry::load_with_core_version(&catalog, &types(&["shell"]), &Version::new(0, 1, 0))
            .unwrap_err();
        assert_eq!(err.kind, LoaderErrorKind::IncompatibleVersion);
    }

    #[test]
    fn test_duplicate_provider() {
        let catalog = PackageCatalog::new()
            .with_package(package("pipeline-orchestrator-extension-shell"))
            .with_package(package("pipeline-orchestrator-extension-shell"));
        let err = TaskRegistry::load(&catalog, &types(&["shell"])).unwrap_err();
        assert_eq!(err.kind, LoaderErrorKind::InvalidPackage);
    }

    #[test]
    fn test_broken_unused_package_is_ignored() {
        let catalog = PackageCatalog::new()
            .with_package(package("pipeline-orchestrator-extension-shell"))
            .with_package(
                package("pipeline-orchestrator-extension-helm").with_min_core_version(Version::new(99, 0, 0)),
            );
        assert!(TaskRegistry::load(&catalog, &types(&["shell"])).is_ok());
    }
}
