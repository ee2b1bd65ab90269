//! # Shell task type
//!
//! Runs shell commands and interpreter scripts inside the instance's
//! sandbox.
//!
//! ```yaml
//! homelab:
//!   shell:
//!     - name: bootstrap
//!       type: bash
//!       commands:
//!         - apt-get update
//!       scripts:
//!         - file: setup.sh
//!           type: bash
//!           location: ./scripts/setup.sh
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

mod config;
mod task;

pub use config::{ShellConfig, ShellScript};
pub use task::{resource_name, ShellTask};

use pipeline_orchestrator::registry::TaskPackage;
use semver::Version;

/// Name this crate registers under.
pub const PACKAGE_NAME: &str = "pipeline-orchestrator-extension-shell";

/// The package to add to a [`PackageCatalog`](pipeline_orchestrator::registry::PackageCatalog).
#[must_use]
pub fn package() -> TaskPackage {
    let version = Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 1, 0));
    TaskPackage::new(PACKAGE_NAME, version, || Box::new(ShellTask::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_orchestrator::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_package_provides_shell_type() {
        assert_eq!(package().type_name().as_deref(), Some("shell"));
    }

    #[tokio::test]
    async fn test_runs_in_pipeline() {
        let spec = PipelineSpec::from_yaml_str(
            r"
lab:
  shell:
    - name: first
      type: sh
      commands: ['echo 10.0.0.7']
    - name: second
      type: sh
      commands: ['exit 1']
      retry:
        max_attempts: 1
",
        )
        .unwrap();
        let catalog = PackageCatalog::new().with_package(package());

        let report = orchestrator_for(spec, &catalog)
            .unwrap()
            .run(Arc::new(CancellationToken::new()))
            .await;

        assert_eq!(report.status_of("shell.first"), Some(NodeStatus::Succeeded));
        assert_eq!(report.status_of("shell.second"), Some(NodeStatus::Failed));
        let first = report.snapshot.outputs(&InstanceId::new("shell", "first")).unwrap();
        assert_eq!(first["first_output"][0]["output"], "10.0.0.7");
        assert_eq!(report.exit_code(), 1);
    }
}
