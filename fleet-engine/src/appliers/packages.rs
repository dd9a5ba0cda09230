use super::{Applier, ApplyContext};
use crate::manifest::{Manifest, PackageSpec};
use crate::session::{Action, Probe};
use crate::utils::errors::ApplyError;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageKind {
    /// Satisfied when the provided binary is on `PATH`.
    System,
    /// Satisfied when the provided module imports.
    Interpreter,
}

/// Installs missing packages. Already satisfied packages never reach the
/// installer, and a package that is still missing afterwards is a soft
/// error: an optional package must not block the rest of the pass.
pub struct PackagesApplier {
    kind: PackageKind,
}

impl PackagesApplier {
    pub fn system() -> Self {
        Self { kind: PackageKind::System }
    }

    pub fn interpreter() -> Self {
        Self { kind: PackageKind::Interpreter }
    }

    fn packages<'m>(&self, manifest: &'m Manifest) -> &'m [PackageSpec] {
        match self.kind {
            PackageKind::System => &manifest.system_packages,
            PackageKind::Interpreter => &manifest.interpreter_packages,
        }
    }

    fn probe(&self, manifest: &Manifest, package: &PackageSpec) -> Probe {
        match self.kind {
            PackageKind::System => Probe::Which(package.provides().to_string()),
            PackageKind::Interpreter => Probe::Importable {
                interpreter: manifest.service.interpreter.clone(),
                module: package.provides().to_string(),
            },
        }
    }

    fn installer(&self, manifest: &Manifest) -> Vec<String> {
        match self.kind {
            PackageKind::System => manifest.service.system_installer.clone(),
            PackageKind::Interpreter => manifest.service.interpreter_installer.clone(),
        }
    }
}

#[async_trait]
impl Applier for PackagesApplier {
    fn kind(&self) -> &'static str {
        match self.kind {
            PackageKind::System => "package",
            PackageKind::Interpreter => "interpreter-package",
        }
    }

    async fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), ApplyError> {
        let manifest = ctx.registry.manifest();
        let packages = self.packages(manifest);
        if packages.is_empty() {
            return Ok(());
        }
        let label = |p: &PackageSpec| format!("{}:{}", self.kind(), p.name());

        let probes: Vec<Probe> = packages.iter().map(|p| self.probe(manifest, p)).collect();
        let current = ctx.query(&probes).await?;

        let mut missing = Vec::new();
        for (i, package) in packages.iter().enumerate() {
            if current.get(i).is_yes() {
                ctx.correct(label(package));
            } else {
                missing.push(package);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        if ctx.dry_run {
            for package in missing {
                ctx.fixed(label(package));
            }
            return Ok(());
        }
        let install = Action::Install {
            installer: self.installer(manifest),
            packages: missing.iter().map(|p| p.name().to_string()).collect(),
        };
        if let Err(e) = ctx.commit(vec![install]).await {
            for package in missing {
                ctx.error(label(package), &e);
            }
            return Ok(());
        }

        // the install script never fails as a whole; re-check each package
        let probes: Vec<Probe> = missing.iter().map(|p| self.probe(manifest, p)).collect();
        let after = ctx.query(&probes).await?;
        for (i, package) in missing.into_iter().enumerate() {
            if after.get(i).is_yes() {
                ctx.fixed(label(package));
            } else {
                ctx.error(label(package), "still missing after install");
            }
        }
        Ok(())
    }
}
