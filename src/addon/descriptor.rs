//! Launch descriptor resolution.
//!
//! Turns a manifest into the executable, arguments and working directory of
//! an add-on process. Every path the manifest names must stay inside the
//! add-on's install directory.

use std::path::{Component, Path, PathBuf};

use super::AddonError;
use super::manifest::AddonManifest;

/// Default launcher for managed-runtime assemblies.
pub const DEFAULT_MANAGED_LAUNCHER: &str = "dotnet";

/// Entrypoint extension that marks a managed-runtime assembly.
const MANAGED_EXTENSION: &str = "dll";

/// Resolved, sandboxed launch parameters for one start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDescriptor {
    /// Add-on the descriptor belongs to.
    pub addon_id: String,
    /// Executable to start.
    pub file_name: PathBuf,
    /// Arguments, in order.
    pub arguments: Vec<String>,
    /// Working directory for the process.
    pub working_directory: PathBuf,
    /// Manifest the descriptor was derived from.
    pub manifest: Option<AddonManifest>,
}

impl LaunchDescriptor {
    /// Creates a descriptor that launches an executable directly.
    #[must_use]
    pub fn direct(
        addon_id: impl Into<String>,
        file_name: impl Into<PathBuf>,
        arguments: Vec<String>,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            addon_id: addon_id.into(),
            file_name: file_name.into(),
            arguments,
            working_directory: working_directory.into(),
            manifest: None,
        }
    }
}

/// Resolves manifests into launch descriptors.
#[derive(Debug, Clone)]
pub struct DescriptorResolver {
    managed_launcher: String,
}

impl Default for DescriptorResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MANAGED_LAUNCHER)
    }
}

impl DescriptorResolver {
    /// Creates a resolver using the given managed-runtime launcher.
    #[must_use]
    pub fn new(managed_launcher: impl Into<String>) -> Self {
        Self {
            managed_launcher: managed_launcher.into(),
        }
    }

    /// Resolves a manifest into a launch descriptor.
    pub fn resolve(&self, manifest: &AddonManifest) -> Result<LaunchDescriptor, AddonError> {
        if !manifest.is_out_of_process() {
            return Err(AddonError::UnsupportedMode {
                id: manifest.id.clone(),
                mode: manifest.mode.clone().unwrap_or_default(),
            });
        }

        if !manifest.install_directory.is_dir() {
            return Err(AddonError::InstallDirMissing(
                manifest.install_directory.clone(),
            ));
        }
        let root = manifest
            .install_directory
            .canonicalize()
            .map_err(|_| AddonError::InstallDirMissing(manifest.install_directory.clone()))?;

        let module = manifest
            .current_platform_module()
            .ok_or_else(|| AddonError::EntrypointNotDeclared {
                id: manifest.id.clone(),
            })?;

        let entrypoint = contained_path(&root, module)?;
        if !entrypoint.exists() {
            return Err(AddonError::EntrypointMissing(entrypoint));
        }

        let working_directory = match manifest.working_directory.as_deref() {
            Some(dir) if !dir.trim().is_empty() => {
                let resolved = contained_path(&root, dir)?;
                if !resolved.is_dir() {
                    return Err(AddonError::WorkingDirMissing(resolved));
                }
                resolved
            }
            _ => root.clone(),
        };

        let (file_name, arguments) = if is_managed_assembly(&entrypoint) {
            let mut arguments = vec![entrypoint.to_string_lossy().into_owned()];
            arguments.extend(manifest.arguments.iter().cloned());
            (PathBuf::from(&self.managed_launcher), arguments)
        } else {
            (entrypoint, manifest.arguments.clone())
        };

        Ok(LaunchDescriptor {
            addon_id: manifest.id.clone(),
            file_name,
            arguments,
            working_directory,
            manifest: Some(manifest.clone()),
        })
    }
}

fn is_managed_assembly(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(MANAGED_EXTENSION))
}

/// Resolves `value` against `root` and requires the result to stay inside it.
///
/// `root` must already be canonical. The longest existing prefix of the
/// result is canonicalized too, so symlinks are followed before the check
/// and an absolute value may name the install directory in any spelling.
pub fn contained_path(root: &Path, value: &str) -> Result<PathBuf, AddonError> {
    let candidate = Path::new(value.trim());
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let resolved = canonicalize_existing_prefix(&normalize_lexically(&joined));

    if !is_within(root, &resolved) {
        return Err(AddonError::PathEscapesInstallDir {
            path: resolved,
            root: root.to_path_buf(),
        });
    }

    Ok(resolved)
}

/// Canonicalizes the deepest ancestor of `path` that exists and re-appends
/// the components below it. `path` must be free of `.` and `..`.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        if let Ok(mut real) = existing.canonicalize() {
            for name in missing.iter().rev() {
                real.push(name);
            }
            return real;
        }
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Resolves `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` never climbs above the root or prefix.
                if matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Component-wise prefix check.
fn is_within(root: &Path, path: &Path) -> bool {
    let mut path_components = path.components();
    for root_component in root.components() {
        match path_components.next() {
            Some(component) if components_equal(root_component, component) => {}
            _ => return false,
        }
    }
    true
}

#[cfg(any(target_os = "windows", target_os = "macos"))]
fn components_equal(a: Component<'_>, b: Component<'_>) -> bool {
    a.as_os_str()
        .to_string_lossy()
        .to_lowercase()
        .eq(&b.as_os_str().to_string_lossy().to_lowercase())
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn components_equal(a: Component<'_>, b: Component<'_>) -> bool {
    a == b
}
