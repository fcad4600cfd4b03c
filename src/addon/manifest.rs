//! Add-on manifests and catalogs.
//!
//! Installation writes an `addon.yaml` into each add-on directory. The host
//! only reads the launch-related keys; everything else in the file is
//! ignored.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Manifest file name inside an add-on directory.
pub const MANIFEST_FILE: &str = "addon.yaml";

/// Mode strings that mark an add-on as out-of-process.
pub const OUT_OF_PROCESS_MODES: [&str; 3] = ["outofprocess", "out-of-process", "process"];

/// Launch-related view of an add-on manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddonManifest {
    /// Unique add-on identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Hosting mode.
    #[serde(default)]
    pub mode: Option<String>,
    /// Directory the add-on is installed in. Set by the catalog.
    #[serde(skip)]
    pub install_directory: PathBuf,
    /// Entrypoint used when no platform-specific module is declared.
    #[serde(default)]
    pub module: Option<String>,
    /// Windows entrypoint.
    #[serde(default)]
    pub module_windows: Option<String>,
    /// Linux entrypoint.
    #[serde(default)]
    pub module_linux: Option<String>,
    /// macOS entrypoint.
    #[serde(default, rename = "ModuleMacOS")]
    pub module_macos: Option<String>,
    /// Extra arguments passed to the entrypoint.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Working directory, relative to the install directory.
    #[serde(default)]
    pub working_directory: Option<String>,
}

impl AddonManifest {
    /// Returns true if the declared mode marks this add-on as out-of-process.
    #[must_use]
    pub fn is_out_of_process(&self) -> bool {
        self.mode.as_deref().is_some_and(|mode| {
            let mode = mode.trim();
            OUT_OF_PROCESS_MODES
                .iter()
                .any(|accepted| mode.eq_ignore_ascii_case(accepted))
        })
    }

    /// Returns the entrypoint module for the current platform.
    ///
    /// The platform-specific field wins over `module`. Blank values are
    /// treated as unset.
    #[must_use]
    pub fn current_platform_module(&self) -> Option<&str> {
        #[cfg(target_os = "windows")]
        let specific = self.module_windows.as_deref();
        #[cfg(target_os = "linux")]
        let specific = self.module_linux.as_deref();
        #[cfg(target_os = "macos")]
        let specific = self.module_macos.as_deref();
        #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
        let specific: Option<&str> = None;

        non_blank(specific).or_else(|| non_blank(self.module.as_deref()))
    }

    /// Name used for ordering, falling back to the id.
    #[must_use]
    pub fn sort_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Source of installed add-on manifests.
pub trait AddonCatalog {
    /// Returns every installed add-on manifest, in no particular order.
    fn manifests(&self) -> Vec<AddonManifest>;
}

impl AddonCatalog for [AddonManifest] {
    fn manifests(&self) -> Vec<AddonManifest> {
        self.to_vec()
    }
}

impl AddonCatalog for Vec<AddonManifest> {
    fn manifests(&self) -> Vec<AddonManifest> {
        self.clone()
    }
}

/// Catalog that scans `<root>/*/addon.yaml`.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    /// Creates a catalog rooted at the given add-ons directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the scanned directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AddonCatalog for DirectoryCatalog {
    fn manifests(&self) -> Vec<AddonManifest> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read add-ons directory {:?}: {}", self.root, e);
                return Vec::new();
            }
        };

        let mut manifests = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let dir = entry.path();
            let manifest_path = dir.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }

            match load_manifest(&manifest_path) {
                Ok(mut manifest) => {
                    manifest.install_directory = dir;
                    manifests.push(manifest);
                }
                Err(e) => warn!("Skipping add-on manifest {:?}: {}", manifest_path, e),
            }
        }
        manifests
    }
}

/// Reads a single manifest file.
pub fn load_manifest(path: &Path) -> Result<AddonManifest, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read manifest: {}", e))?;
    let manifest: AddonManifest = serde_yaml::from_str(&content)
        .map_err(|e| format!("Failed to parse manifest: {}", e))?;

    if manifest.id.trim().is_empty() {
        return Err("Add-on id is required".to_string());
    }
    Ok(manifest)
}
