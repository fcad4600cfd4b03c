//! Shared fixtures for the add-on host integration tests.
//!
//! Each fixture installs the `addon-echo` binary into its own add-on
//! directory under a throwaway catalog root.

#![allow(dead_code, clippy::expect_used)]

use std::fs;
use std::path::{Path, PathBuf};

use addon_host::{AddonManifest, HostConfig, LogConfig};
use tempfile::TempDir;

/// Path of the compiled reference add-on.
pub fn echo_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_addon-echo"))
}

/// File name the reference add-on is installed under.
pub fn echo_module() -> String {
    format!("addon-echo{}", std::env::consts::EXE_SUFFIX)
}

/// Host settings tuned for tests: short timeouts, no file logging.
pub fn test_config() -> HostConfig {
    HostConfig {
        invoke_timeout_ms: 3000,
        logging: LogConfig {
            enabled: false,
            ..LogConfig::default()
        },
        ..HostConfig::default()
    }
}

/// A catalog root holding installed copies of the reference add-on.
pub struct AddonFixture {
    root: TempDir,
}

impl AddonFixture {
    pub fn new() -> Self {
        // Under the target dir so the binary can be hard linked rather than
        // copied; a freshly written executable can fail to exec with ETXTBSY.
        let root = tempfile::Builder::new()
            .prefix("addon-host-")
            .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
            .expect("create catalog root");
        Self { root }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Path for a marker file used by `--fail-once`.
    pub fn marker(&self, name: &str) -> PathBuf {
        self.root.path().join(format!("{}.marker", name))
    }

    /// Installs the reference add-on as `id` and writes its `addon.yaml`.
    pub fn install(&self, id: &str, name: &str, arguments: &[&str]) -> AddonManifest {
        self.install_with_mode(id, name, "OutOfProcess", arguments)
    }

    pub fn install_with_mode(
        &self,
        id: &str,
        name: &str,
        mode: &str,
        arguments: &[&str],
    ) -> AddonManifest {
        let dir = self.root.path().join(id);
        fs::create_dir_all(&dir).expect("create install dir");

        let target = dir.join(echo_module());
        if fs::hard_link(echo_binary(), &target).is_err() {
            fs::copy(echo_binary(), &target).expect("install add-on binary");
        }

        let arguments: Vec<String> = arguments.iter().map(|a| (*a).to_string()).collect();
        let yaml = format!(
            "Id: {id}\nName: {name}\nMode: {mode}\nModule: {module}\nArguments: {args}\n",
            module = echo_module(),
            args = serde_json::to_string(&arguments).expect("encode arguments"),
        );
        fs::write(dir.join("addon.yaml"), yaml).expect("write manifest");

        AddonManifest {
            id: id.to_string(),
            name: name.to_string(),
            mode: Some(mode.to_string()),
            install_directory: dir,
            module: Some(echo_module()),
            arguments,
            ..AddonManifest::default()
        }
    }
}
