//! Add-on Host
//!
//! Runs launcher add-ons as separate OS processes and talks to them over
//! newline-delimited JSON on stdin/stdout.
//!
//! # Architecture
//!
//! - **Addon Module**: Manifest resolution, RPC transport, per add-on
//!   supervision and the host registry
//! - **Config Module**: `~/.addon-host/config.toml` loading
//! - **Logging Module**: File logging through `tracing`
//!
//! # Usage
//!
//! ```no_run
//! use addon_host::{AddonHost, DirectoryCatalog, HostConfig};
//!
//! # async fn run() {
//! let config = HostConfig::default();
//! let catalog = DirectoryCatalog::new(config.addons_dir());
//! let host = AddonHost::new(config);
//! let failures = host.start_all_enabled(&catalog).await;
//! for (id, error) in &failures {
//!     eprintln!("{id}: {error}");
//! }
//! host.dispose().await;
//! # }
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod addon;
pub mod config;
pub mod logging;

// Re-export main types
pub use addon::{AddonError, AddonHost, AddonInstance, AddonManifest, DirectoryCatalog, ErrorKind};
pub use config::HostConfig;
pub use logging::LogConfig;
