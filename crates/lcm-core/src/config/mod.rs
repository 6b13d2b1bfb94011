//! Configuration system — `.model` readers, precedence resolver, and schema.
//!
//! # Usage
//! ```no_run
//! use lcm_core::config::{self, Overrides};
//!
//! let cfg = config::resolve(
//!     &Overrides::new().with("model", "llama3.2"),
//!     Some(&config::default_project_path()),
//!     config::default_home_path().as_deref(),
//!     &config::process_environment(),
//! )?;
//! println!("Model: {}", cfg.model);
//! # Ok::<(), lcm_core::LcmError>(())
//! ```

pub mod loader;
pub mod schema;

// Re-export key types
pub use loader::{
    default_home_path, default_project_path, interpolate, lookup, parse_settings,
    process_environment, read_environment, read_settings_file, resolve, resolve_sources,
};
pub use schema::{
    AcceleratorProbe, ConfigSource, Device, Overrides, ProviderId, ResolvedConfig, RuntimeKind,
    Setting, SettingSource, RECOGNIZED_KEYS,
};
