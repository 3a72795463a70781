//! Constants used across the Kiln workspace.

/// The filename for Kiln's project configuration.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Name of the top-level aggregate task.
pub const DEFAULT_TASK: &str = "default";

/// Configuration key mapping config sections to bundle categories.
pub const BUNDLE_TYPES_KEY: &str = "bundle_types";

/// Default root for generated artifacts.
pub const DEFAULT_DESTINATION: &str = "dist";

/// Environment variable overriding the configured build environment.
pub const ENV_OVERRIDE: &str = "KILN_ENV";

/// Environment variable carrying an allocated dev-server port to external tools.
pub const PORT_ENV: &str = "KILN_PORT";

/// Prefix of executables probed as subprocess presets.
pub const SUBPROCESS_PRESET_PREFIX: &str = "kiln-preset-";

/// Temporary file handed to the test runner.
pub const TEST_CONFIG_FILE: &str = "kiln-test-config.json";

pub const DEFAULT_DEBOUNCE_MS: u64 = 200;
pub const DEFAULT_PORT_BASE: u16 = 3000;
