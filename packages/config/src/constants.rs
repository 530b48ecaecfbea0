// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Dappbox

// Server Configuration
pub const DAPPBOX_HOST: &str = "DAPPBOX_HOST";
pub const DAPPBOX_PORT: &str = "DAPPBOX_PORT";
pub const PORT: &str = "PORT"; // Legacy

// CORS Configuration
pub const DAPPBOX_CORS_ORIGIN: &str = "DAPPBOX_CORS_ORIGIN";
pub const CORS_ORIGIN: &str = "CORS_ORIGIN"; // Legacy

// Logging
pub const DAPPBOX_LOG_FORMAT: &str = "DAPPBOX_LOG_FORMAT";

// Provider Selection
pub const DAPPBOX_PROVIDER: &str = "DAPPBOX_PROVIDER";
pub const DAPPBOX_PUBLIC_HOST: &str = "DAPPBOX_PUBLIC_HOST";
pub const DAPPBOX_REAPER_INTERVAL_SECS: &str = "DAPPBOX_REAPER_INTERVAL_SECS";

// Sandbox Layout
pub const DAPPBOX_CODE_ROOT: &str = "DAPPBOX_CODE_ROOT";
pub const DAPPBOX_CLIENT_PREFIX: &str = "DAPPBOX_CLIENT_PREFIX";
pub const DAPPBOX_DEV_PORT: &str = "DAPPBOX_DEV_PORT";
pub const DAPPBOX_EXCLUDED_DIRS: &str = "DAPPBOX_EXCLUDED_DIRS";

// Sandbox Image & Resources
pub const DAPPBOX_IMAGE: &str = "DAPPBOX_IMAGE";
pub const DAPPBOX_SETUP_COMMANDS: &str = "DAPPBOX_SETUP_COMMANDS";
pub const DAPPBOX_CPU: &str = "DAPPBOX_CPU";
pub const DAPPBOX_MEMORY_MB: &str = "DAPPBOX_MEMORY_MB";
pub const DAPPBOX_KEEP_ALIVE_SECS: &str = "DAPPBOX_KEEP_ALIVE_SECS";
pub const DAPPBOX_SETTLE_DELAY_MS: &str = "DAPPBOX_SETTLE_DELAY_MS";

// Dev Server
pub const DAPPBOX_DEV_COMMAND: &str = "DAPPBOX_DEV_COMMAND";
pub const DAPPBOX_INSTALL_COMMAND: &str = "DAPPBOX_INSTALL_COMMAND";
pub const DAPPBOX_LOG_BUFFER_LINES: &str = "DAPPBOX_LOG_BUFFER_LINES";

// File Sync
pub const DAPPBOX_PAGE_LIMIT_DEFAULT: &str = "DAPPBOX_PAGE_LIMIT_DEFAULT";
pub const DAPPBOX_PAGE_LIMIT_MAX: &str = "DAPPBOX_PAGE_LIMIT_MAX";
pub const DAPPBOX_GZIP_THRESHOLD_BYTES: &str = "DAPPBOX_GZIP_THRESHOLD_BYTES";

// Status Events
pub const DAPPBOX_EVENT_POLL_SECS: &str = "DAPPBOX_EVENT_POLL_SECS";
