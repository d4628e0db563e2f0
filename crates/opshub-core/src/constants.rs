//! Configuration constants for the connection lifecycle core.

use std::time::Duration;

// =============================================================================
// Connection Constants
// =============================================================================

/// Default SSH port when the machine record omits one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default MongoDB port when the instance record omits one.
pub const DEFAULT_MONGO_PORT: u16 = 27017;

/// Dial timeout for one hop (direct or through a tunnel).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// SSH keepalive interval for cached clients.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum tunnel chain depth accepted by the resolver.
pub const MAX_TUNNEL_DEPTH: usize = 8;

// =============================================================================
// Terminal Constants
// =============================================================================

/// Terminal type requested for remote ptys.
pub const TERM_TYPE: &str = "xterm-256color";

/// Maximum terminal columns.
pub const MAX_TERMINAL_COLS: u16 = 500;

/// Maximum terminal rows.
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Depth of the pty command and output channels.
pub const PTY_CHANNEL_DEPTH: usize = 256;

/// Length of the random terminal session token in bytes.
pub const SESSION_TOKEN_LEN: usize = 16;

// =============================================================================
// Stats Constants
// =============================================================================

/// Interval between stats collection cycles.
pub const STATS_INTERVAL: Duration = Duration::from_secs(120);

/// Time-to-live for a cached stats snapshot.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(300);

/// Timeout for one remote introspection command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

// =============================================================================
// Recording Constants
// =============================================================================

/// File extension of replay logs.
pub const RECORDING_EXT: &str = "rec";

/// Maximum payload size of one replay-log record (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;
