//! Protocol-wide constants and defaults.
//!
//! These are configuration defaults, not protocol constants: any port or
//! host works as long as both ends agree on it.

use std::time::Duration;

// ============================================================================
// Network defaults
// ============================================================================

/// Default port an OS2L client dials when discovery is not in use.
pub const DEFAULT_CLIENT_PORT: u16 = 1504;

/// Default host an OS2L client dials when discovery is not in use.
pub const DEFAULT_CLIENT_HOST: &str = "local";

/// Default port an OS2L server listens on.
pub const DEFAULT_SERVER_PORT: u16 = 1503;

/// DNS-SD service type under which OS2L servers advertise themselves.
pub const SERVICE_TYPE: &str = "os2l";

// ============================================================================
// Timing
// ============================================================================

/// Default delay between automatic reconnect attempts.
///
/// Reconnection is attempted forever at this fixed interval — there is no
/// backoff and no attempt cap. Only an explicit close during the retry
/// window stops the loop.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(1000);
