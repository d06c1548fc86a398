//! Startup precondition: refuse to run on a host with IPv6 disabled.

use relay64_core::{RelayError, RelayResult};
use std::path::Path;
use tracing::debug;

/// Check the kernel's `disable_ipv6` flag at `flag_path`.
///
/// A missing file means the host does not expose the flag (non-Linux, or
/// IPv6 compiled in without sysctl), and the check passes.
///
/// # Errors
///
/// [`RelayError::Ipv6Disabled`] when the flag reads `1`, or
/// [`RelayError::Io`] when the file exists but cannot be read.
pub fn check_ipv6_enabled(flag_path: &Path) -> RelayResult<()> {
    if !flag_path.exists() {
        debug!(path = %flag_path.display(), "IPv6 flag not present, skipping check");
        return Ok(());
    }

    let value = std::fs::read_to_string(flag_path)?;
    if value.trim() == "1" {
        return Err(RelayError::Ipv6Disabled(flag_path.to_path_buf()));
    }

    debug!(path = %flag_path.display(), "IPv6 enabled");
    Ok(())
}
