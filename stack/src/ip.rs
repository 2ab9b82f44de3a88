//! IP layer placeholder.
//!
//! Mesh traffic rides directly on L2 in this runtime; the init step exists
//! to keep the stack's fixed bring-up order.

use crate::StackError;
use tracing::debug;

/// Bring up the (empty) IP layer.
pub fn init() -> Result<(), StackError> {
    debug!("ip: no address configuration on the simulated fabric");
    Ok(())
}
