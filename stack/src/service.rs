//! Service layer placeholder.
//!
//! Request/reply services are not part of this runtime; the init step
//! exists to keep the stack's fixed bring-up order.

use crate::StackError;
use tracing::debug;

/// Bring up the (empty) service layer.
pub fn init() -> Result<(), StackError> {
    debug!("service: no services registered");
    Ok(())
}
