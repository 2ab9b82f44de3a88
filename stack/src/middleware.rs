//! Middleware placeholder.
//!
//! Pub/sub delivery happens directly in [`crate::pubsub`]; the init step
//! exists to keep the stack's fixed bring-up order.

use crate::StackError;
use tracing::debug;

/// Bring up the (empty) middleware layer.
pub fn init() -> Result<(), StackError> {
    debug!("middleware: using direct pub/sub delivery");
    Ok(())
}
