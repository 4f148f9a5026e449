pub mod devices;
pub mod sync;

use crate::error::RelayError;
use crate::storage::models::AuthedDevice;

/// Devices may only touch the ledger they registered for.
fn ensure_ledger(device: &AuthedDevice, ledger_id: &str) -> Result<(), RelayError> {
    if device.ledger_id == ledger_id {
        Ok(())
    } else {
        Err(RelayError::Forbidden(format!(
            "Device is not registered for ledger {}",
            ledger_id
        )))
    }
}
