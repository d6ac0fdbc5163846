//! Link queries: signal strength and MTU negotiation.

use std::ops::RangeInclusive;
use tracing::{debug, info};

use crate::ble::connection::DEFAULT_MTU;
use crate::ble::session::GattSession;
use crate::error::{Error, Result};

/// Smallest ATT MTU a link can have.
pub const MIN_MTU: u16 = DEFAULT_MTU;

/// Largest ATT MTU a request may ask for.
pub const MAX_MTU: u16 = 517;

/// Valid MTU request range.
pub const MTU_RANGE: RangeInclusive<u16> = MIN_MTU..=MAX_MTU;

impl GattSession {
    /// Read the signal strength of a connected device in dBm.
    pub async fn read_rssi(&self, address: &str) -> Result<i16> {
        let connection = self.connections().connected(address)?;

        let rssi = self
            .guarded(
                &connection,
                "read_rssi",
                self.backend().read_rssi(connection.address()),
            )
            .await?;

        debug!("RSSI of {}: {} dBm", connection.address(), rssi);
        Ok(rssi)
    }

    /// Request an ATT MTU and return the value the link settled on.
    ///
    /// The negotiated MTU bounds later writes to `mtu - 3` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] if `mtu` is outside `23..=517`.
    pub async fn set_mtu(&self, address: &str, mtu: u16) -> Result<u16> {
        if !MTU_RANGE.contains(&mtu) {
            return Err(Error::invalid_parameter("mtu", mtu));
        }

        let connection = self.connections().connected(address)?;

        let negotiated = self
            .guarded(
                &connection,
                "set_mtu",
                self.backend().request_mtu(connection.address(), mtu),
            )
            .await?
            .clamp(MIN_MTU, MAX_MTU);

        connection.set_mtu(negotiated);
        info!(
            "MTU of {} is now {} (requested {})",
            connection.address(),
            negotiated,
            mtu
        );
        Ok(negotiated)
    }
}
