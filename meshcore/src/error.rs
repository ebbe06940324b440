//! Error taxonomy for auth, transport, command configuration and controller
//! faults.
//!
//! `meshcore` is `no_std`, so these are plain enums with a `Display` impl
//! rather than `std::error::Error` / `thiserror` types; callers on a hosted
//! target (`gateway-service`) wrap them with `thiserror` at the boundary.

use core::fmt;

/// Errors raised by [`crate::auth::AuthChannel`] sign/verify/handshake operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthError {
    /// Operation attempted in a phase that doesn't allow it (e.g. verify before handshake).
    WrongState,
    /// Nonce did not match the expected value.
    WrongNonce,
    /// MAC tag did not verify.
    WrongMac,
    /// Message too short/long for the operation.
    WrongSize,
    /// Nonce matched the previous (already-processed) nonce: re-ACK, don't re-execute.
    OldNonce,
    /// Output buffer too small to hold the result.
    BufferTooSmall,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthError::WrongState => "wrong auth state",
            AuthError::WrongNonce => "wrong nonce",
            AuthError::WrongMac => "wrong mac",
            AuthError::WrongSize => "wrong size",
            AuthError::OldNonce => "old nonce (re-ack)",
            AuthError::BufferTooSmall => "buffer too small",
        };
        f.write_str(s)
    }
}

/// Errors raised by [`crate::transport::MeshTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// No route installed for the destination.
    RouteMissing,
    /// Radio refused to accept the frame right now.
    RadioBusy,
    /// Payload exceeds the maximum on-air size.
    OversizePayload,
    /// Destination id is not a valid node id.
    InvalidDestination,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportError::RouteMissing => "no route to destination",
            TransportError::RadioBusy => "radio busy",
            TransportError::OversizePayload => "payload too large",
            TransportError::InvalidDestination => "invalid destination id",
        };
        f.write_str(s)
    }
}

/// Rejections of a `CONFIGURE_SENSOR` request (ack code `ACK_BADPARAM` et al.).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigureError {
    WrongSize,
    BadIndex,
    BadParam,
    NotSupported,
    BadState,
}

impl ConfigureError {
    /// The numeric ACK code a master expects for this rejection.
    pub const fn ack_code(self) -> u8 {
        match self {
            ConfigureError::WrongSize => 1,
            ConfigureError::BadIndex => 2,
            ConfigureError::BadParam => 3,
            ConfigureError::NotSupported => 4,
            ConfigureError::BadState => 5,
        }
    }
}

impl fmt::Display for ConfigureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigureError::WrongSize => "wrong size",
            ConfigureError::BadIndex => "bad channel index",
            ConfigureError::BadParam => "bad parameter",
            ConfigureError::NotSupported => "not supported",
            ConfigureError::BadState => "bad state",
        };
        f.write_str(s)
    }
}

/// Terminal faults of a [`crate::sensor_controller::SensorController`] that starve the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerFault {
    /// No persisted node id / keys available at boot.
    NotConfigured,
    /// No authenticated traffic from the master within `network_timeout` seconds.
    NetworkTimeout,
    /// The ADC task has not fed the software watchdog in time.
    AdcTaskHang,
    /// Status channel exceeded `max_status_retransmissions`.
    StatusRetransmitExhausted,
    /// The radio rejected initialization parameters.
    RadioInitFailure,
}

impl fmt::Display for ControllerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerFault::NotConfigured => "persisted config missing",
            ControllerFault::NetworkTimeout => "network timeout",
            ControllerFault::AdcTaskHang => "adc task hang",
            ControllerFault::StatusRetransmitExhausted => "status retransmission limit reached",
            ControllerFault::RadioInitFailure => "radio init failure",
        };
        f.write_str(s)
    }
}
