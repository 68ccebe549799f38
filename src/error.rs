use thiserror::Error;

/// Device-scoped failures raised while bringing a device into accessory
/// mode. Session-scoped socket errors never surface here; they are
/// contained by the multiplexer and reported to the peer in-band.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no matching USB device available")]
    DeviceUnavailable,

    #[error("device did not re-enumerate with an accessory product id")]
    ModeSwitchFailed,

    #[error("device truncated identity string {index}")]
    IdentityTruncated { index: u8 },

    #[error("interface 0 exposes no bulk IN/OUT endpoint pair")]
    EndpointsMissing,

    #[error("usb: {0}")]
    Usb(#[from] rusb::Error),
}
