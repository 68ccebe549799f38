use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, Recipient, RequestType, UsbContext};

use crate::error::BridgeError;

/// Vendor ids of Android devices the bridge will attach to when invoked
/// without an explicit vid/pid pair.
pub const COMPATIBLE_VENDOR_IDS: &[u16] = &[
    0x18d1, // Google
    0x04e8, // Samsung
    0x0bb4, // HTC
    0x22b8, // Motorola
    0x1004, // LG
    0x0fce, // Sony
    0x12d1, // Huawei
    0x19d2, // ZTE
    0x2717, // Xiaomi
    0x0b05, // Asus
    0x2a70, // OnePlus
];

/// A device that has switched into accessory mode re-enumerates under the
/// Google vendor id with one of these product ids (accessory, +adb, audio
/// variants).
pub const ACCESSORY_VID: u16 = 0x18d1;
pub const ACCESSORY_PRODUCT_IDS: &[u16] = &[0x2d00, 0x2d01, 0x2d02, 0x2d03, 0x2d04, 0x2d05];

pub fn is_accessory_pid(product_id: u16) -> bool {
    ACCESSORY_PRODUCT_IDS.contains(&product_id)
}

// AOA vendor control requests on the default endpoint.
const REQ_GET_PROTOCOL: u8 = 51;
const REQ_SEND_STRING: u8 = 52;
const REQ_START_ACCESSORY: u8 = 53;
const REQ_SET_AUDIO_MODE: u8 = 58;

// Identity strings announced during the handshake, in wIndex order
// (manufacturer, model, description, version, uri, serial).
const IDENTITY_STRINGS: [&str; 6] = [
    "aoa-bridge",
    "TCP Port Forwarder",
    "Forwards accessory sockets to a local TCP service",
    "0.1.0",
    "https://github.com/aoa-bridge/aoa-bridge",
    "0000000012345678",
];

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const OPEN_RETRIES: u32 = 5;

/// An opened accessory-mode device with interface 0 claimed and both bulk
/// endpoint addresses resolved. The handle is shared between the reader
/// thread and the serialized writer.
pub struct AccessoryDevice {
    pub handle: Arc<DeviceHandle<Context>>,
    pub ep_in: u8,
    pub ep_out: u8,
}

/// Find a device, switch it into accessory mode if necessary, claim
/// interface 0 and resolve the bulk endpoints.
pub fn open_accessory(
    ctx: &Context,
    target: Option<(u16, u16)>,
) -> Result<AccessoryDevice, BridgeError> {
    let (handle, descriptor) = find_and_open(ctx, target)?;

    let handle = if is_accessory_pid(descriptor.product_id()) {
        info!(
            "device {:04x}:{:04x} already in accessory mode",
            descriptor.vendor_id(),
            descriptor.product_id()
        );
        handle
    } else {
        start_accessory_mode(&handle)?;
        drop(handle);
        // Give the device a moment to drop off the bus and come back.
        thread::sleep(Duration::from_secs(1));
        let (handle, descriptor) = find_and_open(ctx, None)?;
        if !is_accessory_pid(descriptor.product_id()) {
            return Err(BridgeError::ModeSwitchFailed);
        }
        info!(
            "device re-enumerated as accessory {:04x}:{:04x}",
            descriptor.vendor_id(),
            descriptor.product_id()
        );
        handle
    };

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        handle.set_auto_detach_kernel_driver(true).ok();
    }
    handle.claim_interface(0)?;
    // Pause so the Android side can react to the claim.
    thread::sleep(Duration::from_secs(1));

    let (ep_in, ep_out) = match find_bulk_endpoints(&handle.device()) {
        Ok(endpoints) => endpoints,
        Err(err) => {
            handle.release_interface(0).ok();
            return Err(err);
        }
    };
    info!("endpoints: IN {:#04x}, OUT {:#04x}", ep_in, ep_out);

    Ok(AccessoryDevice {
        handle: Arc::new(handle),
        ep_in,
        ep_out,
    })
}

/// One enumeration pass plus up to five one-second retries. With a target
/// pair the match is exact; otherwise any compatible vendor wins.
fn find_and_open(
    ctx: &Context,
    target: Option<(u16, u16)>,
) -> Result<(DeviceHandle<Context>, DeviceDescriptor), BridgeError> {
    let mut retries_left = OPEN_RETRIES;
    loop {
        if let Some(found) = scan_bus(ctx, target)? {
            return Ok(found);
        }
        if retries_left == 0 {
            return Err(BridgeError::DeviceUnavailable);
        }
        retries_left -= 1;
        thread::sleep(Duration::from_secs(1));
    }
}

fn scan_bus(
    ctx: &Context,
    target: Option<(u16, u16)>,
) -> Result<Option<(DeviceHandle<Context>, DeviceDescriptor)>, BridgeError> {
    for device in ctx.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        let wanted = match target {
            Some((vid, pid)) => {
                descriptor.vendor_id() == vid && descriptor.product_id() == pid
            }
            None => COMPATIBLE_VENDOR_IDS.contains(&descriptor.vendor_id()),
        };
        if !wanted {
            continue;
        }
        match device.open() {
            Ok(handle) => {
                info!(
                    "opened {:04x}:{:04x} (bus {} addr {})",
                    descriptor.vendor_id(),
                    descriptor.product_id(),
                    device.bus_number(),
                    device.address()
                );
                return Ok(Some((handle, descriptor)));
            }
            Err(err) => {
                debug!(
                    "unable to open {:04x}:{:04x}: {}",
                    descriptor.vendor_id(),
                    descriptor.product_id(),
                    err
                );
            }
        }
    }
    Ok(None)
}

/// The AOA vendor handshake. No interface claim is needed (or allowed) for
/// control transfers on the default endpoint.
fn start_accessory_mode(handle: &DeviceHandle<Context>) -> Result<(), BridgeError> {
    let read_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
    let write_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);

    let mut version = [0u8; 2];
    let n = handle.read_control(read_type, REQ_GET_PROTOCOL, 0, 0, &mut version, CONTROL_TIMEOUT)?;
    if n != 2 {
        warn!("short protocol-version read ({} bytes)", n);
        return Err(BridgeError::ModeSwitchFailed);
    }
    let adk_version = u16::from_le_bytes(version);
    info!("device reports AOA protocol version {}", adk_version);

    for (index, value) in IDENTITY_STRINGS.iter().enumerate() {
        let written = handle.write_control(
            write_type,
            REQ_SEND_STRING,
            0,
            index as u16,
            value.as_bytes(),
            CONTROL_TIMEOUT,
        )?;
        if written != value.len() {
            return Err(BridgeError::IdentityTruncated { index: index as u8 });
        }
    }

    if adk_version == 2 && cfg!(target_os = "linux") {
        // Announce two-channel audio; the audio endpoint itself is never
        // consumed here.
        handle.write_control(write_type, REQ_SET_AUDIO_MODE, 1, 0, &[], CONTROL_TIMEOUT)?;
    }

    handle.write_control(write_type, REQ_START_ACCESSORY, 0, 0, &[], CONTROL_TIMEOUT)?;
    Ok(())
}

/// Walk interface 0, alternate setting 0, taking the first endpoint with
/// the direction bit set as IN and the first without it as OUT.
fn find_bulk_endpoints(device: &Device<Context>) -> Result<(u8, u8), BridgeError> {
    let config = device.config_descriptor(0)?;
    let mut ep_in = None;
    let mut ep_out = None;
    for interface in config.interfaces() {
        if interface.number() != 0 {
            continue;
        }
        for setting in interface.descriptors() {
            if setting.setting_number() != 0 {
                continue;
            }
            for endpoint in setting.endpoint_descriptors() {
                let address = endpoint.address();
                if address & 0x80 == 0x80 {
                    ep_in.get_or_insert(address);
                } else {
                    ep_out.get_or_insert(address);
                }
            }
        }
    }
    match (ep_in, ep_out) {
        (Some(ep_in), Some(ep_out)) => Ok((ep_in, ep_out)),
        _ => Err(BridgeError::EndpointsMissing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessory_pid_classification() {
        for pid in ACCESSORY_PRODUCT_IDS {
            assert!(is_accessory_pid(*pid));
        }
        assert!(!is_accessory_pid(0x4ee7));
        assert!(COMPATIBLE_VENDOR_IDS.contains(&ACCESSORY_VID));
    }

    #[test]
    fn identity_strings_cover_all_six_indices() {
        assert_eq!(IDENTITY_STRINGS.len(), 6);
        assert!(IDENTITY_STRINGS.iter().all(|s| !s.is_empty()));
    }
}
