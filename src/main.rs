use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use log::{error, info, warn};

mod accessory;
mod buffer;
mod error;
mod frame;
#[cfg(target_os = "linux")]
mod hotplug;
mod mux;
mod usb;
mod util;

use crate::accessory::Accessory;
use crate::util::logging::init_logger;
use crate::util::shutdown::Shutdown;

#[derive(Debug, Parser)]
#[command(
    name = "aoabridge",
    version,
    about = "Forward Android accessory sockets to a local TCP service"
)]
struct Cli {
    /// Vendor id of the device to attach, hex (e.g. 18d1). Omit both ids
    /// to auto-detect any compatible Android device.
    #[arg(requires = "product_id")]
    vendor_id: Option<String>,

    /// Product id of the device to attach, hex
    #[arg(requires = "vendor_id")]
    product_id: Option<String>,

    /// Verbose logging (repeat for trace)
    #[arg(long, short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let target = parse_target(&cli)?;
    let stop = Arc::new(Shutdown::new());
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            eprintln!("exiting...");
            stop.request();
        })
        .context("installing signal handler")?;
    }

    while !stop.is_set() {
        match Accessory::open(target) {
            Ok(mut accessory) => {
                if let Err(err) = accessory.run(&stop) {
                    error!("runtime error: {:#}", err);
                }
            }
            Err(err) => error!("unable to attach: {:#}", err),
        }
        if stop.is_set() {
            break;
        }
        wait_for_next_device(target, &stop);
    }
    Ok(())
}

/// Both hex ids, validated against the vendor tables, or None for
/// auto-detection. Requesting an accessory-mode pair is refused; the
/// handshake needs the device's standard ids.
fn parse_target(cli: &Cli) -> Result<Option<(u16, u16)>> {
    let (vendor, product) = match (&cli.vendor_id, &cli.product_id) {
        (Some(vendor), Some(product)) => (vendor, product),
        _ => return Ok(None),
    };
    let vid = parse_hex_id(vendor)?;
    let pid = parse_hex_id(product)?;
    if !usb::COMPATIBLE_VENDOR_IDS.contains(&vid) {
        bail!("vendor id {:04x} is not a compatible Android vendor", vid);
    }
    if vid == usb::ACCESSORY_VID && usb::is_accessory_pid(pid) {
        bail!(
            "{:04x}:{:04x} is an accessory-mode pair; use the device's standard ids",
            vid,
            pid
        );
    }
    Ok(Some((vid, pid)))
}

fn parse_hex_id(id: &str) -> Result<u16> {
    u16::from_str_radix(id.trim_start_matches("0x"), 16)
        .with_context(|| format!("invalid hex id {:?}", id))
}

#[cfg(target_os = "linux")]
fn wait_for_next_device(target: Option<(u16, u16)>, stop: &Shutdown) {
    info!("waiting for the next compatible device");
    match hotplug::wait_for_device(target, stop) {
        Ok(true) => {}
        Ok(false) => {} // shutdown requested
        Err(err) => {
            warn!("uevent listener failed: {:#}; retrying in 5s", err);
            stop.wait_timeout(Duration::from_secs(5));
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn wait_for_next_device(_target: Option<(u16, u16)>, stop: &Shutdown) {
    info!("retrying in 5s");
    stop.wait_timeout(Duration::from_secs(5));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(vendor: Option<&str>, product: Option<&str>) -> Cli {
        Cli {
            vendor_id: vendor.map(str::to_owned),
            product_id: product.map(str::to_owned),
            verbose: 0,
        }
    }

    #[test]
    fn no_ids_means_auto_detect() {
        assert_eq!(parse_target(&cli(None, None)).unwrap(), None);
    }

    #[test]
    fn hex_pair_is_parsed() {
        let target = parse_target(&cli(Some("18d1"), Some("4ee7"))).unwrap();
        assert_eq!(target, Some((0x18d1, 0x4ee7)));
        // A 0x prefix is tolerated.
        let target = parse_target(&cli(Some("0x04e8"), Some("0x6860"))).unwrap();
        assert_eq!(target, Some((0x04e8, 0x6860)));
    }

    #[test]
    fn unknown_vendor_is_rejected() {
        assert!(parse_target(&cli(Some("dead"), Some("beef"))).is_err());
    }

    #[test]
    fn accessory_pair_is_rejected() {
        assert!(parse_target(&cli(Some("18d1"), Some("2d01"))).is_err());
        // The same pid under another vendor is not an accessory pair.
        assert!(parse_target(&cli(Some("04e8"), Some("2d01"))).is_ok());
    }

    #[test]
    fn garbage_hex_is_rejected() {
        assert!(parse_target(&cli(Some("18d1"), Some("xyz"))).is_err());
    }
}
