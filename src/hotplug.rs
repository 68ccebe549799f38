//! Kernel uevent listener used between attach attempts on Linux. Only
//! `ACTION=add` events carrying a hex `PRODUCT=vid/pid/...` attribute are
//! of interest; everything else on the multicast group is ignored.

use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::{Context as _, Result};
use log::{debug, info};
use nix::errno::Errno;
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use nix::sys::time::TimeVal;

use crate::usb::COMPATIBLE_VENDOR_IDS;
use crate::util::shutdown::Shutdown;

/// Block until a compatible device is plugged in or `stop` fires. With a
/// target pair only that exact device matches; otherwise any compatible
/// vendor does. Returns whether a device event arrived.
pub fn wait_for_device(target: Option<(u16, u16)>, stop: &Shutdown) -> Result<bool> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Datagram,
        SockFlag::empty(),
        SockProtocol::NetlinkKObjectUEvent,
    )
    .context("opening uevent socket")?;
    // Wake up once a second so shutdown stays responsive.
    nix::sys::socket::setsockopt(&fd, nix::sys::socket::sockopt::ReceiveTimeout, &TimeVal::new(1, 0))
        .context("setting uevent receive timeout")?;
    bind(
        fd.as_raw_fd(),
        &NetlinkAddr::new(std::process::id(), u32::MAX),
    )
    .context("binding uevent socket")?;

    let mut buf = [0u8; 512];
    while !stop.is_set() {
        let len = match recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(0) => continue,
            Ok(len) => len,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("receiving uevent"),
        };
        let (vid, pid) = match parse_uevent(&buf[..len]) {
            Some(event) => event,
            None => continue,
        };
        if !COMPATIBLE_VENDOR_IDS.contains(&vid) {
            debug!("ignoring incompatible device {:04x}:{:04x}", vid, pid);
            continue;
        }
        if let Some(wanted) = target {
            if wanted != (vid, pid) {
                debug!("ignoring {:04x}:{:04x}, waiting for {:04x}:{:04x}", vid, pid, wanted.0, wanted.1);
                continue;
            }
        }
        info!("device added: {:04x}:{:04x}", vid, pid);
        return Ok(true);
    }
    Ok(false)
}

/// A uevent datagram is a null-separated list of KEY=VALUE lines. An add
/// action with a `PRODUCT=vid/pid/...` attribute yields the new device's
/// ids.
fn parse_uevent(data: &[u8]) -> Option<(u16, u16)> {
    let text = String::from_utf8_lossy(data);
    let mut action = None;
    let mut product = None;
    for line in text.split('\0') {
        if let Some((key, value)) = line.split_once('=') {
            match key {
                "ACTION" => action = Some(value),
                "PRODUCT" => product = Some(value),
                _ => {}
            }
        }
    }
    if action? != "add" {
        return None;
    }
    let mut parts = product?.split('/');
    let vid = u16::from_str_radix(parts.next()?, 16).ok()?;
    let pid = u16::from_str_radix(parts.next()?, 16).ok()?;
    Some((vid, pid))
}
