use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use log::{debug, error, info, warn};
use rusb::{Context, DeviceHandle, UsbContext};

use crate::frame::{CommandSink, FrameDecoder, CMD_CLOSE_ACCESSORY};
use crate::mux::{InboundDispatcher, SessionMux, SCRATCH_LEN};
use crate::usb::{self, AccessoryDevice};
use crate::util::shutdown::Shutdown;

const BULK_IN_LEN: usize = 16384;
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Serialized writer for the bulk-OUT endpoint. Both worker threads reply
/// through this; the mutex keeps frames from interleaving on the wire.
struct UsbCommandSink {
    handle: Arc<DeviceHandle<Context>>,
    ep_out: u8,
    write_lock: Mutex<()>,
}

impl CommandSink for UsbCommandSink {
    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let written = self
            .handle
            .write_bulk(self.ep_out, frame, WRITE_TIMEOUT)
            .context("usb bulk write")?;
        if written != frame.len() {
            bail!("short bulk write: {} of {} bytes", written, frame.len());
        }
        Ok(())
    }
}

/// One attached accessory device and its two workers: the USB-read loop
/// feeding the frame decoder, and the socket-read loop driving the
/// multiplexer's selector. Lives from a successful open until `run`
/// returns; reconnection is the caller's job.
pub struct Accessory {
    device: AccessoryDevice,
    mux: Arc<SessionMux>,
    sink: Arc<UsbCommandSink>,
    shutdown: Arc<Shutdown>,
    workers: Vec<JoinHandle<()>>,
}

impl Accessory {
    /// Enumerate, switch into accessory mode if needed, and spawn both
    /// workers. On success the bridge is live.
    pub fn open(target: Option<(u16, u16)>) -> Result<Self> {
        let ctx = Context::new().context("libusb initialization failed")?;
        let device = usb::open_accessory(&ctx, target).context("attaching accessory device")?;

        let shutdown = Arc::new(Shutdown::new());
        let sink = Arc::new(UsbCommandSink {
            handle: device.handle.clone(),
            ep_out: device.ep_out,
            write_lock: Mutex::new(()),
        });
        let dyn_sink: Arc<dyn CommandSink> = sink.clone();
        let mux = Arc::new(SessionMux::new(dyn_sink, shutdown.clone()));

        let mut workers = Vec::with_capacity(2);
        {
            let handle = device.handle.clone();
            let ep_in = device.ep_in;
            let mux = mux.clone();
            let shutdown = shutdown.clone();
            workers.push(
                thread::Builder::new()
                    .name("usb-read".into())
                    .spawn(move || usb_read_loop(handle, ep_in, mux, shutdown))
                    .context("spawning usb-read worker")?,
            );
        }
        {
            let mux = mux.clone();
            let shutdown = shutdown.clone();
            workers.push(
                thread::Builder::new()
                    .name("socket-read".into())
                    .spawn(move || socket_read_loop(mux, shutdown))
                    .context("spawning socket-read worker")?,
            );
        }

        Ok(Self {
            device,
            mux,
            sink,
            shutdown,
            workers,
        })
    }

    /// Idle until the peer requests close, a fatal USB error ends the read
    /// loop, or `external` (the process-level signal) fires. Always tears
    /// the runtime down before returning.
    pub fn run(&mut self, external: &Shutdown) -> Result<()> {
        while !external.is_set() && !self.shutdown.is_set() {
            self.shutdown.wait_timeout(Duration::from_millis(500));
        }
        self.stop();
        Ok(())
    }

    fn stop(&mut self) {
        info!("stopping accessory");
        if self.mux.take_app_connected() {
            info!("sending termination command to the app");
            if let Err(err) = self.sink.send_empty(CMD_CLOSE_ACCESSORY) {
                warn!("unable to send close command: {:#}", err);
            }
        }
        self.shutdown.request();
        // Let in-flight transfers drain before the sockets go away.
        thread::sleep(Duration::from_secs(1));
        self.mux.disconnect_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        if let Err(err) = self.device.handle.release_interface(0) {
            debug!("release_interface: {}", err);
        }
    }
}

/// Bulk-IN loop: every received chunk goes straight to the frame decoder,
/// which dispatches completed frames into the multiplexer. Timeouts are
/// routine; any other USB error is fatal to this runtime and requests
/// shutdown so the outer driver can re-attach.
fn usb_read_loop(
    handle: Arc<DeviceHandle<Context>>,
    ep_in: u8,
    mux: Arc<SessionMux>,
    shutdown: Arc<Shutdown>,
) {
    let mut decoder = FrameDecoder::new();
    let mut dispatcher = InboundDispatcher::new(mux);
    let mut buf = vec![0u8; BULK_IN_LEN];
    while !shutdown.is_set() {
        match handle.read_bulk(ep_in, &mut buf, READ_TIMEOUT) {
            Ok(0) => continue,
            Ok(n) => decoder.feed(&buf[..n], &mut dispatcher),
            Err(rusb::Error::Timeout) => continue,
            Err(err) => {
                if !shutdown.is_set() {
                    error!("bulk read failed: {}", err);
                }
                break;
            }
        }
    }
    shutdown.request();
    debug!("usb-read worker exiting");
}

/// Selector loop: one multiplexer cycle at a time until shutdown.
fn socket_read_loop(mux: Arc<SessionMux>, shutdown: Arc<Shutdown>) {
    let mut scratch = vec![0u8; SCRATCH_LEN];
    while !shutdown.is_set() {
        mux.selector_cycle(&mut scratch);
    }
    debug!("socket-read worker exiting");
}
