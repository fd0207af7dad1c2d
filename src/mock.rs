//! Simulated serial devices, useful to test routing without actual serial ports.
//!
//! A [`MockDriver`] is a bus of named devices.
//! Every successful open of a device yields a [`MockLink`] for the router side,
//! while the far end of the same link is handed to whoever holds the device's [`MockPort`].
//! Writing into the far end is data arriving on the port,
//! reading from it is data the router sent out.

use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::mpsc,
};
use tracing::{debug, trace};

use crate::{
    config::{normalize_port, PortConfig},
    port::{open_blocking, Link, PortDriver},
};

/// How many bytes may be in flight in each direction of a link.
const LINK_BUFFER: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Counters {
    unplugged: bool,
    fail_next_opens: usize,
    hang_opens: bool,
    block_opens: Option<Duration>,
    open_attempts: usize,
    open_handles: usize,
    max_concurrent_handles: usize,
}

#[derive(Debug)]
struct Device {
    name: String,
    peers: mpsc::UnboundedSender<DuplexStream>,
    counters: Mutex<Counters>,
}

impl Device {
    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Opening {
    Ready(io::Result<MockLink>),
    Hang,
}

/// A bus of simulated serial devices.
///
/// Clones share the same devices.
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    devices: Arc<Mutex<HashMap<String, Arc<Device>>>>,
}

impl MockDriver {
    /// Attach a new device called `name`, replacing any previous one with that name.
    pub fn plug(&self, name: &str) -> MockPort {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let device = Arc::new(Device {
            name: normalize_port(name),
            peers,
            counters: Mutex::new(Counters::default()),
        });

        debug!(name = %device.name, "Plugged mock device");

        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.name.clone(), device.clone());

        MockPort { device, peer_rx }
    }

    fn device(&self, name: &str) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize_port(name))
            .cloned()
    }

    fn try_open(&self, name: &str) -> Opening {
        let Some(device) = self.device(name) else {
            return Opening::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such device `{name}`"),
            )));
        };

        let mut counters = device.counters();
        counters.open_attempts += 1;

        if counters.unplugged {
            return Opening::Ready(Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("`{name}` is unplugged"),
            )));
        }

        if counters.hang_opens {
            trace!(name, "Open will hang");
            return Opening::Hang;
        }

        if counters.fail_next_opens > 0 {
            counters.fail_next_opens -= 1;
            return Opening::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "simulated open failure",
            )));
        }

        if counters.open_handles > 0 {
            return Opening::Ready(Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "Access is denied",
            )));
        }

        let (near, far) = tokio::io::duplex(LINK_BUFFER);

        // The device's owner may have gone away, the link still works as a sink.
        let _ = device.peers.send(far);

        counters.open_handles += 1;
        counters.max_concurrent_handles = counters
            .max_concurrent_handles
            .max(counters.open_handles);
        drop(counters);

        Opening::Ready(Ok(MockLink {
            stream: near,
            device,
        }))
    }
}

impl PortDriver for MockDriver {
    type Link = MockLink;

    fn open(
        &self,
        config: &PortConfig,
    ) -> impl std::future::Future<Output = io::Result<Self::Link>> + Send {
        let block = self
            .device(&config.name)
            .and_then(|device| device.counters().block_opens);
        let driver = self.clone();
        let name = config.name.clone();

        async move {
            let opening = match block {
                Some(delay) => {
                    open_blocking(move || {
                        std::thread::sleep(delay);
                        Ok(driver.try_open(&name))
                    })
                    .await?
                }
                None => driver.try_open(&name),
            };

            match opening {
                Opening::Ready(result) => result,
                Opening::Hang => std::future::pending().await,
            }
        }
    }
}

/// The test side of a simulated device.
#[derive(Debug)]
pub struct MockPort {
    device: Arc<Device>,
    peer_rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MockPort {
    /// The device's name.
    pub fn name(&self) -> &str {
        &self.device.name
    }

    /// The far end of the next link opened on this device.
    ///
    /// Dropping it looks like a cable pull to the router.
    pub async fn next_peer(&mut self) -> Option<DuplexStream> {
        self.peer_rx.recv().await
    }

    /// Make the next `n` opens fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.device.counters().fail_next_opens = n;
    }

    /// Make opens never complete.
    pub fn hang_opens(&self, hang: bool) {
        self.device.counters().hang_opens = hang;
    }

    /// Make opens block the calling thread for `delay` before going ahead,
    /// the way a driver stuck in the OS does.
    pub fn block_opens(&self, delay: Option<Duration>) {
        self.device.counters().block_opens = delay;
    }

    /// Make the device disappear.
    ///
    /// Open links start failing and new opens fail until [`MockPort::replug`].
    pub fn unplug(&self) {
        self.device.counters().unplugged = true;
    }

    /// Undo [`MockPort::unplug`].
    pub fn replug(&self) {
        self.device.counters().unplugged = false;
    }

    /// How many times an open was attempted.
    pub fn open_attempts(&self) -> usize {
        self.device.counters().open_attempts
    }

    /// How many links are currently open.
    pub fn open_handles(&self) -> usize {
        self.device.counters().open_handles
    }

    /// The most links ever open at the same time.
    pub fn max_concurrent_handles(&self) -> usize {
        self.device.counters().max_concurrent_handles
    }
}

/// The router side of a simulated device.
#[derive(Debug)]
pub struct MockLink {
    stream: DuplexStream,
    device: Arc<Device>,
}

impl MockLink {
    fn check_plugged(&self) -> io::Result<()> {
        if self.device.counters().unplugged {
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("`{}` was unplugged", self.device.name),
            ))
        } else {
            Ok(())
        }
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        let mut counters = self.device.counters();
        counters.open_handles = counters.open_handles.saturating_sub(1);
    }
}

impl Link for MockLink {
    fn probe(&mut self) -> bool {
        self.check_plugged().is_ok()
    }
}

impl AsyncRead for MockLink {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_plugged()?;

        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockLink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_plugged()?;

        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
