use std::{fmt::Debug, future::Future, io, time::Duration};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::{config::PortConfig, error::PortError};

/// Largest chunk a single read returns.
pub const READ_CHUNK_SIZE: usize = 4096;

/// The connection state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PortState {
    /// No handle is held.
    #[default]
    Disconnected,

    /// An open is in progress.
    Connecting,

    /// A handle is held and usable.
    Connected,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PortState::Disconnected => "Disconnected",
            PortState::Connecting => "Connecting",
            PortState::Connected => "Connected",
        };

        write!(f, "{name}")
    }
}

/// An open, exclusively held port.
///
/// Dropping it releases the underlying device.
pub trait Link: AsyncRead + AsyncWrite + Debug + Unpin + Send + 'static {
    /// A cheap liveness check which does not wait on the device.
    fn probe(&mut self) -> bool;
}

/// Something which can open ports.
pub trait PortDriver: Clone + Debug + Send + Sync + 'static {
    /// What an opened port looks like.
    type Link: Link;

    /// Acquire the port described by `config`.
    fn open(&self, config: &PortConfig) -> impl Future<Output = io::Result<Self::Link>> + Send;
}

/// Run a synchronous open on the blocking pool.
///
/// The open may wedge inside the OS. Awaiting it here keeps the caller cancellable,
/// and whatever it eventually returns is dropped if nobody waits for it any more.
/// The blocking pool runs within the runtime, so the link may register with the reactor.
pub async fn open_blocking<T, F>(open: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(open)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// One endpoint, owned by a single worker.
///
/// Holds a live [`Link`] only while connected.
#[derive(Debug)]
pub struct PortConnection<D: PortDriver> {
    config: PortConfig,
    driver: D,
    link: Option<D::Link>,
}

impl<D: PortDriver> PortConnection<D> {
    /// A closed connection for the given port.
    pub fn new(driver: D, config: PortConfig) -> Self {
        Self {
            config,
            driver,
            link: None,
        }
    }

    /// The port name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// True while a handle is held.
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Acquire the port.
    ///
    /// Any previously held handle is released first.
    pub async fn open(&mut self) -> Result<(), PortError> {
        self.close();

        let link = self
            .driver
            .open(&self.config)
            .await
            .map_err(|source| PortError::Connect {
                port: self.config.name.clone(),
                source,
            })?;

        debug!(port = %self.config.name, baud = self.config.baud, "Opened");
        self.link = Some(link);

        Ok(())
    }

    /// Read whatever is available, waiting at most `timeout` for something to arrive.
    ///
    /// Nothing arriving in time is not an error, an empty chunk is returned.
    pub async fn read_chunk(&mut self, timeout: Duration) -> Result<Bytes, PortError> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| PortError::NotOpen(self.config.name.clone()))?;

        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

        match tokio::time::timeout(timeout, link.read_buf(&mut buf)).await {
            Err(_elapsed) => Ok(Bytes::new()),
            Ok(Ok(0)) => Err(PortError::Disconnected(self.config.name.clone())),
            Ok(Ok(n)) => {
                trace!(port = %self.config.name, n, "Read");
                Ok(buf.freeze())
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Ok(Bytes::new()),
            Ok(Err(source)) => Err(PortError::Io {
                port: self.config.name.clone(),
                source,
            }),
        }
    }

    /// Write all of `chunk`, giving up after `deadline`.
    pub async fn write_chunk(&mut self, chunk: &[u8], deadline: Duration) -> Result<(), PortError> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| PortError::NotOpen(self.config.name.clone()))?;

        let write = async {
            link.write_all(chunk).await?;
            link.flush().await
        };

        let result = match tokio::time::timeout(deadline, write).await {
            Ok(result) => result,
            Err(_elapsed) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write did not complete within {deadline:?}"),
            )),
        };

        result.map_err(|source| PortError::Io {
            port: self.config.name.clone(),
            source,
        })?;

        trace!(port = %self.config.name, n = chunk.len(), "Wrote");

        Ok(())
    }

    /// True if a handle is held and the device still answers.
    pub fn probe(&mut self) -> bool {
        self.link.as_mut().map(Link::probe).unwrap_or(false)
    }

    /// Release the handle, if any.
    ///
    /// Safe to call in any state.
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            debug!(port = %self.config.name, "Closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::mock::MockDriver;

    const TIMEOUT: Duration = Duration::from_millis(20);

    fn connection(driver: &MockDriver, name: &str) -> PortConnection<MockDriver> {
        PortConnection::new(driver.clone(), PortConfig::new(name, 115_200, TIMEOUT))
    }

    #[tokio::test]
    async fn read_write_roundtrip() {
        let driver = MockDriver::default();
        let mut device = driver.plug("COM1");
        let mut conn = connection(&driver, "COM1");

        conn.open().await.unwrap();
        let mut far = device.next_peer().await.unwrap();

        far.write_all(b"hello").await.unwrap();
        assert_eq!(conn.read_chunk(TIMEOUT).await.unwrap(), &b"hello"[..]);

        conn.write_chunk(b"world", TIMEOUT).await.unwrap();
        let mut buf = [0; 5];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn read_timeout_is_empty() {
        let driver = MockDriver::default();
        let _device = driver.plug("COM1");
        let mut conn = connection(&driver, "COM1");

        conn.open().await.unwrap();

        assert!(conn.read_chunk(TIMEOUT).await.unwrap().is_empty());
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn far_end_gone_is_disconnect() {
        let driver = MockDriver::default();
        let mut device = driver.plug("COM1");
        let mut conn = connection(&driver, "COM1");

        conn.open().await.unwrap();
        drop(device.next_peer().await.unwrap());

        assert!(matches!(
            conn.read_chunk(TIMEOUT).await,
            Err(PortError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn open_missing_device_fails() {
        let driver = MockDriver::default();
        let mut conn = connection(&driver, "COM9");

        assert!(matches!(
            conn.open().await,
            Err(PortError::Connect { .. })
        ));
        assert!(!conn.is_open());
        assert!(!conn.probe());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases() {
        let driver = MockDriver::default();
        let device = driver.plug("COM1");
        let mut conn = connection(&driver, "COM1");

        conn.open().await.unwrap();
        assert!(conn.probe());
        assert_eq!(device.open_handles(), 1);

        conn.close();
        conn.close();
        assert_eq!(device.open_handles(), 0);
        assert!(matches!(
            conn.write_chunk(b"x", TIMEOUT).await,
            Err(PortError::NotOpen(_))
        ));
    }

    #[tokio::test]
    async fn reopen_releases_previous_handle() {
        let driver = MockDriver::default();
        let device = driver.plug("COM1");
        let mut conn = connection(&driver, "COM1");

        conn.open().await.unwrap();
        conn.open().await.unwrap();

        assert_eq!(device.open_attempts(), 2);
        assert_eq!(device.max_concurrent_handles(), 1);
    }
}
