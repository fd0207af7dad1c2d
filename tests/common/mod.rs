#![allow(dead_code)]

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serial_router::{
    config::{Config, PortConfig, RouterConfig},
    mock::{MockDriver, MockPort},
    router::Router,
    status::RouterStatus,
};
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    time::timeout,
};

pub const READ_TIMEOUT: Duration = Duration::from_millis(20);
pub const MAX_BACKOFF: Duration = Duration::from_millis(200);
pub const WAIT: Duration = Duration::from_secs(5);

pub const INCOMING: &str = "COM3";
pub const OUTGOING_A: &str = "COM131";
pub const OUTGOING_B: &str = "COM141";

#[macro_export]
macro_rules! assert_state {
    ($status:expr, $role:expr, $state:expr) => {
        assert_eq!(
            $status.worker($role).state,
            $state,
            "unexpected state for {}",
            $role
        );
    };
}

pub fn config_with_timeout(read_timeout: Duration) -> RouterConfig {
    RouterConfig::new(
        PortConfig::new(INCOMING, 115_200, read_timeout),
        [
            PortConfig::new(OUTGOING_A, 115_200, read_timeout),
            PortConfig::new(OUTGOING_B, 115_200, read_timeout),
        ],
        MAX_BACKOFF,
    )
    .with_pairing(Config::default().pairs)
}

pub fn config() -> RouterConfig {
    config_with_timeout(READ_TIMEOUT)
}

/// A router wired to three simulated devices.
pub struct Bench {
    pub router: Router<MockDriver>,
    pub incoming: MockPort,
    pub a: MockPort,
    pub b: MockPort,
}

impl Bench {
    pub fn new() -> Self {
        let driver = MockDriver::default();

        Self {
            incoming: driver.plug(INCOMING),
            a: driver.plug(OUTGOING_A),
            b: driver.plug(OUTGOING_B),
            router: Router::new(driver),
        }
    }

    pub fn devices(&self) -> [&MockPort; 3] {
        [&self.incoming, &self.a, &self.b]
    }

    /// Start routing and wait for every port to connect.
    ///
    /// Returns the far ends of the incoming, A and B ports.
    pub async fn start(&mut self) -> Result<[DuplexStream; 3]> {
        self.router.start(config())?;

        let incoming = peer(&mut self.incoming).await?;
        let a = peer(&mut self.a).await?;
        let b = peer(&mut self.b).await?;

        wait_until(&self.router, RouterStatus::all_connected).await?;

        Ok([incoming, a, b])
    }
}

/// The far end of the next link opened on `device`.
pub async fn peer(device: &mut MockPort) -> Result<DuplexStream> {
    timeout(WAIT, device.next_peer())
        .await?
        .ok_or_else(|| eyre!("Device {} is gone", device.name()))
}

pub async fn read_exactly(stream: &mut DuplexStream, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; n];
    timeout(WAIT, stream.read_exact(&mut buf)).await??;

    Ok(buf)
}

/// True if nothing arrives on `stream` within `quiet`.
pub async fn stays_silent(stream: &mut DuplexStream, quiet: Duration) -> bool {
    let mut buf = [0; 64];

    timeout(quiet, stream.read(&mut buf)).await.is_err()
}

pub async fn wait_until<F>(router: &Router<MockDriver>, predicate: F) -> Result<RouterStatus>
where
    F: Fn(&RouterStatus) -> bool,
{
    timeout(WAIT, async {
        loop {
            let status = router.status();
            if predicate(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| eyre!("Condition not met in time, last status: {:#?}", router.status()))
}
