use std::time::Duration;

use color_eyre::Result;
use pretty_assertions::assert_eq;
use serial_router::{port::PortState, status::WorkerRole};
use tokio::io::AsyncWriteExt;

mod common;
use common::*;

const SLOW_READS: Duration = Duration::from_millis(250);

#[tokio::test(start_paused = true)]
async fn hung_open_is_restarted_until_the_hourly_limit() -> Result<()> {
    let mut bench = Bench::new();
    bench.a.hang_opens(true);

    bench.router.start(config_with_timeout(SLOW_READS))?;
    let mut incoming = peer(&mut bench.incoming).await?;
    let mut b = peer(&mut bench.b).await?;

    // A restart every 40 seconds, the eleventh stall comes after the limit of 10 is spent.
    tokio::time::sleep(Duration::from_secs(600)).await;

    let status = bench.router.status();
    let a = status.worker(WorkerRole::OutgoingA);

    assert!(a.persistent_failure);
    assert_eq!(a.restarts_in_window, 10);
    assert_eq!(a.total_restarts, 10);
    assert_eq!(a.state, PortState::Connecting);
    assert_eq!(status.watchdog_restarts, 10);
    assert_eq!(bench.a.open_attempts(), 11);
    assert_eq!(bench.a.max_concurrent_handles(), 0);

    for role in [WorkerRole::Incoming, WorkerRole::OutgoingB] {
        let worker = status.worker(role);
        assert_eq!(worker.total_restarts, 0, "{role}");
        assert!(!worker.persistent_failure, "{role}");
        assert_eq!(worker.state, PortState::Connected, "{role}");
    }

    // Routing carries on around the stuck port.
    incoming.write_all(b"AT\r\n").await?;
    assert_eq!(read_exactly(&mut b, 4).await?, b"AT\r\n");

    bench.router.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reconnecting_worker_is_not_restarted() -> Result<()> {
    let mut bench = Bench::new();
    bench.b.unplug();

    bench.router.start(config_with_timeout(SLOW_READS))?;
    let _incoming = peer(&mut bench.incoming).await?;
    let _a = peer(&mut bench.a).await?;

    tokio::time::sleep(Duration::from_secs(120)).await;

    let status = bench.router.status();
    let b = status.worker(WorkerRole::OutgoingB);

    assert_eq!(status.watchdog_restarts, 0);
    assert!(b.consecutive_failures > 100);
    assert!(b.last_error.is_some());
    assert!(!b.persistent_failure);

    bench.router.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn quiet_ports_are_not_stalled() -> Result<()> {
    let mut bench = Bench::new();
    let _peers = bench.start().await?;

    // No traffic at all for a long time.
    tokio::time::sleep(Duration::from_secs(300)).await;

    let status = bench.router.status();
    assert_eq!(status.watchdog_restarts, 0);
    assert!(status.all_connected());

    for device in bench.devices() {
        assert_eq!(device.open_attempts(), 1, "{}", device.name());
    }

    bench.router.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_a_hung_open() -> Result<()> {
    let mut bench = Bench::new();
    bench.incoming.hang_opens(true);

    bench.router.start(config_with_timeout(SLOW_READS))?;
    tokio::time::sleep(Duration::from_secs(5)).await;

    tokio::time::timeout(WAIT, bench.router.stop()).await?;

    assert!(!bench.router.is_running());
    for device in bench.devices() {
        assert_eq!(device.open_handles(), 0, "{}", device.name());
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restart_counts_the_abandoned_backlog_as_dropped() -> Result<()> {
    let mut bench = Bench::new();
    bench.a.hang_opens(true);

    bench.router.start(config_with_timeout(SLOW_READS))?;
    let mut incoming = peer(&mut bench.incoming).await?;
    let mut b = peer(&mut bench.b).await?;

    incoming.write_all(b"AT\r\n").await?;
    assert_eq!(read_exactly(&mut b, 4).await?, b"AT\r\n");

    // B took its copy, A's copy waits behind the hung open.
    wait_until(&bench.router, |status| {
        status.worker(WorkerRole::OutgoingA).queued == 1
    })
    .await?;

    bench.a.hang_opens(false);
    tokio::time::sleep(Duration::from_secs(60)).await;

    let mut a = peer(&mut bench.a).await?;
    let status = wait_until(&bench.router, |status| status.all_connected()).await?;

    let worker = status.worker(WorkerRole::OutgoingA);
    assert_eq!(worker.total_restarts, 1);
    assert_eq!(worker.dropped_chunks, 1);
    assert_eq!(worker.queued, 0);

    // Nothing stale reaches the port, fresh traffic does.
    incoming.write_all(b"ATZ\r\n").await?;
    assert_eq!(read_exactly(&mut a, 5).await?, b"ATZ\r\n");

    bench.router.stop().await;

    Ok(())
}
