//! Background heartbeat task.

use crate::channel::RpcChannel;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Why a keep-alive task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveExit {
    /// Shutdown was requested.
    Stopped,
    /// A heartbeat could not be written.
    SendFailed,
}

/// Sends a heartbeat through the session channel every `interval`.
///
/// Each heartbeat takes the channel lock, so it never lands between the
/// request and reply of an exchange.
pub struct KeepAliveTask;

impl KeepAliveTask {
    pub fn spawn<S>(
        channel: Arc<Mutex<RpcChannel<S>>>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<KeepAliveExit>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!("keep-alive started, interval {:?}", interval);

            loop {
                tokio::select! {
                    biased;

                    _ = stopped(&mut shutdown) => {
                        tracing::debug!("keep-alive stopped");
                        return KeepAliveExit::Stopped;
                    }

                    _ = ticks.tick() => {}
                }

                // An exchange may hold the lock indefinitely; stay stoppable.
                let mut channel = tokio::select! {
                    biased;

                    _ = stopped(&mut shutdown) => {
                        tracing::debug!("keep-alive stopped while waiting for the channel");
                        return KeepAliveExit::Stopped;
                    }

                    guard = channel.lock() => guard,
                };

                if let Err(e) = channel.heartbeat().await {
                    if *shutdown.borrow() {
                        return KeepAliveExit::Stopped;
                    }
                    tracing::warn!("heartbeat failed: {}", e);
                    return KeepAliveExit::SendFailed;
                }
                tracing::trace!("heartbeat sent");
            }
        })
    }
}

/// Resolves once `true` has been published. The read guard is released
/// before returning so the caller stays `Send`.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbcfs_protocol::Profile;
    use tokio::io::AsyncReadExt;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_at_interval() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (tx, rx) = watch::channel(false);
        let channel = Arc::new(Mutex::new(
            RpcChannel::session(client, Profile::File, 3).with_shutdown(rx.clone()),
        ));

        let handle = KeepAliveTask::spawn(channel, Duration::from_secs(30), rx);

        let mut buf = [0u8; 16];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ALIVEACKALIVEACK");

        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), KeepAliveExit::Stopped);
    }

    #[tokio::test]
    async fn test_stop_during_sleep() {
        let (client, _server) = tokio::io::duplex(1024);
        let (tx, rx) = watch::channel(false);
        let channel = Arc::new(Mutex::new(
            RpcChannel::session(client, Profile::File, 3).with_shutdown(rx.clone()),
        ));

        let handle = KeepAliveTask::spawn(channel, Duration::from_secs(3600), rx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, KeepAliveExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_when_channel_dead() {
        let (client, server) = tokio::io::duplex(1024);
        let (_tx, rx) = watch::channel(false);
        let channel = Arc::new(Mutex::new(RpcChannel::session(client, Profile::Jdbc, 6)));
        channel.lock().await.close().await;
        drop(server);

        let handle = KeepAliveTask::spawn(channel, Duration::from_secs(1), rx);
        assert_eq!(handle.await.unwrap(), KeepAliveExit::SendFailed);
    }
}
