//! Replication session: one streaming connection plus the background task
//! that reads it.
//!
//! The receive loop owns the connection. It answers keepalives, decodes
//! every XLogData payload into [`WireMessage`]s and hands them to the test
//! loop through a bounded queue of depth one. Shutdown is cooperative: the
//! loop is cancelled, drained until it sends [`ReceiverEvent::Closed`], and
//! must then close its queue within the configured timeout.

use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;
use tracing::{debug, error, info, trace, warn};

use crate::config::{PostgresConfig, SessionConfig};
use crate::error::DecodeError;
use crate::options::PluginOptions;
use crate::postgres::connection::ReplicationConnection;
use crate::postgres::protocol::CopyBothMessage;
use crate::wire::{self, WireMessage};
use crate::{Error, Result};

/// The streaming half of a replication connection, as seen by the receive
/// loop.
pub trait ReplicationStream: Send + 'static {
    /// Next CopyData payload, `None` when the server ends the copy.
    /// Must be cancel-safe.
    fn next_copy_data(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;

    fn send_status_update(&mut self, lsn: u64) -> impl Future<Output = Result<()>> + Send;

    fn close(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}

impl ReplicationStream for ReplicationConnection {
    async fn next_copy_data(&mut self) -> Result<Option<Bytes>> {
        ReplicationConnection::next_copy_data(self).await
    }

    async fn send_status_update(&mut self, lsn: u64) -> Result<()> {
        ReplicationConnection::send_status_update(self, lsn).await
    }

    async fn close(self) -> Result<()> {
        ReplicationConnection::close(self).await
    }
}

/// One message decoded from the stream, or the reason its buffer could not
/// be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// WAL position the carrying XLogData started at.
    pub lsn: u64,
    pub result: std::result::Result<WireMessage, DecodeError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    Message(DecodedMessage),
    /// Last event of a cancelled receive loop.
    Closed,
}

/// Timing knobs of the receive loop.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverSettings {
    pub read_deadline: Duration,
    pub status_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&SessionConfig> for ReceiverSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            read_deadline: config.read_deadline(),
            status_interval: config.status_interval(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// A streaming replication session and its receive loop.
pub struct ReplicationSession {
    events: mpsc::Receiver<ReceiverEvent>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
    settings: ReceiverSettings,
}

impl ReplicationSession {
    /// Connect in replication mode and start streaming `slot_name` from the
    /// server's current WAL position with `options`.
    pub async fn open(
        postgres: &PostgresConfig,
        session: &SessionConfig,
        options: &PluginOptions,
    ) -> Result<Self> {
        let mut conn = ReplicationConnection::connect(postgres).await?;
        let system = conn.identify_system().await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            xlogpos = %system.xlogpos,
            "Identified system"
        );

        conn.start_replication(
            &session.slot_name,
            system.xlogpos,
            &options.to_replication_args(),
        )
        .await?;

        Ok(Self::spawn(
            conn,
            u64::from(system.xlogpos),
            ReceiverSettings::from(session),
        ))
    }

    /// Start the receive loop over an already streaming connection.
    pub fn spawn<S: ReplicationStream>(
        stream: S,
        start_lsn: u64,
        settings: ReceiverSettings,
    ) -> Self {
        let (events_tx, events) = mpsc::channel(1);
        let (cancel, cancel_rx) = watch::channel(false);

        let receiver = Receiver {
            stream,
            events: events_tx,
            cancel: cancel_rx,
            settings,
            client_lsn: start_lsn,
            last_status: Instant::now(),
        };

        Self {
            events,
            cancel,
            task: Some(tokio::spawn(receiver.run())),
            settings,
        }
    }

    /// Wait up to `timeout` for the next decoded message.
    pub async fn recv(&mut self, timeout: Duration) -> Result<DecodedMessage> {
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Err(_) => Err(Error::Timeout {
                message: format!("No replication message within {}s", timeout.as_secs_f64()),
            }),
            Ok(Some(ReceiverEvent::Message(message))) => Ok(message),
            Ok(Some(ReceiverEvent::Closed)) => Err(Error::Internal(
                "Receive loop closed without being cancelled".to_string(),
            )),
            Ok(None) => Err(match self.join().await {
                Err(e) => e,
                Ok(()) => Error::Replication {
                    message: "Receive loop ended".to_string(),
                },
            }),
        }
    }

    /// Cancel the receive loop, drain it and wait for the connection to
    /// close. Returns the loop's own error if it had already failed.
    pub async fn shutdown(mut self) -> Result<()> {
        debug!("Shutting down replication session");
        let _ = self.cancel.send(true);

        let drain_limit = self.settings.read_deadline + self.settings.shutdown_timeout;
        let drained = tokio::time::timeout(drain_limit, async {
            let mut discarded = 0usize;
            loop {
                match self.events.recv().await {
                    Some(ReceiverEvent::Message(_)) => discarded += 1,
                    Some(ReceiverEvent::Closed) => return Some(discarded),
                    None => return None,
                }
            }
        })
        .await
        .map_err(|_| {
            Error::Internal(format!(
                "Receive loop did not acknowledge shutdown within {}s",
                drain_limit.as_secs()
            ))
        })?;

        match drained {
            // queue closed without the sentinel: the loop had already failed
            None => return self.join().await,
            Some(discarded) if discarded > 0 => {
                debug!(discarded, "Discarded undelivered messages during shutdown");
            }
            Some(_) => {}
        }

        match tokio::time::timeout(self.settings.shutdown_timeout, self.events.recv()).await {
            Ok(None) => {}
            Ok(Some(event)) => {
                return Err(Error::Internal(format!(
                    "Receive loop sent {:?} after its shutdown sentinel",
                    event
                )))
            }
            Err(_) => {
                return Err(Error::Internal(format!(
                    "Receive loop did not close its queue within {}ms",
                    self.settings.shutdown_timeout.as_millis()
                )))
            }
        }

        self.join().await?;
        info!("Replication session closed");
        Ok(())
    }

    async fn join(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::Internal(format!("Receive loop panicked: {}", e))),
            },
            None => Ok(()),
        }
    }
}

impl Drop for ReplicationSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Receiver<S> {
    stream: S,
    events: mpsc::Sender<ReceiverEvent>,
    cancel: watch::Receiver<bool>,
    settings: ReceiverSettings,
    client_lsn: u64,
    last_status: Instant,
}

enum Next {
    Cancelled,
    Frame(Result<Option<Bytes>>),
    Deadline,
}

impl<S: ReplicationStream> Receiver<S> {
    async fn run(mut self) -> Result<()> {
        let result = self.receive().await;
        if let Err(e) = &result {
            error!("Receive loop failed: {}", e);
        }

        let Receiver { stream, events, .. } = self;
        drop(events);
        if let Err(e) = stream.close().await {
            warn!("Failed to close replication connection: {}", e);
        }
        result
    }

    async fn receive(&mut self) -> Result<()> {
        loop {
            if *self.cancel.borrow_and_update() {
                return self.finish().await;
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.changed() => Next::Cancelled,
                frame = tokio::time::timeout(
                    self.settings.read_deadline,
                    self.stream.next_copy_data(),
                ) => match frame {
                    Ok(frame) => Next::Frame(frame),
                    Err(_) => Next::Deadline,
                },
            };

            let data = match next {
                Next::Cancelled => return self.finish().await,
                Next::Deadline => {
                    return Err(Error::Stall {
                        seconds: self.settings.read_deadline.as_secs(),
                    })
                }
                Next::Frame(frame) => match frame? {
                    Some(data) => data,
                    None => {
                        return Err(Error::Replication {
                            message: "Server ended the replication stream".to_string(),
                        })
                    }
                },
            };

            match CopyBothMessage::parse(data)? {
                CopyBothMessage::Keepalive {
                    wal_end,
                    reply_requested,
                    ..
                } => {
                    trace!(wal_end = %PgLsn::from(wal_end), reply_requested, "Keepalive");
                    if reply_requested {
                        self.send_status().await?;
                    }
                }
                CopyBothMessage::XLogData {
                    wal_start, data, ..
                } => {
                    trace!(wal_start = %PgLsn::from(wal_start), len = data.len(), "XLogData");
                    self.client_lsn = wal_start + data.len() as u64 + 1;
                    self.deliver(wal_start, &data).await?;
                }
            }

            if self.last_status.elapsed() >= self.settings.status_interval {
                self.send_status().await?;
            }
        }
    }

    async fn deliver(&mut self, lsn: u64, data: &[u8]) -> Result<()> {
        let results = match wire::decode(data) {
            Ok(messages) => messages.into_iter().map(Ok).collect(),
            Err(e) => {
                warn!(lsn = %PgLsn::from(lsn), "Failed to decode wire message: {}", e);
                vec![Err(e)]
            }
        };

        for result in results {
            let event = ReceiverEvent::Message(DecodedMessage { lsn, result });
            if self.events.send(event).await.is_err() {
                return Err(Error::Replication {
                    message: "Session dropped its message queue".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn send_status(&mut self) -> Result<()> {
        self.stream.send_status_update(self.client_lsn).await?;
        self.last_status = Instant::now();
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        debug!("Receive loop cancelled");
        // the session may already be gone; nothing left to signal then
        let _ = self.events.send(ReceiverEvent::Closed).await;
        Ok(())
    }
}
