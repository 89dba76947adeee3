//! Native replication connection over libpq
//!
//! Adapts [`pg_walstream::PgReplicationConnection`] to [`ReplicationConnection`]:
//! CopyData frames are split into XLogData payloads and keep-alives. While a
//! read is in progress the last standby status is repeated every
//! `status_interval`; nothing is sent between reads.

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use pg_walstream::{PgReplicationConnection, ReplicationError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::connection::mask_password;
use crate::error::{EventsError, Result};
use crate::retry::{connect_with_retry, RetryConfig};
use crate::slot::{ReplicationConnection, ReplicationConnector, WalData};
use crate::types::Lsn;

// 'w' + wal start + wal end + send time
const XLOG_DATA_HEADER: usize = 1 + 8 + 8 + 8;
// 'k' + wal end + send time + reply flag
const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;
// Reason pg_walstream gives when the server ends the COPY stream
const COPY_DONE: &str = "COPY stream ended";

/// Opens [`LibpqConnection`]s with retry
pub struct LibpqConnector {
    connection_string: String,
    retry: RetryConfig,
    status_interval: Duration,
}

impl LibpqConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            connection_string: config.replication_conninfo(),
            retry: RetryConfig::from(config),
            status_interval: config.status_interval,
        }
    }
}

#[async_trait]
impl ReplicationConnector for LibpqConnector {
    async fn connect(&self) -> Result<Box<dyn ReplicationConnection>> {
        let masked = mask_password(&self.connection_string);
        let connection = connect_with_retry(&self.retry, &masked, || async {
            let connection = PgReplicationConnection::connect(&self.connection_string)?;
            let _system_id = connection.identify_system()?;
            Ok(connection)
        })
        .await?;

        Ok(Box::new(LibpqConnection {
            connection: Some(connection),
            status: StandbyStatus::new(self.status_interval),
        }))
    }
}

/// The CopyBoth half of a replication connection
#[async_trait]
trait CopyStream: Send {
    async fn copy_data(&mut self, token: &CancellationToken) -> pg_walstream::Result<Vec<u8>>;

    fn standby_status(
        &mut self,
        received: u64,
        flushed: u64,
        applied: u64,
    ) -> pg_walstream::Result<()>;
}

#[async_trait]
impl CopyStream for PgReplicationConnection {
    async fn copy_data(&mut self, token: &CancellationToken) -> pg_walstream::Result<Vec<u8>> {
        self.get_copy_data_async(token).await
    }

    fn standby_status(
        &mut self,
        received: u64,
        flushed: u64,
        applied: u64,
    ) -> pg_walstream::Result<()> {
        self.send_standby_status_update(received, flushed, applied, false)
    }
}

/// Last standby status sent and when
struct StandbyStatus {
    interval: Duration,
    last: Option<(u64, u64, u64)>,
    sent_at: Instant,
}

impl StandbyStatus {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            sent_at: Instant::now(),
        }
    }

    fn write<S: CopyStream + ?Sized>(&mut self, stream: &mut S, status: (u64, u64, u64)) -> Result<()> {
        let (received, flushed, applied) = status;
        stream.standby_status(received, flushed, applied)?;
        self.last = Some(status);
        self.sent_at = Instant::now();
        trace!(
            "Sent standby status: received={}, flushed={}, applied={}",
            Lsn(received),
            Lsn(flushed),
            Lsn(applied)
        );
        Ok(())
    }

    fn repeat_if_due<S: CopyStream + ?Sized>(&mut self, stream: &mut S) -> Result<()> {
        if self.sent_at.elapsed() < self.interval {
            return Ok(());
        }
        match self.last {
            Some(status) => self.write(stream, status),
            None => {
                self.sent_at = Instant::now();
                Ok(())
            }
        }
    }
}

/// Waits up to `window` for one CopyData frame, `None` when the window expired
async fn read_frame<S: CopyStream + ?Sized>(
    stream: &mut S,
    window: Duration,
) -> Result<Option<Vec<u8>>> {
    let token = CancellationToken::new();
    let timer_token = token.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(window).await;
        timer_token.cancel();
    });

    let result = stream.copy_data(&token).await;
    timer.abort();

    match result {
        Ok(frame) => Ok(Some(frame)),
        // Expired windows surface as cancellation, and so does the end of COPY
        Err(ReplicationError::Cancelled(reason))
            if token.is_cancelled() && !reason.contains(COPY_DONE) =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Reads frames until one XLogData message arrives or `window` elapses
///
/// Keep-alives are consumed here and answered when the server asks for a reply.
async fn read_wal<S: CopyStream + ?Sized>(
    stream: &mut S,
    status: &mut StandbyStatus,
    window: Duration,
) -> Result<Option<WalData>> {
    let deadline = Instant::now() + window;

    loop {
        status.repeat_if_due(stream)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        let Some(frame) = read_frame(stream, remaining).await? else {
            return Ok(None);
        };
        if frame.is_empty() {
            continue;
        }

        match frame[0] {
            b'w' => return parse_xlog_data(&frame).map(Some),
            b'k' => {
                let (wal_end, reply_requested) = parse_keepalive(&frame)?;
                debug!(
                    "Received keepalive: wal_end={}, reply_requested={}",
                    Lsn(wal_end),
                    reply_requested
                );
                if reply_requested {
                    let last = status.last.unwrap_or((0, 0, 0));
                    status.write(stream, last)?;
                }
            }
            other => debug!("Received unknown message type: {}", other as char),
        }
    }
}

fn drop_slot_command(slot: &str) -> String {
    format!("DROP_REPLICATION_SLOT \"{}\"", slot.replace('"', "\"\""))
}

/// One replication-protocol connection
pub struct LibpqConnection {
    connection: Option<PgReplicationConnection>,
    status: StandbyStatus,
}

impl LibpqConnection {
    fn live(&mut self) -> Result<&mut PgReplicationConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| EventsError::connection("Replication connection is closed"))
    }
}

#[async_trait]
impl ReplicationConnection for LibpqConnection {
    async fn start_logical_stream(
        &mut self,
        slot: &str,
        start: Option<Lsn>,
        options: &[(String, String)],
    ) -> Result<()> {
        let start_lsn = start.unwrap_or(Lsn::INVALID);
        let options: Vec<(&str, &str)> = options
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        self.live()?.start_replication(slot, start_lsn.0, &options)?;
        self.status.sent_at = Instant::now();
        info!("Logical replication started on '{}' from {}", slot, start_lsn);
        Ok(())
    }

    async fn read_pending(&mut self, window: Duration) -> Result<Option<WalData>> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| EventsError::connection("Replication connection is closed"))?;
        read_wal(connection, &mut self.status, window).await
    }

    async fn send_status(&mut self, received: Lsn, flushed: Lsn, applied: Lsn) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| EventsError::connection("Replication connection is closed"))?;
        self.status
            .write(connection, (received.0, flushed.0, applied.0))
    }

    fn is_closed(&self) -> bool {
        self.connection.as_ref().map_or(true, |c| !c.is_alive())
    }

    async fn create_logical_slot(&mut self, slot: &str, plugin: &str) -> Result<()> {
        info!("Creating replication slot '{}' with plugin '{}'", slot, plugin);
        match self.live()?.create_replication_slot(slot, plugin) {
            Ok(_) => {
                info!("Replication slot '{}' created", slot);
                Ok(())
            }
            Err(e) if e.to_string().contains("already exists") => {
                warn!("Replication slot '{}' already exists, continuing", slot);
                Ok(())
            }
            Err(e) => Err(EventsError::replication_slot(format!(
                "Cannot create slot '{}': {}",
                slot, e
            ))),
        }
    }

    async fn drop_slot(&mut self, slot: &str) -> Result<()> {
        info!("Dropping replication slot: {}", slot);
        self.live()?
            .exec(&drop_slot_command(slot))
            .map_err(|e| {
                EventsError::replication_slot(format!("Cannot drop slot '{}': {}", slot, e))
            })?;
        info!("Dropped replication slot: {}", slot);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.connection.take().is_some() {
            debug!("Replication connection closed");
        }
        Ok(())
    }
}

fn parse_xlog_data(frame: &[u8]) -> Result<WalData> {
    if frame.len() < XLOG_DATA_HEADER {
        return Err(EventsError::protocol("WAL message too short"));
    }
    let mut buf = &frame[1..];
    let wal_start = buf.get_u64();
    let wal_end = buf.get_u64();
    let _send_time = buf.get_i64();

    Ok(WalData {
        wal_start: Lsn(wal_start),
        wal_end: Lsn(wal_end),
        payload: Bytes::copy_from_slice(buf),
    })
}

fn parse_keepalive(frame: &[u8]) -> Result<(u64, bool)> {
    if frame.len() < KEEPALIVE_LEN {
        return Err(EventsError::protocol("Keepalive message too short"));
    }
    let mut buf = &frame[1..];
    let wal_end = buf.get_u64();
    let _send_time = buf.get_i64();
    Ok((wal_end, buf.get_u8() != 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::collections::VecDeque;

    /// Serves queued frames, then idles until the read window expires
    #[derive(Default)]
    struct ScriptedStream {
        frames: VecDeque<Vec<u8>>,
        copy_done: bool,
        statuses: Vec<(u64, u64, u64)>,
    }

    #[async_trait]
    impl CopyStream for ScriptedStream {
        async fn copy_data(&mut self, token: &CancellationToken) -> pg_walstream::Result<Vec<u8>> {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(frame);
            }
            if self.copy_done {
                return Err(ReplicationError::Cancelled(COPY_DONE.to_string()));
            }
            token.cancelled().await;
            Err(ReplicationError::Cancelled("Operation cancelled".to_string()))
        }

        fn standby_status(
            &mut self,
            received: u64,
            flushed: u64,
            applied: u64,
        ) -> pg_walstream::Result<()> {
            self.statuses.push((received, flushed, applied));
            Ok(())
        }
    }

    fn xlog_frame(wal_start: u64, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.put_u8(b'w');
        frame.put_u64(wal_start);
        frame.put_u64(wal_start);
        frame.put_i64(0);
        frame.extend_from_slice(payload);
        frame
    }

    fn keepalive_frame(wal_end: u64, reply: bool) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.put_u8(b'k');
        frame.put_u64(wal_end);
        frame.put_i64(0);
        frame.put_u8(reply as u8);
        frame
    }

    #[test]
    fn test_parse_xlog_data() {
        let mut frame = Vec::new();
        frame.put_u8(b'w');
        frame.put_u64(0x16B3748);
        frame.put_u64(0x16B3800);
        frame.put_i64(0);
        frame.extend_from_slice(br#"{"change":[]}"#);

        let data = parse_xlog_data(&frame).unwrap();
        assert_eq!(data.wal_start, Lsn(0x16B3748));
        assert_eq!(data.wal_end, Lsn(0x16B3800));
        assert_eq!(&data.payload[..], br#"{"change":[]}"#);

        assert!(parse_xlog_data(&frame[..10]).is_err());
    }

    #[test]
    fn test_parse_keepalive() {
        let frame = keepalive_frame(42, true);
        assert_eq!(parse_keepalive(&frame).unwrap(), (42, true));
        assert!(parse_keepalive(&frame[..5]).is_err());
    }

    #[tokio::test]
    async fn test_idle_window_is_not_an_error() {
        let mut stream = ScriptedStream::default();
        let mut status = StandbyStatus::new(Duration::from_secs(15));

        let read = read_wal(&mut stream, &mut status, Duration::from_millis(20)).await;
        assert!(read.unwrap().is_none());
        assert!(stream.statuses.is_empty());
    }

    #[tokio::test]
    async fn test_keepalive_only_window() {
        let mut stream = ScriptedStream::default();
        let mut status = StandbyStatus::new(Duration::from_secs(15));
        status.write(&mut stream, (100, 100, 100)).unwrap();

        stream.frames.push_back(keepalive_frame(500, false));
        let read = read_wal(&mut stream, &mut status, Duration::from_millis(20)).await;
        assert!(read.unwrap().is_none());
        assert_eq!(stream.statuses.len(), 1);

        // A requested reply repeats the last confirmed position
        stream.frames.push_back(keepalive_frame(600, true));
        let read = read_wal(&mut stream, &mut status, Duration::from_millis(20)).await;
        assert!(read.unwrap().is_none());
        assert_eq!(stream.statuses, vec![(100, 100, 100), (100, 100, 100)]);
    }

    #[tokio::test]
    async fn test_keepalive_then_wal_data() {
        let mut stream = ScriptedStream::default();
        stream.frames.push_back(keepalive_frame(90, false));
        stream.frames.push_back(xlog_frame(100, br#"{"change":[]}"#));
        let mut status = StandbyStatus::new(Duration::from_secs(15));

        let data = read_wal(&mut stream, &mut status, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.wal_start, Lsn(100));
        assert_eq!(&data.payload[..], br#"{"change":[]}"#);
    }

    #[tokio::test]
    async fn test_end_of_copy_is_an_error() {
        let mut stream = ScriptedStream {
            copy_done: true,
            ..Default::default()
        };
        let mut status = StandbyStatus::new(Duration::from_secs(15));

        let read = read_wal(&mut stream, &mut status, Duration::from_millis(20)).await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn test_status_repeated_while_reading() {
        let mut stream = ScriptedStream::default();
        let mut status = StandbyStatus::new(Duration::ZERO);
        status.write(&mut stream, (7, 7, 7)).unwrap();

        let read = read_wal(&mut stream, &mut status, Duration::from_millis(20)).await;
        assert!(read.unwrap().is_none());
        assert!(stream.statuses.len() >= 2);
        assert!(stream.statuses.iter().all(|s| *s == (7, 7, 7)));
    }

    #[test]
    fn test_drop_slot_command_quotes_name() {
        assert_eq!(drop_slot_command("events"), r#"DROP_REPLICATION_SLOT "events""#);
        assert_eq!(drop_slot_command(r#"odd"name"#), r#"DROP_REPLICATION_SLOT "odd""name""#);
    }
}
