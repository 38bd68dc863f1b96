use std::io::{self, BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Error;
use crate::broadcast::Broadcaster;
use crate::sample::TelemetrySample;
use crate::schema::parse_record;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    /// How long a single read may block before the loop checks for shutdown.
    pub read_timeout_ms: u64,
    /// Delay before the binary relaunches a failed adapter. `None` leaves
    /// it stopped.
    pub restart_delay_ms: Option<u64>,
    /// Frames longer than this are dropped without parsing.
    pub max_frame_len: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
            restart_delay_ms: None,
            max_frame_len: 4096,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn restart_delay(&self) -> Option<Duration> {
        self.restart_delay_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub frames: u64,
    pub published: u64,
    pub discarded: u64,
}

/// Reads newline-delimited JSON records from `reader` and publishes each
/// valid one.
///
/// Malformed frames are dropped and the loop keeps going. A frame is never
/// buffered past `max_frame_len` bytes: once it grows beyond that, the rest
/// of the line is skipped up to the next newline. Read timeouts are not
/// errors: any partial frame is kept and completed by later reads. The loop
/// ends with `Ok` when `token` is cancelled, `Err(Error::StreamClosed)` at
/// end of stream, and `Err(Error::Io)` on any other read failure.
pub fn ingest_lines<R: BufRead>(
    mut reader: R,
    broadcaster: &Broadcaster,
    token: &CancellationToken,
    max_frame_len: usize,
) -> Result<IngestStats, Error> {
    let mut stats = IngestStats::default();
    let mut buf = Vec::with_capacity(256);
    let mut skipping = false;
    loop {
        if token.is_cancelled() {
            return Ok(stats);
        }
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => {
                warn!(?err, ?stats, "input stream failed");
                return Err(Error::Io(err));
            }
        };
        if available.is_empty() {
            if !skipping && !buf.is_empty() {
                handle_frame(&buf, broadcaster, &mut stats);
            }
            info!(?stats, "input stream closed");
            return Err(Error::StreamClosed);
        }

        let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..=i], true),
            None => (available, false),
        };
        let used = chunk.len();
        if !skipping {
            if buf.len() + used > max_frame_len {
                discard_oversized(buf.len() + used, &mut stats);
                buf.clear();
                skipping = !complete;
            } else {
                buf.extend_from_slice(chunk);
            }
        } else if complete {
            skipping = false;
        }
        reader.consume(used);

        if complete && !buf.is_empty() {
            handle_frame(&buf, broadcaster, &mut stats);
            buf.clear();
        }
    }
}

fn discard_oversized(len: usize, stats: &mut IngestStats) {
    debug!(len, "discarding oversized frame");
    stats.frames += 1;
    stats.discarded += 1;
}

fn handle_frame(buf: &[u8], broadcaster: &Broadcaster, stats: &mut IngestStats) {
    let Ok(line) = std::str::from_utf8(buf) else {
        debug!("discarding frame with invalid utf-8");
        stats.frames += 1;
        stats.discarded += 1;
        return;
    };
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    stats.frames += 1;
    match parse_record(line) {
        Ok(channels) => {
            broadcaster.publish(TelemetrySample::new(channels));
            stats.published += 1;
        }
        Err(err) => {
            debug!(%err, "discarding malformed frame");
            stats.discarded += 1;
        }
    }
}

/// Opens the serial device and ingests from it on a blocking thread until
/// the device fails or `token` is cancelled.
pub async fn run(
    config: SerialConfig,
    broadcaster: Arc<Broadcaster>,
    token: CancellationToken,
) -> Result<IngestStats, Error> {
    tokio::task::spawn_blocking(move || {
        let port = serialport::new(&config.path, config.baud_rate)
            .timeout(config.read_timeout())
            .open()?;
        info!(path = %config.path, baud_rate = config.baud_rate, "listening on serial port");
        ingest_lines(
            BufReader::new(port),
            &broadcaster,
            &token,
            config.max_frame_len,
        )
    })
    .await
    .map_err(|_| Error::TaskPanicked)?
}
