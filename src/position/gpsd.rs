// src/position/gpsd.rs
//! gpsd-backed position source

use super::{
    data::Position,
    source::{PositionEvent, PositionOptions, PositionSource, Watch, WatchSender},
};
use crate::error::{PositionErrorKind, Result, TrackerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{collections::HashMap, io, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, warn};

const WATCH_COMMAND: &str = "?WATCH={\"enable\":true,\"json\":true}\n";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct GpsdMessage {
    class: String,
    #[serde(flatten)]
    data: HashMap<String, serde_json::Value>,
}

/// What a single gpsd line told us.
#[derive(Debug, Clone, PartialEq)]
pub enum GpsdReport {
    Fix(Position),
    /// TPV report without a 2D/3D fix
    NoFix,
    Other,
}

/// Position source reading TPV reports from a gpsd daemon.
#[derive(Debug, Clone)]
pub struct GpsdSource {
    host: String,
    port: u16,
}

impl GpsdSource {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Connect to the daemon and enable JSON watch mode
    async fn connect(&self) -> std::result::Result<BufReader<TcpStream>, PositionErrorKind> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                warn!(host = %self.host, port = self.port, error = %e, "Failed to connect to gpsd");
                classify_io_error(&e)
            })?;

        stream
            .write_all(WATCH_COMMAND.as_bytes())
            .await
            .map_err(|e| classify_io_error(&e))?;

        Ok(BufReader::new(stream))
    }
}

#[async_trait]
impl PositionSource for GpsdSource {
    async fn get_once(
        &self,
        options: &PositionOptions,
    ) -> std::result::Result<Position, PositionErrorKind> {
        let deadline = Instant::now() + options.timeout();
        let mut reader = timeout(options.timeout(), self.connect())
            .await
            .map_err(|_| PositionErrorKind::Timeout)??;

        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::time::timeout_at(deadline, reader.read_line(&mut line))
                .await
                .map_err(|_| PositionErrorKind::Timeout)?;

            match read {
                Ok(0) => return Err(PositionErrorKind::PositionUnavailable),
                Ok(_) => {
                    if let Ok(GpsdReport::Fix(position)) = parse_gpsd_json(line.trim()) {
                        return Ok(position);
                    }
                }
                Err(e) => return Err(classify_io_error(&e)),
            }
        }
    }

    fn watch(&self, options: &PositionOptions) -> Watch {
        let (sender, watch) = Watch::channel(32);
        let source = self.clone();
        let options = options.clone();

        tokio::spawn(async move {
            run_watch(source, options, sender).await;
            debug!("gpsd watch finished");
        });

        watch
    }
}

async fn run_watch(source: GpsdSource, options: PositionOptions, sender: WatchSender) {
    let handle = sender.handle().clone();

    while sender.is_active() {
        let mut reader = match source.connect().await {
            Ok(reader) => {
                info!(host = %source.host, port = source.port, "Connected to gpsd");
                reader
            }
            Err(kind) => {
                if !sender.send(PositionEvent::Error(kind)).await || kind.is_terminal() {
                    return;
                }
                tokio::select! {
                    _ = sleep(RECONNECT_DELAY) => continue,
                    _ = handle.stopped() => return,
                }
            }
        };

        // Bytes of a line cut off by a timeout stay here until the rest arrives
        let mut line = Vec::new();
        loop {
            let read = tokio::select! {
                read = timeout(options.timeout(), reader.read_until(b'\n', &mut line)) => read,
                _ = handle.stopped() => return,
            };

            let event = match read {
                Err(_) => Some(PositionEvent::Error(PositionErrorKind::Timeout)),
                Ok(Ok(0)) => {
                    // Daemon closed the connection; reconnect.
                    let closed = PositionEvent::Error(PositionErrorKind::PositionUnavailable);
                    if !sender.send(closed).await {
                        return;
                    }
                    break;
                }
                Ok(Ok(_)) => {
                    let report = parse_gpsd_line(&line);
                    line.clear();
                    match report {
                        Ok(GpsdReport::Fix(position)) => {
                            if is_fresh(&position, &options, Utc::now()) {
                                Some(PositionEvent::Sample(position))
                            } else {
                                debug!(
                                    captured_at = %position.captured_at,
                                    "Skipping stale gpsd fix"
                                );
                                None
                            }
                        }
                        Ok(GpsdReport::NoFix) => {
                            Some(PositionEvent::Error(PositionErrorKind::PositionUnavailable))
                        }
                        Ok(GpsdReport::Other) => None,
                        Err(e) => {
                            debug!(error = %e, "Ignoring malformed gpsd line");
                            None
                        }
                    }
                }
                Ok(Err(e)) => {
                    let kind = classify_io_error(&e);
                    if !sender.send(PositionEvent::Error(kind)).await {
                        return;
                    }
                    break;
                }
            };

            if let Some(event) = event {
                if !sender.send(event).await {
                    return;
                }
            }
        }

        tokio::select! {
            _ = sleep(RECONNECT_DELAY) => {}
            _ = handle.stopped() => return,
        }
    }
}

fn is_fresh(position: &Position, options: &PositionOptions, now: DateTime<Utc>) -> bool {
    if options.max_sample_age_ms == 0 {
        return true;
    }
    let age = now.signed_duration_since(position.captured_at);
    age.num_milliseconds() <= options.max_sample_age_ms as i64
}

/// Map a socket failure onto the position error taxonomy
pub fn classify_io_error(error: &io::Error) -> PositionErrorKind {
    match error.kind() {
        io::ErrorKind::PermissionDenied => PositionErrorKind::PermissionDenied,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => PositionErrorKind::Timeout,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::AddrNotAvailable => PositionErrorKind::PositionUnavailable,
        _ => PositionErrorKind::Unknown,
    }
}

fn parse_gpsd_line(bytes: &[u8]) -> Result<GpsdReport> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| TrackerError::Other(format!("gpsd line is not UTF-8: {}", e)))?;
    parse_gpsd_json(text.trim())
}

/// Parse a single line of gpsd JSON data
pub fn parse_gpsd_json(line: &str) -> Result<GpsdReport> {
    let msg: GpsdMessage = serde_json::from_str(line)?;

    let report = match msg.class.as_str() {
        "TPV" => parse_tpv_message(&msg.data),
        "VERSION" => {
            if let Some(version) = msg.data.get("release").and_then(|v| v.as_str()) {
                info!(version, "Connected to gpsd");
            }
            GpsdReport::Other
        }
        "DEVICES" => {
            if let Some(devices) = msg.data.get("devices").and_then(|v| v.as_array()) {
                info!(count = devices.len(), "gpsd managing devices");
            }
            GpsdReport::Other
        }
        _ => GpsdReport::Other,
    };

    Ok(report)
}

/// Parse TPV (Time Position Velocity) message
fn parse_tpv_message(msg_data: &HashMap<String, serde_json::Value>) -> GpsdReport {
    let mode = msg_data.get("mode").and_then(|v| v.as_u64()).unwrap_or(0);
    let lat = msg_data.get("lat").and_then(|v| v.as_f64());
    let lon = msg_data.get("lon").and_then(|v| v.as_f64());

    let (latitude, longitude) = match (lat, lon) {
        (Some(lat), Some(lon)) if mode >= 2 => (lat, lon),
        _ => return GpsdReport::NoFix,
    };

    let captured_at = msg_data
        .get("time")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    // Prefer the horizontal estimate, fall back to the larger axis error.
    let accuracy = msg_data.get("eph").and_then(|v| v.as_f64()).or_else(|| {
        let epx = msg_data.get("epx").and_then(|v| v.as_f64());
        let epy = msg_data.get("epy").and_then(|v| v.as_f64());
        match (epx, epy) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, y) => x.or(y),
        }
    });

    let mut position = Position::new(latitude, longitude, captured_at)
        .with_accuracy(accuracy.unwrap_or(0.0));
    position.speed_mps = msg_data.get("speed").and_then(|v| v.as_f64());

    if !position.is_valid() {
        warn!(latitude, longitude, "Discarding out-of-range gpsd fix");
        return GpsdReport::NoFix;
    }
    GpsdReport::Fix(position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tpv_parsing() {
        let json = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":3,"time":"2023-01-01T12:00:00.000Z","ept":0.005,"lat":48.117,"lon":11.517,"alt":545.4,"epx":15.319,"epy":17.054,"epv":124.484,"track":10.3797,"speed":0.091,"climb":10.7,"eps":34.11,"epc":248.97}"#;

        let report = parse_gpsd_json(json).unwrap();
        let GpsdReport::Fix(position) = report else {
            panic!("expected a fix, got {:?}", report);
        };

        assert_eq!(position.latitude, 48.117);
        assert_eq!(position.longitude, 11.517);
        assert_eq!(position.speed_mps, Some(0.091));
        assert!((position.accuracy_meters - 17.054).abs() < 1e-9);
        assert_eq!(position.captured_at.to_rfc3339(), "2023-01-01T12:00:00+00:00");
    }

    #[test]
    fn test_tpv_without_fix() {
        let json = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":1}"#;
        assert_eq!(parse_gpsd_json(json).unwrap(), GpsdReport::NoFix);
    }

    #[test]
    fn test_sky_is_ignored() {
        let json = r#"{"class":"SKY","device":"/dev/ttyUSB0","hdop":1.2,"satellites":[{"PRN":1,"ss":42,"used":true}]}"#;
        assert_eq!(parse_gpsd_json(json).unwrap(), GpsdReport::Other);
    }

    #[test]
    fn test_out_of_range_fix_is_discarded() {
        let json = r#"{"class":"TPV","mode":3,"lat":123.4,"lon":11.517}"#;
        assert_eq!(parse_gpsd_json(json).unwrap(), GpsdReport::NoFix);
    }

    #[tokio::test]
    async fn test_line_split_by_timeout_is_reassembled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let daemon = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let line = r#"{"class":"TPV","mode":2,"lat":-5.09,"lon":-42.8}"#;
            let (head, tail) = line.split_at(20);
            socket.write_all(head.as_bytes()).await.unwrap();
            sleep(Duration::from_millis(300)).await;
            socket.write_all(tail.as_bytes()).await.unwrap();
            socket.write_all(b"\n").await.unwrap();
            sleep(Duration::from_secs(5)).await;
        });

        let options = PositionOptions {
            high_accuracy: true,
            max_sample_age_ms: 0,
            timeout_ms: 100,
        };
        let mut watch = GpsdSource::new("127.0.0.1", port).watch(&options);

        let mut timeouts = 0;
        let position = loop {
            match timeout(Duration::from_secs(5), watch.next_event()).await.unwrap() {
                Some(PositionEvent::Error(PositionErrorKind::Timeout)) => timeouts += 1,
                Some(PositionEvent::Sample(position)) => break position,
                other => panic!("unexpected event {:?}", other),
            }
        };

        assert!(timeouts >= 1);
        assert_eq!(position.latitude, -5.09);
        assert_eq!(position.longitude, -42.8);

        watch.stop();
        daemon.abort();
    }

    #[test]
    fn test_invalid_json() {
        let invalid_json = r#"{"invalid": json"#;
        assert!(parse_gpsd_json(invalid_json).is_err());
    }

    #[test]
    fn test_io_error_classification() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify_io_error(&refused), PositionErrorKind::PositionUnavailable);

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(classify_io_error(&denied), PositionErrorKind::PermissionDenied);

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify_io_error(&timed_out), PositionErrorKind::Timeout);
    }

    #[test]
    fn test_stale_fix_is_rejected() {
        let now = Utc::now();
        let options = PositionOptions::watch_defaults();
        let old = Position::new(1.0, 1.0, now - chrono::Duration::seconds(5));
        assert!(!is_fresh(&old, &options, now));
        assert!(is_fresh(&Position::new(1.0, 1.0, now), &options, now));

        let any_age = PositionOptions {
            max_sample_age_ms: 0,
            ..options
        };
        assert!(is_fresh(&old, &any_age, now));
    }
}
