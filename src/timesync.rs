//! Startup clock synchronization against the primary server
//!
//! The server answers the time request with a JSON body holding an ISO-8601
//! local timestamp somewhere inside it. Failure never blocks startup.

use std::process::Command;

use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::ServerProfile;
use crate::error::{CallboxError, Result};
use crate::telemetry::transport::HttpTransport;

const ACCEPTED_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Applies a wall-clock time to the system
#[cfg_attr(test, mockall::automock)]
pub trait ClockSetter: Send + Sync {
    fn set(&self, time: NaiveDateTime) -> Result<()>;
}

/// Sets the clock through `date -s`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSetter for SystemClock {
    fn set(&self, time: NaiveDateTime) -> Result<()> {
        let value = time.format("%Y-%m-%d %H:%M:%S").to_string();
        let status = Command::new("date").arg("-s").arg(&value).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(CallboxError::TimeSync(format!("date -s '{}' exited with {}", value, status)))
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    // Zone suffixes are ignored; the server reports local time
    let raw = raw.trim().trim_end_matches('Z');
    let raw = match raw.rfind(['+', '-']) {
        Some(at) if at > 10 => &raw[..at],
        _ => raw,
    };
    ACCEPTED_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

fn find_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Array(items) => items.iter().find_map(find_timestamp),
        Value::Object(map) => map.values().find_map(find_timestamp),
        _ => None,
    }
}

/// First timestamp found in a server-time response body
///
/// # Examples
///
/// ```
/// use callbox::timesync::parse_server_time;
///
/// let time = parse_server_time(r#"{"data":{"time":"2021-09-29T15:18:00.123"}}"#).unwrap();
/// assert_eq!(time.to_string(), "2021-09-29 15:18:00.123");
/// ```
pub fn parse_server_time(body: &str) -> Result<NaiveDateTime> {
    let value: Value = serde_json::from_str(body.trim())?;
    find_timestamp(&value)
        .ok_or_else(|| CallboxError::TimeSync("no timestamp in server response".to_string()))
}

/// Fetch the server time and apply it; `true` when the clock was set
pub async fn sync_clock(transport: &HttpTransport, primary: &ServerProfile, clock: &dyn ClockSetter) -> bool {
    let applied = async {
        let body = transport.fetch_server_time(primary).await?;
        let time = parse_server_time(&body)?;
        clock.set(time)?;
        Ok::<_, CallboxError>(time)
    };

    match applied.await {
        Ok(time) => {
            info!("System clock set to {} from {}", time, primary.telemetry_host());
            true
        }
        Err(e) => {
            warn!("Time sync failed, keeping the current clock: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn expected() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 9, 29)
            .unwrap()
            .and_hms_opt(15, 18, 0)
            .unwrap()
    }

    #[test]
    fn test_parse_nested_timestamp() {
        let time = parse_server_time(r#"{"status":"ok","data":{"time":"2021-09-29T15:18:00"}}"#).unwrap();
        assert_eq!(time, expected());
    }

    #[test]
    fn test_parse_skips_non_time_strings() {
        let body = r#"{"status":"ok","items":[1,"abc",{"at":"2021-09-29T15:18:00+05:30"}]}"#;
        assert_eq!(parse_server_time(body).unwrap(), expected());
    }

    #[test]
    fn test_parse_bare_string_and_utc_suffix() {
        assert_eq!(parse_server_time("\"2021-09-29T15:18:00Z\"").unwrap(), expected());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_server_time("not json"), Err(CallboxError::Json(_))));
        assert!(matches!(parse_server_time(r#"{"time":"yesterday"}"#), Err(CallboxError::TimeSync(_))));
    }

    #[tokio::test]
    async fn test_sync_clock_applies_server_time() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\n\r\n{\"data\":{\"time\":\"2021-09-29T15:18:00\"}}")
                .await
                .unwrap();
        });

        let mut clock = MockClockSetter::new();
        clock
            .expect_set()
            .withf(|time| *time == expected())
            .times(1)
            .returning(|_| Ok(()));

        let primary = ServerProfile {
            address: "127.0.0.1".to_string(),
            telemetry_port: port,
            ..ServerProfile::default()
        };
        let transport = HttpTransport::new(Duration::from_secs(2));
        assert!(sync_clock(&transport, &primary, &clock).await);
    }

    #[tokio::test]
    async fn test_sync_clock_failure_is_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut clock = MockClockSetter::new();
        clock.expect_set().never();

        let primary = ServerProfile {
            address: "127.0.0.1".to_string(),
            telemetry_port: port,
            ..ServerProfile::default()
        };
        let transport = HttpTransport::new(Duration::from_secs(1));
        assert!(!sync_clock(&transport, &primary, &clock).await);
    }
}
