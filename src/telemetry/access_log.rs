use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

/// The output format for access log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Newline-delimited JSON (default).
    Json,
    /// Nginx "combined" format with the cache outcome appended:
    /// `$ip - [$time] "$method $path HTTP/1.1" $status $bytes "-" "$ua" $cache`
    Combined,
    /// Apache "common" format:
    /// `$ip - - [$time] "$method $path HTTP/1.1" $status $bytes`
    Common,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "combined" => LogFormat::Combined,
            "common" => LogFormat::Common,
            _ => LogFormat::Json,
        }
    }
}

/// One answered request.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub timestamp: String,
    pub client_ip: String,
    pub method: String,
    /// Inbound path and query.
    pub path: String,
    pub status: u16,
    /// `x-proxy-cache` value sent with the response.
    pub cache: &'static str,
    /// Total time spent in the proxy.
    pub latency_ms: u64,
    /// Origin round trip, when origin was called.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_latency_ms: Option<u64>,
    /// Body size when known up front (cached or buffered responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<u64>,
    pub user_agent: String,
}

impl AccessLogEntry {
    fn bytes_field(&self) -> String {
        self.bytes_sent
            .map(|b| b.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    fn as_combined(&self) -> String {
        format!(
            "{} - [{}] \"{} {} HTTP/1.1\" {} {} \"-\" \"{}\" {}",
            self.client_ip,
            self.timestamp,
            self.method,
            self.path,
            self.status,
            self.bytes_field(),
            self.user_agent,
            self.cache,
        )
    }

    fn as_common(&self) -> String {
        format!(
            "{} - - [{}] \"{} {} HTTP/1.1\" {} {}",
            self.client_ip,
            self.timestamp,
            self.method,
            self.path,
            self.status,
            self.bytes_field(),
        )
    }

    pub fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Json => serde_json::to_string(self).unwrap_or_default(),
            LogFormat::Combined => self.as_combined(),
            LogFormat::Common => self.as_common(),
        }
    }
}

/// Appends access log lines from a background task fed by a channel, so the
/// request path never waits on disk.
pub struct AccessLogger {
    sender: mpsc::UnboundedSender<AccessLogEntry>,
}

impl AccessLogger {
    /// Spawns the writer task. Must be called inside a tokio runtime.
    /// Creates the log directory if it doesn't exist.
    pub fn new(log_path: &str, format: LogFormat) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<AccessLogEntry>();
        let path = log_path.to_string();

        tokio::spawn(async move {
            if let Some(parent) = std::path::Path::new(&path).parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }

            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;

            match file {
                Ok(mut f) => {
                    info!("Access log writer started: {} (format: {:?})", path, format);
                    while let Some(entry) = receiver.recv().await {
                        let line = entry.render(format);
                        if line.is_empty() {
                            continue;
                        }
                        if let Err(e) = f.write_all(format!("{}\n", line).as_bytes()).await {
                            error!("Failed to write access log {}: {}", path, e);
                        }
                        let _ = f.flush().await;
                    }
                }
                Err(e) => {
                    error!("Failed to open access log file {}: {}", path, e);
                    while receiver.recv().await.is_some() {}
                }
            }
        });

        Self { sender }
    }

    /// Non-blocking submission.
    pub fn log(&self, entry: AccessLogEntry) {
        let _ = self.sender.send(entry);
    }
}

/// `seconds.millis` since the Unix epoch, e.g. `1700000000.123Z`.
pub fn log_timestamp() -> String {
    let now = crate::cache::now_millis();
    format!("{}.{:03}Z", now / 1000, now % 1000)
}
