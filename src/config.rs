use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_FRAME_RATE: u32 = 1;
pub const MAX_FRAME_RATE: u32 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {detail}")]
    Invalid { name: &'static str, detail: String },
}

/// Frame queue overflow policy (see FrameQueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuePolicy {
    /// Queue grows without bound if the encoder stalls; memory is bounded
    /// only by the container limit.
    Unbounded,
    /// Cap the queue and discard the oldest frame on overflow.
    DropOldest(usize),
}

impl QueuePolicy {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("unbounded") {
            return Ok(QueuePolicy::Unbounded);
        }
        if let Some(cap) = raw
            .strip_prefix("drop-oldest:")
            .or_else(|| raw.strip_prefix("drop-oldest="))
        {
            let cap: usize = cap.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "QUEUE_POLICY",
                detail: format!("bad capacity in {raw:?}"),
            })?;
            if cap == 0 {
                return Err(ConfigError::Invalid {
                    name: "QUEUE_POLICY",
                    detail: "capacity must be at least 1".into(),
                });
            }
            return Ok(QueuePolicy::DropOldest(cap));
        }
        Err(ConfigError::Invalid {
            name: "QUEUE_POLICY",
            detail: format!("expected 'unbounded' or 'drop-oldest:<cap>', got {raw:?}"),
        })
    }
}

/// Encoder scale target, e.g. "1280x720".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleTarget {
    pub width: u32,
    pub height: u32,
}

impl ScaleTarget {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |detail: String| ConfigError::Invalid {
            name: "SCALE",
            detail,
        };
        let (w, h) = raw
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| invalid(format!("expected WxH, got {raw:?}")))?;
        let width: u32 = w
            .parse()
            .map_err(|_| invalid(format!("bad width in {raw:?}")))?;
        let height: u32 = h
            .parse()
            .map_err(|_| invalid(format!("bad height in {raw:?}")))?;
        if width == 0 || height == 0 {
            return Err(invalid("dimensions must be non-zero".into()));
        }
        Ok(Self { width, height })
    }

    pub fn filter(&self) -> String {
        format!("scale={}:{}", self.width, self.height)
    }
}

/// Process configuration, loaded once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP control surface listen address.
    pub bind_addr: String,
    /// DevTools HTTP endpoint of the headless browser, host:port.
    pub chrome_host: String,
    /// Ingest endpoint. Required; immutable for the process lifetime.
    pub rtmp_url: String,
    /// Capture cadence and encoder output rate, 1-5 inclusive.
    pub frame_rate: u32,
    pub scale: ScaleTarget,
    pub ffmpeg_bin: String,
    pub queue_policy: QueuePolicy,
    /// When set, logs additionally go to daily-rolling files in this dir.
    pub log_dir: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name->value lookup, so tests don't touch the process
    /// environment.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let rtmp_url = get("RTMP_URL").ok_or(ConfigError::Missing("RTMP_URL"))?;

        let frame_rate = match get("FRAME_RATE") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| ConfigError::Invalid {
                name: "FRAME_RATE",
                detail: format!("not an integer: {raw:?}"),
            })?,
            None => 3,
        };
        if !(MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&frame_rate) {
            return Err(ConfigError::Invalid {
                name: "FRAME_RATE",
                detail: format!(
                    "{frame_rate} outside valid range {MIN_FRAME_RATE}-{MAX_FRAME_RATE}"
                ),
            });
        }

        let scale = match get("SCALE") {
            Some(raw) => ScaleTarget::parse(&raw)?,
            None => ScaleTarget {
                width: 1280,
                height: 720,
            },
        };

        let queue_policy = match get("QUEUE_POLICY") {
            Some(raw) => QueuePolicy::parse(&raw)?,
            None => QueuePolicy::Unbounded,
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".into()),
            chrome_host: get("CHROME_HOST").unwrap_or_else(|| "127.0.0.1:9222".into()),
            rtmp_url,
            frame_rate,
            scale,
            ffmpeg_bin: get("FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".into()),
            queue_policy,
            log_dir: get("LOG_DIR"),
        })
    }
}
