use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::RecognitionSettings;

/// Runtime configuration, loaded from `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Downscale factor applied before detection (default: 0.5).
    pub resize_scale: f32,
    /// Maximum embedding distance for a positive match.
    pub match_tolerance: f32,
    /// Global cooldown between attendance updates, in seconds.
    pub detection_cooldown_secs: u64,
    /// Per-student cooldown between marked attendances, in hours.
    pub attendance_cooldown_hours: u64,
    pub redis_host: String,
    pub redis_port: u16,
    /// Bound on each store connect/read/write.
    pub store_timeout_ms: u64,
    /// Archive of enrollment images, also the upload directory.
    pub images_dir: PathBuf,
    /// Directory holding the ONNX models.
    pub model_dir: PathBuf,
    /// `/dev/video{N}` indices tried in order at startup.
    pub camera_indices: Vec<u32>,
    /// Font used for frame labels.
    pub font_path: Option<PathBuf>,
    /// HTTP listen address.
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resize_scale: 0.5,
            match_tolerance: 1.1,
            detection_cooldown_secs: 3,
            attendance_cooldown_hours: 24,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            store_timeout_ms: 500,
            images_dir: PathBuf::from("static/uploads"),
            model_dir: rollcall_core::default_model_dir(),
            camera_indices: vec![0, 1, 2],
            font_path: None,
            bind_addr: "0.0.0.0:5000".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            resize_scale: env_or("ROLLCALL_RESIZE_SCALE", defaults.resize_scale),
            match_tolerance: env_or("ROLLCALL_MATCH_TOLERANCE", defaults.match_tolerance),
            detection_cooldown_secs: env_or(
                "ROLLCALL_DETECTION_COOLDOWN_SECS",
                defaults.detection_cooldown_secs,
            ),
            attendance_cooldown_hours: env_or(
                "ROLLCALL_ATTENDANCE_COOLDOWN_HOURS",
                defaults.attendance_cooldown_hours,
            ),
            redis_host: env_or("ROLLCALL_REDIS_HOST", defaults.redis_host),
            redis_port: env_or("ROLLCALL_REDIS_PORT", defaults.redis_port),
            store_timeout_ms: env_or("ROLLCALL_STORE_TIMEOUT_MS", defaults.store_timeout_ms),
            images_dir: std::env::var("ROLLCALL_IMAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.images_dir),
            model_dir: std::env::var("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            camera_indices: std::env::var("ROLLCALL_CAMERA_INDICES")
                .ok()
                .and_then(|raw| parse_indices(&raw))
                .unwrap_or(defaults.camera_indices),
            font_path: std::env::var("ROLLCALL_FONT_PATH").ok().map(PathBuf::from),
            bind_addr: env_or("ROLLCALL_BIND", defaults.bind_addr),
        }
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }

    pub fn recognition(&self) -> RecognitionSettings {
        let scale = if self.resize_scale > 0.0 && self.resize_scale <= 1.0 {
            self.resize_scale
        } else {
            tracing::warn!(value = self.resize_scale, "resize scale out of (0, 1]; using 1.0");
            1.0
        };
        RecognitionSettings {
            resize_scale: scale,
            match_tolerance: self.match_tolerance,
            detection_cooldown: chrono::Duration::seconds(self.detection_cooldown_secs as i64),
            attendance_cooldown: chrono::Duration::hours(self.attendance_cooldown_hours as i64),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T>(key: &str, raw: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    raw.trim().parse().unwrap_or_else(|e| {
        tracing::warn!(key, value = raw, error = %e, "invalid value, using default {default}");
        default
    })
}

/// Parse a comma-separated list like `0,1,2`. Empty or malformed input is `None`.
fn parse_indices(raw: &str) -> Option<Vec<u32>> {
    let indices: Result<Vec<u32>, _> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect();
    match indices {
        Ok(list) if !list.is_empty() => Some(list),
        _ => {
            tracing::warn!(value = raw, "invalid ROLLCALL_CAMERA_INDICES, using default");
            None
        }
    }
}
