//! Presence DLP - Service Configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DlpError, DlpResult};

/// Name of the config file inside the data directory
pub const CONFIG_FILE: &str = "config.json";

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root for the database, wrapped keys and token
    pub data_dir: PathBuf,
    /// Capture device index
    pub camera_index: u32,
    /// Maximum embedding distance for an identity match
    pub face_tolerance: f32,
    /// Downscale factor applied before face search
    pub frame_scaling: f32,
    /// Spool frames older than this are never analyzed
    pub max_frame_age_ms: u64,
    /// Target tick interval of the monitoring loop
    pub tick_interval_ms: u64,
    /// Sleep floor between ticks when a tick overran
    pub min_sleep_ms: u64,
    /// Consecutive authorization misses before blocking
    pub miss_tolerance: u32,
    /// A viewer counts as active this long after its last heartbeat
    pub heartbeat_window_ms: u64,
    /// Frames examined by a full liveness check
    pub liveness_frames: u32,
    /// Margin around a detected face for spoof analysis (full-res pixels)
    pub crop_padding: u32,
    /// Gateway bind address (loopback only)
    pub gateway_host: IpAddr,
    /// Gateway port
    pub gateway_port: u16,
    /// Client connect/read/write timeout
    pub client_timeout_ms: u64,
    /// Largest accepted protocol message
    pub max_frame_len: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            camera_index: 0,
            face_tolerance: 0.5,
            frame_scaling: 0.5,
            max_frame_age_ms: 1000,
            tick_interval_ms: 500,
            min_sleep_ms: 100,
            miss_tolerance: 2,
            heartbeat_window_ms: 2000,
            liveness_frames: 5,
            crop_padding: 20,
            gateway_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            gateway_port: 65432,
            client_timeout_ms: 2000,
            max_frame_len: 1024 * 1024,
        }
    }
}

impl ServiceConfig {
    /// Load `<data_dir>/config.json`, falling back to defaults when absent
    pub fn load(data_dir: &Path) -> DlpResult<Self> {
        Self::load_from(&data_dir.join(CONFIG_FILE), data_dir)
    }

    /// Load from an explicit file; `data_dir` wins over the file's value
    pub fn load_from(path: &Path, data_dir: &Path) -> DlpResult<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str::<ServiceConfig>(&raw)
                .map_err(|e| DlpError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            ServiceConfig::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Persist as pretty JSON
    pub fn save(&self) -> DlpResult<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(self.data_dir.join(CONFIG_FILE), json)?;
        Ok(())
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> DlpResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(DlpError::Config("tick_interval_ms must be > 0".into()));
        }
        if self.max_frame_age_ms == 0 {
            return Err(DlpError::Config("max_frame_age_ms must be > 0".into()));
        }
        if !(self.frame_scaling > 0.0 && self.frame_scaling <= 1.0) {
            return Err(DlpError::Config("frame_scaling must be in (0, 1]".into()));
        }
        if self.face_tolerance <= 0.0 {
            return Err(DlpError::Config("face_tolerance must be > 0".into()));
        }
        if self.miss_tolerance == 0 {
            return Err(DlpError::Config("miss_tolerance must be >= 1".into()));
        }
        if self.liveness_frames == 0 {
            return Err(DlpError::Config("liveness_frames must be >= 1".into()));
        }
        if !self.gateway_host.is_loopback() {
            return Err(DlpError::Config("gateway_host must be a loopback address".into()));
        }
        Ok(())
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.data_dir.join("master.key")
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join("ipc.token")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("dlp.db")
    }

    /// Spool directory the capture helper writes frames into
    pub fn frames_dir(&self) -> PathBuf {
        self.data_dir.join(format!("camera{}", self.camera_index))
    }

    pub fn gateway_addr(&self) -> SocketAddr {
        SocketAddr::new(self.gateway_host, self.gateway_port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn max_frame_age(&self) -> Duration {
        Duration::from_millis(self.max_frame_age_ms)
    }

    pub fn min_sleep(&self) -> Duration {
        Duration::from_millis(self.min_sleep_ms)
    }

    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_millis(self.heartbeat_window_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }
}

/// Platform data directory for the agent
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("presence-dlp")
}
