use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on concurrently active output surfaces (one RAW-family, one
/// YUV, one JPEG).
pub const MAX_OUTPUT_SURFACES: usize = 3;

/// Smallest reader depth that still covers the device's in-flight pipeline.
pub const MIN_READER_BUFFERS: usize = 8;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ItsConfig {
    pub server: ServerConfig,
    pub camera: CameraConfig,
    pub timeouts: TimeoutConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// IP address to bind to
    #[serde(default = "default_server_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Time allowed for queued responses to drain when a session ends
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Exit after the first session instead of waiting for another client
    #[serde(default = "default_single_session")]
    pub single_session: bool,

    /// Longest accepted command line; longer lines are discarded
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Identifier of the device to open
    #[serde(default = "default_camera_id")]
    pub id: String,

    /// Buffer depth of each image reader
    #[serde(default = "default_reader_buffers")]
    pub reader_buffers: usize,

    /// Maximum output surfaces per capture batch
    #[serde(default = "default_max_output_surfaces")]
    pub max_output_surfaces: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeoutConfig {
    /// Absolute deadline for a capture batch to complete
    #[serde(default = "default_capture_ms")]
    pub capture_ms: u64,

    /// Absolute deadline for 3A to converge
    #[serde(default = "default_three_a_ms")]
    pub three_a_ms: u64,

    /// Deadline for the device to report the busy transition after configuration
    #[serde(default = "default_state_ms")]
    pub state_ms: u64,

    /// Deadline for the device to report idle after configuration
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
}

/// Parameters of the built-in simulated device
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SimulatorConfig {
    #[serde(default = "default_yuv_sizes")]
    pub yuv_sizes: Vec<(u32, u32)>,

    #[serde(default = "default_jpeg_sizes")]
    pub jpeg_sizes: Vec<(u32, u32)>,

    #[serde(default = "default_raw_sizes")]
    pub raw_sizes: Vec<(u32, u32)>,

    /// Active sensor array (width, height)
    #[serde(default = "default_active_array")]
    pub active_array: (u32, u32),

    /// Minimum focus distance in diopters; 0 means a fixed-focus lens
    #[serde(default = "default_min_focus_distance")]
    pub min_focus_distance: f32,

    /// Frames after an AE precapture trigger until AE reports converged
    #[serde(default = "default_ae_converge_frames")]
    pub ae_converge_frames: u32,

    /// Frames until AWB reports converged
    #[serde(default = "default_awb_converge_frames")]
    pub awb_converge_frames: u32,

    /// Frames after an AF trigger until AF reports focused-locked
    #[serde(default = "default_af_converge_frames")]
    pub af_converge_frames: u32,

    /// Artificial delay before each capture result is delivered
    #[serde(default = "default_result_delay_ms")]
    pub result_delay_ms: u64,

    /// Motion sensor sample rate; 0 disables the simulated sensors
    #[serde(default = "default_sensor_rate_hz")]
    pub sensor_rate_hz: u32,
}

impl ItsConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("itscam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let size_list = |sizes: Vec<(u32, u32)>| -> Vec<Vec<u32>> {
            sizes.into_iter().map(|(w, h)| vec![w, h]).collect()
        };

        let settings = Config::builder()
            .set_default("server.ip", default_server_ip())?
            .set_default("server.port", default_server_port())?
            .set_default("server.drain_timeout_ms", default_drain_timeout_ms())?
            .set_default("server.single_session", default_single_session())?
            .set_default("server.max_line_bytes", default_max_line_bytes() as i64)?
            .set_default("camera.id", default_camera_id())?
            .set_default("camera.reader_buffers", default_reader_buffers() as i64)?
            .set_default(
                "camera.max_output_surfaces",
                default_max_output_surfaces() as i64,
            )?
            .set_default("timeouts.capture_ms", default_capture_ms())?
            .set_default("timeouts.three_a_ms", default_three_a_ms())?
            .set_default("timeouts.state_ms", default_state_ms())?
            .set_default("timeouts.idle_ms", default_idle_ms())?
            .set_default("simulator.yuv_sizes", size_list(default_yuv_sizes()))?
            .set_default("simulator.jpeg_sizes", size_list(default_jpeg_sizes()))?
            .set_default("simulator.raw_sizes", size_list(default_raw_sizes()))?
            .set_default(
                "simulator.active_array",
                vec![default_active_array().0, default_active_array().1],
            )?
            .set_default(
                "simulator.min_focus_distance",
                default_min_focus_distance() as f64,
            )?
            .set_default(
                "simulator.ae_converge_frames",
                default_ae_converge_frames(),
            )?
            .set_default(
                "simulator.awb_converge_frames",
                default_awb_converge_frames(),
            )?
            .set_default(
                "simulator.af_converge_frames",
                default_af_converge_frames(),
            )?
            .set_default("simulator.result_delay_ms", default_result_delay_ms())?
            .set_default("simulator.sensor_rate_hz", default_sensor_rate_hz())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Environment overrides, e.g. ITS_SERVER__PORT=7000
            .add_source(
                Environment::with_prefix("ITS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: ItsConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Message(
                "Server port must be greater than 0".to_string(),
            ));
        }

        if self.server.max_line_bytes == 0 {
            return Err(ConfigError::Message(
                "Server max_line_bytes must be greater than 0".to_string(),
            ));
        }

        if self.camera.reader_buffers < MIN_READER_BUFFERS {
            return Err(ConfigError::Message(format!(
                "Camera reader_buffers must be at least {}",
                MIN_READER_BUFFERS
            )));
        }

        if self.camera.max_output_surfaces == 0
            || self.camera.max_output_surfaces > MAX_OUTPUT_SURFACES
        {
            return Err(ConfigError::Message(format!(
                "Camera max_output_surfaces must be between 1 and {}",
                MAX_OUTPUT_SURFACES
            )));
        }

        let timeouts = [
            ("capture_ms", self.timeouts.capture_ms),
            ("three_a_ms", self.timeouts.three_a_ms),
            ("state_ms", self.timeouts.state_ms),
            ("idle_ms", self.timeouts.idle_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Message(format!(
                    "Timeout {} must be greater than 0",
                    name
                )));
            }
        }

        if self.simulator.yuv_sizes.is_empty() {
            return Err(ConfigError::Message(
                "Simulator must offer at least one YUV size".to_string(),
            ));
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl TimeoutConfig {
    pub fn capture(&self) -> Duration {
        Duration::from_millis(self.capture_ms)
    }

    pub fn three_a(&self) -> Duration {
        Duration::from_millis(self.three_a_ms)
    }

    pub fn state(&self) -> Duration {
        Duration::from_millis(self.state_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

impl Default for ItsConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                ip: default_server_ip(),
                port: default_server_port(),
                drain_timeout_ms: default_drain_timeout_ms(),
                single_session: default_single_session(),
                max_line_bytes: default_max_line_bytes(),
            },
            camera: CameraConfig {
                id: default_camera_id(),
                reader_buffers: default_reader_buffers(),
                max_output_surfaces: default_max_output_surfaces(),
            },
            timeouts: TimeoutConfig::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            capture_ms: default_capture_ms(),
            three_a_ms: default_three_a_ms(),
            state_ms: default_state_ms(),
            idle_ms: default_idle_ms(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            yuv_sizes: default_yuv_sizes(),
            jpeg_sizes: default_jpeg_sizes(),
            raw_sizes: default_raw_sizes(),
            active_array: default_active_array(),
            min_focus_distance: default_min_focus_distance(),
            ae_converge_frames: default_ae_converge_frames(),
            awb_converge_frames: default_awb_converge_frames(),
            af_converge_frames: default_af_converge_frames(),
            result_delay_ms: default_result_delay_ms(),
            sensor_rate_hz: default_sensor_rate_hz(),
        }
    }
}

// Default value functions
fn default_server_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    6000
}
fn default_drain_timeout_ms() -> u64 {
    1000
}
fn default_single_session() -> bool {
    false
}
fn default_max_line_bytes() -> usize {
    1 << 20
}

fn default_camera_id() -> String {
    "0".to_string()
}
fn default_reader_buffers() -> usize {
    MIN_READER_BUFFERS
}
fn default_max_output_surfaces() -> usize {
    MAX_OUTPUT_SURFACES
}

fn default_capture_ms() -> u64 {
    10_000
}
fn default_three_a_ms() -> u64 {
    10_000
}
fn default_state_ms() -> u64 {
    500
}
fn default_idle_ms() -> u64 {
    2000
}

fn default_yuv_sizes() -> Vec<(u32, u32)> {
    vec![(640, 480), (320, 240)]
}
fn default_jpeg_sizes() -> Vec<(u32, u32)> {
    vec![(640, 480), (320, 240)]
}
fn default_raw_sizes() -> Vec<(u32, u32)> {
    vec![(656, 496)]
}
fn default_active_array() -> (u32, u32) {
    (640, 480)
}
fn default_min_focus_distance() -> f32 {
    10.0
}
fn default_ae_converge_frames() -> u32 {
    3
}
fn default_awb_converge_frames() -> u32 {
    1
}
fn default_af_converge_frames() -> u32 {
    2
}
fn default_result_delay_ms() -> u64 {
    0
}
fn default_sensor_rate_hz() -> u32 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ItsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.timeouts.state(), Duration::from_millis(500));
        assert_eq!(config.timeouts.idle(), Duration::from_millis(2000));
        assert_eq!(config.timeouts.capture(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[server]\nport = 6100\n\n[timeouts]\ncapture_ms = 2500\n\n[simulator]\nyuv_sizes = [[1280, 720]]\nmin_focus_distance = 0.0"
        )
        .unwrap();

        let config = ItsConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 6100);
        assert_eq!(config.timeouts.capture_ms, 2500);
        assert_eq!(config.timeouts.three_a_ms, 10_000);
        assert_eq!(config.simulator.yuv_sizes, vec![(1280, 720)]);
        assert_eq!(config.simulator.min_focus_distance, 0.0);
        assert_eq!(config.camera.reader_buffers, MIN_READER_BUFFERS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ItsConfig::load_from_file("/nonexistent/itscam-test.toml").unwrap();
        assert_eq!(config.timeouts.idle_ms, 2000);
        assert_eq!(config.camera.max_output_surfaces, MAX_OUTPUT_SURFACES);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ItsConfig::default();

        config.server.max_line_bytes = 0;
        assert!(config.validate().is_err());
        config.server.max_line_bytes = 4096;

        config.camera.reader_buffers = 4;
        assert!(config.validate().is_err());
        config.camera.reader_buffers = 8;
        assert!(config.validate().is_ok());

        config.camera.max_output_surfaces = 4;
        assert!(config.validate().is_err());
        config.camera.max_output_surfaces = 3;

        config.timeouts.three_a_ms = 0;
        assert!(config.validate().is_err());
        config.timeouts.three_a_ms = 10_000;

        config.simulator.yuv_sizes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_print_config_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&ItsConfig::default()).unwrap();
        assert!(rendered.contains("[server]"));
        let parsed: ItsConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, 6000);
        assert_eq!(parsed.simulator.raw_sizes, vec![(656, 496)]);
    }
}
