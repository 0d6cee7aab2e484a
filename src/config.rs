use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Timing, queue and capture settings for the engine workers.
/// Every field is optional in the JSON form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Transmit loop period (~40 Hz)
    pub transmit_period_ms: u64,
    /// Pause after a failed hardware write before the loop resumes
    pub backoff_ms: u64,
    /// Playback tick period
    pub tick_period_ms: u64,
    /// Pending controller events before new ones are dropped
    pub controller_queue: usize,
    /// Pending audio blocks before new ones are dropped
    pub audio_queue: usize,
    /// Pending advisory notifications before new ones are dropped
    pub notification_queue: usize,
    pub audio: AudioConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transmit_period_ms: 25,
            backoff_ms: 100,
            tick_period_ms: 40,
            controller_queue: 256,
            audio_queue: 8,
            notification_queue: 64,
            audio: AudioConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn transmit_period(&self) -> Duration {
        Duration::from_millis(self.transmit_period_ms.max(1))
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Samples per analysis block
    pub block_size: usize,
    /// User gain applied after automatic gain control
    pub gain: f32,
    /// Input device index, `None` for the host default
    pub device_index: Option<usize>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            block_size: 1024,
            gain: 1.0,
            device_index: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "tick_period_ms": 20, "audio": { "gain": 2.5 } }"#).unwrap();
        assert_eq!(config.tick_period_ms, 20);
        assert_eq!(config.transmit_period_ms, 25);
        assert_eq!(config.audio.gain, 2.5);
        assert_eq!(config.audio.block_size, 1024);
    }
}
