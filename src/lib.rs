//! Show control core: an HTP DMX universe fed by playback, controller mappings and
//! audio-reactive effects, transmitted over a serial DMX line or Art-Net.

pub mod artnet;
pub mod audio;
pub mod config;
pub mod console;
pub mod effects;
pub mod engine;
pub mod error;
pub mod fx_chase;
pub mod midi;
pub mod output;
pub mod playback;
pub mod reaction;
pub mod serial;
pub mod show;
pub mod universe;

pub use config::EngineConfig;
pub use engine::{Engine, Notification};
pub use error::{Error, Result};
pub use show::ShowDocument;
