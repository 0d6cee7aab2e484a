//! Channel Universe
//!
//! Five parallel 513-byte buffers and the "highest takes precedence" merge:
//!
//! - [`Layer::Live`] - faders, controller mappings and generative effects
//! - [`Layer::Scene`] - the active scene
//! - [`Layer::Chase`] - the running chase
//! - [`Layer::Cue`] - the playing cue recording
//! - [`Layer::Output`] - `max` of the four layers above, sent to hardware
//!
//! Every buffer lives behind an [`ArcSwap`]: whole-frame replacement is a single pointer
//! swap and single-channel writes are read-copy-update, so a reader never observes a frame
//! mixed from two generations.

use std::sync::Arc;

use arc_swap::ArcSwap;
pub use open_dmx::DMX_CHANNELS;
use open_dmx::check_valid_channel;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display, EnumIter};

use crate::error::{Error, Result};

/// Frame length on the wire: start code + 512 channels.
pub const FRAME_LEN: usize = DMX_CHANNELS + 1;

/// DMX512 null start code, always byte 0 of a frame.
pub const START_CODE: u8 = 0x00;

/// Clamps any integer level into the DMX range.
pub fn clamp_level(value: i64) -> u8 {
    value.clamp(0, 255) as u8
}

/// A full universe snapshot. Index 0 is the start code and is always 0,
/// indices 1-512 are channel levels.
#[derive(Clone, PartialEq, Eq)]
pub struct DmxFrame([u8; FRAME_LEN]);

impl Default for DmxFrame {
    fn default() -> Self {
        Self([0; FRAME_LEN])
    }
}

impl std::fmt::Debug for DmxFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lit = self.0.iter().skip(1).filter(|v| **v > 0).count();
        f.debug_struct("DmxFrame").field("lit_channels", &lit).finish()
    }
}

// Frames persist as a plain list of 513 levels.
impl Serialize for DmxFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.as_slice().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DmxFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Ok(Self::from_slice(&bytes))
    }
}

impl DmxFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a frame from arbitrary bytes. Short input is zero padded, long input is
    /// truncated, and the start code is forced to 0.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut frame = Self::default();
        let len = bytes.len().min(FRAME_LEN);
        frame.0[..len].copy_from_slice(&bytes[..len]);
        frame.0[0] = START_CODE;
        frame
    }

    /// Level of `channel` (1-512). Out of range channels read as 0.
    pub fn get(&self, channel: usize) -> u8 {
        match channel {
            1..=DMX_CHANNELS => self.0[channel],
            _ => 0,
        }
    }

    /// Sets `channel` (1-512). Out of range channels are ignored.
    pub fn set(&mut self, channel: usize, value: u8) {
        if (1..=DMX_CHANNELS).contains(&channel) {
            self.0[channel] = value;
        }
    }

    /// Raises `channel` to `value` if it is currently lower.
    pub fn merge_max(&mut self, channel: usize, value: u8) {
        if (1..=DMX_CHANNELS).contains(&channel) && self.0[channel] < value {
            self.0[channel] = value;
        }
    }

    /// The whole 513-byte frame including the start code.
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    /// Channel data only (512 bytes, channel 1 first).
    pub fn channels(&self) -> &[u8] {
        &self.0[1..]
    }

    pub fn is_dark(&self) -> bool {
        self.channels().iter().all(|v| *v == 0)
    }

    /// Per-channel maximum of all `frames`. Byte 0 stays 0.
    pub fn htp<'a>(frames: impl IntoIterator<Item = &'a DmxFrame>) -> Self {
        let mut out = Self::default();
        for frame in frames {
            for (dst, src) in out.0[1..].iter_mut().zip(frame.0[1..].iter()) {
                if *src > *dst {
                    *dst = *src;
                }
            }
        }
        out
    }
}

/// The five named buffers of the universe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Layer {
    Live,
    Scene,
    Chase,
    Cue,
    Output,
}

impl Layer {
    fn index(self) -> usize {
        self as usize
    }

    /// Layers merged into [`Layer::Output`].
    pub fn sources() -> [Layer; 4] {
        [Layer::Live, Layer::Scene, Layer::Chase, Layer::Cue]
    }
}

/// The shared buffer set. Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Universe {
    buffers: [ArcSwap<DmxFrame>; 5],
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}

impl Universe {
    pub fn new() -> Self {
        Self {
            buffers: std::array::from_fn(|_| ArcSwap::from_pointee(DmxFrame::default())),
        }
    }

    fn buffer(&self, layer: Layer) -> &ArcSwap<DmxFrame> {
        &self.buffers[layer.index()]
    }

    /// Stores `clamp(value, 0, 255)` into one channel of `layer`.
    pub fn write(&self, layer: Layer, channel: usize, value: i64) -> Result<()> {
        if check_valid_channel(channel).is_err() {
            return Err(Error::InvalidChannel(channel));
        }
        let level = clamp_level(value);
        self.buffer(layer).rcu(|current| {
            let mut frame = DmxFrame::clone(current);
            frame.set(channel, level);
            frame
        });
        Ok(())
    }

    /// Writes the same level into several channels of `layer` as one swap.
    /// Out of range channels are skipped.
    pub fn write_many(&self, layer: Layer, channels: &[u16], value: i64) {
        if channels.is_empty() {
            return;
        }
        let level = clamp_level(value);
        self.update(layer, |frame| {
            for ch in channels {
                frame.set(*ch as usize, level);
            }
        });
    }

    /// Read-copy-update of a whole buffer. `f` may be called more than once under contention.
    pub fn update(&self, layer: Layer, mut f: impl FnMut(&mut DmxFrame)) {
        self.buffer(layer).rcu(|current| {
            let mut frame = DmxFrame::clone(current);
            f(&mut frame);
            frame
        });
    }

    /// Atomically swaps the whole buffer for `frame`.
    pub fn replace(&self, layer: Layer, frame: DmxFrame) {
        self.buffer(layer).store(Arc::new(frame));
    }

    pub fn clear(&self, layer: Layer) {
        self.replace(layer, DmxFrame::default());
    }

    /// Current contents of `layer`.
    pub fn snapshot(&self, layer: Layer) -> Arc<DmxFrame> {
        self.buffer(layer).load_full()
    }

    pub fn level(&self, layer: Layer, channel: usize) -> u8 {
        self.buffer(layer).load().get(channel)
    }

    /// `Output[i] = max(Live[i], Scene[i], Chase[i], Cue[i])`, `Output[0] = 0`.
    /// Returns the freshly stored output frame.
    pub fn recompute(&self) -> Arc<DmxFrame> {
        let sources = Layer::sources().map(|layer| self.snapshot(layer));
        let output = Arc::new(DmxFrame::htp(sources.iter().map(|f| f.as_ref())));
        self.buffer(Layer::Output).store(Arc::clone(&output));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_clamps_into_dmx_range() {
        let universe = Universe::new();
        universe.write(Layer::Live, 1, 300).unwrap();
        universe.write(Layer::Live, 2, -20).unwrap();
        universe.write(Layer::Live, 3, 128).unwrap();
        assert_eq!(universe.level(Layer::Live, 1), 255);
        assert_eq!(universe.level(Layer::Live, 2), 0);
        assert_eq!(universe.level(Layer::Live, 3), 128);
    }

    #[test]
    fn write_rejects_out_of_range_channels() {
        let universe = Universe::new();
        assert!(matches!(
            universe.write(Layer::Live, 0, 10),
            Err(Error::InvalidChannel(0))
        ));
        assert!(universe.write(Layer::Live, 513, 10).is_err());
        assert!(universe.snapshot(Layer::Live).is_dark());
    }

    #[test]
    fn recompute_takes_highest_value_per_channel() {
        let universe = Universe::new();
        universe.write(Layer::Live, 1, 10).unwrap();
        universe.write(Layer::Scene, 1, 200).unwrap();
        universe.write(Layer::Chase, 2, 50).unwrap();
        universe.write(Layer::Cue, 2, 40).unwrap();
        universe.write(Layer::Cue, 512, 7).unwrap();

        let out = universe.recompute();
        for ch in 1..=DMX_CHANNELS {
            let expected = Layer::sources()
                .iter()
                .map(|l| universe.level(*l, ch))
                .max()
                .unwrap();
            assert_eq!(out.get(ch), expected, "channel {ch}");
        }
        assert_eq!(out.as_bytes()[0], 0);
        assert_eq!(universe.level(Layer::Output, 1), 200);
    }

    #[test]
    fn replace_swaps_the_whole_buffer() {
        let universe = Universe::new();
        universe.write(Layer::Scene, 5, 99).unwrap();
        let mut frame = DmxFrame::new();
        frame.set(7, 42);
        universe.replace(Layer::Scene, frame);
        assert_eq!(universe.level(Layer::Scene, 5), 0);
        assert_eq!(universe.level(Layer::Scene, 7), 42);
    }

    #[test]
    fn snapshots_are_not_affected_by_later_writes() {
        let universe = Universe::new();
        universe.write(Layer::Live, 1, 1).unwrap();
        let before = universe.snapshot(Layer::Live);
        universe.write(Layer::Live, 1, 2).unwrap();
        assert_eq!(before.get(1), 1);
        assert_eq!(universe.level(Layer::Live, 1), 2);
    }

    #[test]
    fn from_slice_forces_start_code_and_length() {
        let frame = DmxFrame::from_slice(&[9, 1, 2]);
        assert_eq!(frame.as_bytes().len(), FRAME_LEN);
        assert_eq!(frame.as_bytes()[0], 0);
        assert_eq!(frame.get(2), 2);
        assert_eq!(frame.get(3), 0);
    }
}
