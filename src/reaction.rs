//! Audio reaction links: one audio source driving one fixture attribute across a group.

use std::fmt;

use strum::{Display, EnumIter, EnumString};
use tracing::{debug, info};

use crate::audio::AudioSnapshot;
use crate::error::{Error, Result};
use crate::show::{Role, ShowDocument};
use crate::universe::{Layer, Universe};

/// Per-block release of a trigger source after its onset.
const TRIGGER_RELEASE: f64 = 0.90;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum ReactionSource {
    #[strum(to_string = "Bass", serialize = "low")]
    Bass,
    #[strum(to_string = "Mid", serialize = "voice")]
    Mid,
    #[strum(to_string = "High", serialize = "hat")]
    High,
    #[strum(to_string = "Volume", serialize = "vol")]
    Volume,
    #[strum(to_string = "Kick", serialize = "kick trig")]
    Kick,
    #[strum(to_string = "Snare", serialize = "snare trig")]
    Snare,
}

impl ReactionSource {
    fn is_trigger(self) -> bool {
        matches!(self, ReactionSource::Kick | ReactionSource::Snare)
    }

    /// Weight of the previous value in the band smoothing.
    fn smoothing(self) -> f64 {
        match self {
            ReactionSource::Bass => 0.2,
            ReactionSource::Mid => 0.1,
            ReactionSource::High => 0.6,
            _ => 0.5,
        }
    }

    fn raw(self, audio: &AudioSnapshot) -> f64 {
        match self {
            ReactionSource::Bass => audio.bass() as f64,
            ReactionSource::Mid => audio.mid() as f64,
            ReactionSource::High => audio.high() as f64,
            ReactionSource::Volume => audio.volume as f64,
            ReactionSource::Kick => u8::from(audio.kick) as f64,
            ReactionSource::Snare => u8::from(audio.snare) as f64,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReactionLink {
    pub source: ReactionSource,
    pub group: String,
    /// Only group channels performing this role are written
    pub attribute: Role,
    pub min: u8,
    pub max: u8,
    value: f64,
}

impl fmt::Display for ReactionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}.{} [{}..{}]",
            self.source, self.group, self.attribute, self.min, self.max
        )
    }
}

impl ReactionLink {
    pub fn new(source: ReactionSource, group: impl Into<String>, attribute: Role) -> Self {
        Self {
            source,
            group: group.into(),
            attribute,
            min: 0,
            max: 255,
            value: 0.0,
        }
    }

    pub fn with_range(mut self, min: u8, max: u8) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Advances the follower by one block and returns the output level.
    pub fn process(&mut self, audio: &AudioSnapshot) -> u8 {
        let raw = self.source.raw(audio);
        if self.source.is_trigger() {
            if raw > 0.0 {
                self.value = 255.0;
            } else {
                self.value *= TRIGGER_RELEASE;
                if self.value < 1.0 {
                    self.value = 0.0;
                }
            }
        } else {
            let s = self.source.smoothing();
            self.value = self.value * s + raw * (1.0 - s);
        }
        let level = self.value.trunc();
        let span = self.max as f64 - self.min as f64;
        (self.min as f64 + level * span / 255.0).clamp(0.0, 255.0) as u8
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

#[derive(Debug, Default)]
pub struct ReactionEngine {
    links: Vec<ReactionLink>,
}

impl ReactionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, link: ReactionLink) -> usize {
        info!(%link, "reaction link added");
        self.links.push(link);
        self.links.len() - 1
    }

    pub fn remove(&mut self, index: usize) -> Result<ReactionLink> {
        if index >= self.links.len() {
            return Err(Error::UnknownItem {
                kind: "reaction link",
                name: index.to_string(),
            });
        }
        let link = self.links.remove(index);
        info!(%link, "reaction link removed");
        Ok(link)
    }

    pub fn links(&self) -> &[ReactionLink] {
        &self.links
    }

    pub fn clear(&mut self) {
        self.links.clear();
    }

    /// Writes every link's level into Live. Runs after the generative effects so links win
    /// on shared channels.
    pub fn tick(&mut self, doc: &ShowDocument, audio: &AudioSnapshot, universe: &Universe) {
        if self.links.is_empty() {
            return;
        }
        let mut writes: Vec<(u16, u8)> = Vec::new();
        for link in &mut self.links {
            let level = link.process(audio);
            let channels = doc.group_channels(&link.group);
            if channels.is_empty() {
                continue;
            }
            writes.extend(
                channels
                    .iter()
                    .filter(|ch| doc.channel_has_role(**ch, link.attribute))
                    .map(|ch| (*ch, level)),
            );
        }
        if writes.is_empty() {
            return;
        }
        debug!(channels = writes.len(), "reaction write");
        universe.update(Layer::Live, |frame| {
            for (ch, level) in &writes {
                frame.set(*ch as usize, *level);
            }
        });
    }
}
