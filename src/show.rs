//! Show Document
//!
//! The persisted configuration shared by every engine component:
//!
//! ## Patch
//! - [`Fixture`] - A device patched at a start address with an ordered list of [`Role`]s
//! - [`Role`] - The function of one channel within a fixture
//!
//! ## Programming
//! - [`Scene`] - Sparse static channel levels
//! - [`Chase`] - Timed cyclic sequence of scenes
//! - [`Cue`] - Recorded full-universe frames
//! - groups - Named channel sets
//!
//! ## Control surface
//! - direct map - Signal id to the channels it drives
//! - [`RemoteTargets`] - Signal id to one or many [`Target`] descriptors
//! - [`Globals`] - Master chase speed and fade
//!
//! ## Running order
//! - [`ShowEntry`] - One step of the show sequencer
//!
//! Loading is tolerant: missing keys default to empty, entries of the wrong shape are skipped
//! with a warning, and legacy shapes (integer fixtures, `"data"` cue frames, `"type:name"`
//! show entries, bare-integer direct maps) are upgraded in place.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::universe::{DMX_CHANNELS, DmxFrame};

/// Chase master value at which base timings play unscaled.
pub const NEUTRAL_MASTER: u8 = 127;

/// Frame period assumed when sizing recorded cues in the running order.
pub const CUE_FRAME_MS: u64 = 40;

fn valid_channel(ch: i64) -> Option<u16> {
    (1..=DMX_CHANNELS as i64).contains(&ch).then_some(ch as u16)
}

fn level_from(value: &Value) -> Option<u8> {
    value.as_f64().map(|v| v.clamp(0.0, 255.0) as u8)
}

fn millis_from(value: &Value) -> u64 {
    value.as_f64().map(|v| v.max(0.0) as u64).unwrap_or(0)
}

/// Accepts integer or floating point milliseconds, negatives become 0.
fn lenient_millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    Ok(millis_from(&Value::deserialize(deserializer)?))
}

fn lenient_level<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u8, D::Error> {
    Ok(level_from(&Value::deserialize(deserializer)?).unwrap_or(NEUTRAL_MASTER))
}

fn default_master() -> u8 {
    NEUTRAL_MASTER
}

/// Channel function within a fixture profile.
/// Unknown names read back as [`Role::Other`].
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[serde(from = "String", into = "String")]
#[strum(ascii_case_insensitive)]
pub enum Role {
    /// Red emitter for RGB mixing
    Red,
    /// Green emitter for RGB mixing
    Green,
    /// Blue emitter for RGB mixing
    Blue,
    /// White emitter, derived from the RGB excess by generative effects
    White,
    /// Amber emitter
    Amber,
    /// Ultraviolet emitter
    UV,
    /// Master intensity
    Dimmer,
    /// Electronic strobe rate
    Strobe,
    /// Horizontal movement
    Pan,
    /// Vertical movement
    Tilt,
    /// Movement speed
    Speed,
    /// Built-in macro / program select
    Macro,
    /// Anything else
    Other,
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Role::from_str(value.trim()).unwrap_or(Role::Other)
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.to_string()
    }
}

/// A patched lighting device.
/// The fixture occupies `address .. address + profile.len()`; the channel at
/// `address + i` performs `profile[i]`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(from = "FixtureRepr")]
pub struct Fixture {
    /// DMX start address (1-512)
    #[serde(rename = "addr")]
    pub address: u16,
    /// Ordered channel roles
    pub profile: Vec<Role>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FixtureRepr {
    Full {
        addr: u16,
        #[serde(default)]
        profile: Vec<Role>,
    },
    // Oldest documents stored a bare start address for an RGB par.
    Legacy(u16),
}

impl From<FixtureRepr> for Fixture {
    fn from(value: FixtureRepr) -> Self {
        match value {
            FixtureRepr::Full { addr, profile } => Self {
                address: addr,
                profile,
            },
            FixtureRepr::Legacy(addr) => Self::rgb(addr),
        }
    }
}

impl Fixture {
    pub fn new(address: u16, profile: Vec<Role>) -> Self {
        Self { address, profile }
    }

    /// Three-channel RGB par.
    pub fn rgb(address: u16) -> Self {
        Self::new(address, vec![Role::Red, Role::Green, Role::Blue])
    }

    /// Absolute channels paired with their roles. Channels past 512 are dropped.
    pub fn channels(&self) -> impl Iterator<Item = (u16, Role)> + '_ {
        self.profile.iter().enumerate().filter_map(|(i, role)| {
            valid_channel(self.address as i64 + i as i64).map(|ch| (ch, *role))
        })
    }

    /// Absolute channel numbers of the footprint.
    pub fn footprint(&self) -> impl Iterator<Item = u16> + '_ {
        self.channels().map(|(ch, _)| ch)
    }

    /// Role performed by absolute `channel`, if it belongs to this fixture.
    pub fn role_at(&self, channel: u16) -> Option<Role> {
        let offset = channel.checked_sub(self.address)? as usize;
        self.profile.get(offset).copied()
    }
}

/// Sparse static levels. Channels not present are 0.
/// Persists as `{"<channel>": level}`.
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize)]
#[serde(transparent)]
pub struct Scene {
    pub levels: BTreeMap<u16, u8>,
}

impl<'de> Deserialize<'de> for Scene {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let levels = raw
            .iter()
            .filter_map(|(k, v)| {
                let ch = valid_channel(k.trim().parse().ok()?)?;
                Some((ch, level_from(v)?))
            })
            .collect();
        Ok(Self { levels })
    }
}

impl Scene {
    /// Captures the non-zero channels of `frame`.
    pub fn from_frame(frame: &DmxFrame) -> Self {
        let levels = (1..=DMX_CHANNELS)
            .filter_map(|ch| {
                let v = frame.get(ch);
                (v > 0).then_some((ch as u16, v))
            })
            .collect();
        Self { levels }
    }

    pub fn level(&self, channel: u16) -> u8 {
        self.levels.get(&channel).copied().unwrap_or(0)
    }

    /// Dense frame of this scene.
    pub fn to_frame(&self) -> DmxFrame {
        let mut frame = DmxFrame::new();
        for (ch, v) in &self.levels {
            frame.set(*ch as usize, *v);
        }
        frame
    }
}

/// Timed cyclic sequence of scene references.
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Chase {
    /// Scene names, played in order and wrapping around
    #[serde(default)]
    pub steps: Vec<String>,
    /// Base hold time of each step in milliseconds
    #[serde(rename = "h", alias = "hold", default, deserialize_with = "lenient_millis")]
    pub hold_ms: u64,
    /// Base crossfade time into the next step in milliseconds
    #[serde(rename = "f", alias = "fade", default, deserialize_with = "lenient_millis")]
    pub fade_ms: u64,
}

/// Recorded animation: full frames replayed one per playback tick.
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Cue {
    #[serde(alias = "data", default)]
    pub frames: Vec<DmxFrame>,
}

/// Kind part of a `"<kind>:<name>"` target descriptor.
/// Parsed from long or short spellings, always written in the short one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum TargetKind {
    #[strum(to_string = "sc", serialize = "scene")]
    Scene,
    #[strum(to_string = "ch", serialize = "chase")]
    Chase,
    #[strum(to_string = "cue")]
    Cue,
    #[strum(to_string = "grp", serialize = "group")]
    Group,
    #[strum(to_string = "global")]
    Global,
    #[strum(to_string = "fix", serialize = "fixture")]
    Fixture,
}

impl TargetKind {
    /// Scene, chase and cue targets toggle playback on an edge instead of following the value.
    pub fn is_toggle(self) -> bool {
        matches!(self, Self::Scene | Self::Chase | Self::Cue)
    }
}

/// A remote mapping target such as `sc:Intro` or `global:chase_speed`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Target {
    pub kind: TargetKind,
    pub name: String,
}

impl Target {
    pub fn new(kind: TargetKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || Error::UnknownItem {
            kind: "target",
            name: s.to_string(),
        };
        let (kind, name) = s.split_once(':').ok_or_else(unknown)?;
        let kind = TargetKind::from_str(kind.trim()).map_err(|_| unknown())?;
        if name.is_empty() {
            return Err(unknown());
        }
        Ok(Self::new(kind, name))
    }
}

/// One or many targets bound to a signal.
/// A single target persists as a string, several as a list.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct RemoteTargets(pub Vec<Target>);

impl RemoteTargets {
    /// Adds `target` unless it is already bound.
    pub fn insert(&mut self, target: Target) -> bool {
        if self.0.contains(&target) {
            return false;
        }
        self.0.push(target);
        true
    }

    pub fn remove(&mut self, target: &Target) -> bool {
        let before = self.0.len();
        self.0.retain(|t| t != target);
        before != self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Serialize for RemoteTargets {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0.as_slice() {
            [one] => serializer.serialize_str(&one.to_string()),
            many => serializer.collect_seq(many.iter().map(|t| t.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for RemoteTargets {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let texts: Vec<&str> = match &raw {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        let mut targets = RemoteTargets::default();
        for text in texts {
            match text.parse() {
                Ok(target) => {
                    targets.insert(target);
                }
                Err(e) => warn!(%e, "skipping remote target"),
            }
        }
        Ok(targets)
    }
}

/// Live-mutable global parameters a controller can drive.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum GlobalParam {
    ChaseSpeed,
    ChaseFade,
}

/// Master chase timing. 127 plays base timings unscaled, lower is shorter, higher is longer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Globals {
    /// Hold time master (0-255)
    #[serde(default = "default_master", deserialize_with = "lenient_level")]
    pub chase_speed: u8,
    /// Fade time master (0-255)
    #[serde(default = "default_master", deserialize_with = "lenient_level")]
    pub chase_fade: u8,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            chase_speed: NEUTRAL_MASTER,
            chase_fade: NEUTRAL_MASTER,
        }
    }
}

impl Globals {
    pub fn get(&self, param: GlobalParam) -> u8 {
        match param {
            GlobalParam::ChaseSpeed => self.chase_speed,
            GlobalParam::ChaseFade => self.chase_fade,
        }
    }

    pub fn set(&mut self, param: GlobalParam, value: u8) {
        match param {
            GlobalParam::ChaseSpeed => self.chase_speed = value,
            GlobalParam::ChaseFade => self.chase_fade = value,
        }
    }

    /// Sets a parameter by its persisted name. Returns false for unknown names.
    pub fn set_named(&mut self, name: &str, value: u8) -> bool {
        match GlobalParam::from_str(name) {
            Ok(param) => {
                self.set(param, value);
                true
            }
            Err(_) => false,
        }
    }
}

/// One step of the running order.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ShowEntry {
    /// Scene, chase or cue
    pub kind: TargetKind,
    /// Name of the item to toggle
    pub name: String,
    /// Auto-advance delay in milliseconds, 0 waits for a manual next
    pub duration_ms: u64,
}

impl ShowEntry {
    pub fn target(&self) -> Target {
        Target::new(self.kind, self.name.clone())
    }

    fn from_value(value: &Value) -> Option<Self> {
        let (kind, name, duration_ms) = match value {
            Value::String(s) => {
                let (kind, name) = s.split_once(':')?;
                (kind, name, 0)
            }
            Value::Object(o) => (
                o.get("type")?.as_str()?,
                o.get("name")?.as_str()?,
                o.get("duration").map(millis_from).unwrap_or(0),
            ),
            _ => return None,
        };
        let kind = TargetKind::from_str(kind).ok().filter(|k| k.is_toggle())?;
        Some(Self {
            kind,
            name: name.to_string(),
            duration_ms,
        })
    }
}

impl Serialize for ShowEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("type", &self.kind.to_string())?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("duration", &self.duration_ms)?;
        map.end()
    }
}

/// The whole persisted document.
#[derive(Clone, Default, PartialEq, Debug, Serialize)]
pub struct ShowDocument {
    /// Named sparse level sets
    pub scenes: BTreeMap<String, Scene>,
    /// Named scene sequences
    pub chases: BTreeMap<String, Chase>,
    /// Named recorded frame sequences
    pub cues: BTreeMap<String, Cue>,
    /// Named channel sets
    pub groups: BTreeMap<String, Vec<u16>>,
    /// Patched fixtures by name
    pub fixtures: BTreeMap<String, Fixture>,
    /// Direct controller mappings: signal id to channels
    pub map: BTreeMap<String, Vec<u16>>,
    /// Remote controller mappings: signal id to targets
    pub rem: BTreeMap<String, RemoteTargets>,
    /// Chase masters
    pub globals: Globals,
    /// Running order
    pub show: Vec<ShowEntry>,
}

fn entries<T: DeserializeOwned>(root: &Value, key: &str) -> BTreeMap<String, T> {
    let Some(object) = root.get(key).and_then(Value::as_object) else {
        return BTreeMap::new();
    };
    object
        .iter()
        .filter_map(|(name, value)| match T::deserialize(value) {
            Ok(item) => Some((name.clone(), item)),
            Err(e) => {
                warn!(section = key, %name, %e, "skipping malformed entry");
                None
            }
        })
        .collect()
}

fn channel_list(value: &Value) -> Vec<u16> {
    let mut channels: Vec<u16> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_i64().and_then(valid_channel))
            .collect(),
        other => other.as_i64().and_then(valid_channel).into_iter().collect(),
    };
    channels.sort_unstable();
    channels.dedup();
    channels
}

fn channel_lists(root: &Value, key: &str) -> BTreeMap<String, Vec<u16>> {
    let Some(object) = root.get(key).and_then(Value::as_object) else {
        return BTreeMap::new();
    };
    object
        .iter()
        .map(|(name, value)| (name.clone(), channel_list(value)))
        .filter(|(_, channels)| !channels.is_empty())
        .collect()
}

impl<'de> Deserialize<'de> for ShowDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(Self::from_value(&Value::deserialize(deserializer)?))
    }
}

impl ShowDocument {
    /// Builds a document from any JSON value, defaulting whatever is missing or malformed.
    pub fn from_value(root: &Value) -> Self {
        let globals = root
            .get("globals")
            .and_then(|g| Globals::deserialize(g).ok())
            .unwrap_or_default();
        let show = root
            .get("show")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(ShowEntry::from_value).collect())
            .unwrap_or_default();
        Self {
            scenes: entries(root, "scenes"),
            chases: entries(root, "chases"),
            cues: entries(root, "cues"),
            groups: channel_lists(root, "groups"),
            fixtures: entries(root, "fixtures"),
            map: channel_lists(root, "map"),
            rem: entries::<RemoteTargets>(root, "rem")
                .into_iter()
                .filter(|(_, t)| !t.is_empty())
                .collect(),
            globals,
            show,
        }
    }

    /// Reads a document from disk. A missing file is an empty document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no show document, starting empty");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let root: Value = serde_json::from_str(&text)?;
        Ok(Self::from_value(&root))
    }

    /// Writes the document, replacing the file only once the new content is on disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "show document saved");
        Ok(())
    }

    /// Stores the non-zero channels of `frame` as scene `name`.
    pub fn save_scene(&mut self, name: &str, frame: &DmxFrame) {
        self.scenes.insert(name.to_string(), Scene::from_frame(frame));
    }

    pub fn delete_scene(&mut self, name: &str) -> bool {
        self.scenes.remove(name).is_some()
    }

    pub fn create_chase(&mut self, name: &str, steps: Vec<String>, hold_ms: u64, fade_ms: u64) {
        self.chases.insert(
            name.to_string(),
            Chase {
                steps,
                hold_ms,
                fade_ms,
            },
        );
    }

    pub fn delete_chase(&mut self, name: &str) -> bool {
        self.chases.remove(name).is_some()
    }

    pub fn store_cue(&mut self, name: &str, frames: Vec<DmxFrame>) {
        self.cues.insert(name.to_string(), Cue { frames });
    }

    pub fn delete_cue(&mut self, name: &str) -> bool {
        self.cues.remove(name).is_some()
    }

    /// Stores a sorted, de-duplicated group of valid channels.
    pub fn create_group(&mut self, name: &str, channels: impl IntoIterator<Item = u16>) {
        let set: BTreeSet<u16> = channels
            .into_iter()
            .filter(|ch| valid_channel(*ch as i64).is_some())
            .collect();
        self.groups.insert(name.to_string(), set.into_iter().collect());
    }

    pub fn delete_group(&mut self, name: &str) -> bool {
        self.groups.remove(name).is_some()
    }

    pub fn create_fixture(&mut self, name: &str, fixture: Fixture) {
        self.fixtures.insert(name.to_string(), fixture);
    }

    pub fn delete_fixture(&mut self, name: &str) -> bool {
        self.fixtures.remove(name).is_some()
    }

    /// Channels of the named group, empty when the group does not exist.
    pub fn group_channels(&self, name: &str) -> &[u16] {
        self.groups.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether any fixture covering `channel` performs `role` there. Overlapping patches match
    /// if one of them does. Legacy integer fixtures were upgraded to RGB pars on load and take
    /// part like any other.
    pub fn channel_has_role(&self, channel: u16, role: Role) -> bool {
        self.fixtures
            .values()
            .any(|f| f.role_at(channel) == Some(role))
    }

    /// Overwrites the direct mapping of `signal`.
    pub fn map_channels(&mut self, signal: &str, channels: impl IntoIterator<Item = u16>) {
        let set: BTreeSet<u16> = channels.into_iter().collect();
        if set.is_empty() {
            self.map.remove(signal);
        } else {
            self.map.insert(signal.to_string(), set.into_iter().collect());
        }
    }

    /// Removes one channel from a direct mapping, dropping the mapping once empty.
    pub fn unmap_channel(&mut self, signal: &str, channel: u16) -> bool {
        let Some(channels) = self.map.get_mut(signal) else {
            return false;
        };
        let before = channels.len();
        channels.retain(|c| *c != channel);
        let removed = before != channels.len();
        if channels.is_empty() {
            self.map.remove(signal);
        }
        removed
    }

    pub fn clear_direct_mappings(&mut self) {
        self.map.clear();
    }

    /// Adds `target` to the remote mapping of `signal` without replacing existing ones.
    pub fn bind_remote(&mut self, signal: &str, target: Target) -> bool {
        self.rem.entry(signal.to_string()).or_default().insert(target)
    }

    /// Removes one remote target, dropping the signal once it has none left.
    pub fn unbind_remote(&mut self, signal: &str, target: &Target) -> bool {
        let Some(targets) = self.rem.get_mut(signal) else {
            return false;
        };
        let removed = targets.remove(target);
        if targets.is_empty() {
            self.rem.remove(signal);
        }
        removed
    }

    /// Appends a running-order step. Cue steps always last as long as their recording.
    pub fn add_show_entry(&mut self, kind: TargetKind, name: &str, duration_ms: u64) -> Result<()> {
        if !kind.is_toggle() {
            return Err(Error::UnknownItem {
                kind: "show step kind",
                name: kind.to_string(),
            });
        }
        let duration_ms = match kind {
            TargetKind::Cue => {
                let frames = self.cues.get(name).map(|c| c.frames.len()).unwrap_or(0);
                frames as u64 * CUE_FRAME_MS
            }
            _ => duration_ms,
        };
        self.show.push(ShowEntry {
            kind,
            name: name.to_string(),
            duration_ms,
        });
        Ok(())
    }

    pub fn remove_show_entry(&mut self, index: usize) -> Option<ShowEntry> {
        (index < self.show.len()).then(|| self.show.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_keys_default_to_empty() {
        let doc = ShowDocument::from_value(&json!({}));
        assert!(doc.scenes.is_empty());
        assert!(doc.show.is_empty());
        assert_eq!(doc.globals, Globals::default());

        let doc = ShowDocument::from_value(&json!([1, 2, 3]));
        assert_eq!(doc, ShowDocument::default());
    }

    #[test]
    fn legacy_shapes_are_upgraded() {
        let doc = ShowDocument::from_value(&json!({
            "fixtures": { "par": 10, "spot": { "addr": 20, "profile": ["Dimmer", "Laser"] } },
            "cues": { "intro": { "data": [[0, 5, 6]] } },
            "show": ["sc:Intro", { "type": "cue", "name": "intro", "duration": 80 }, "bogus"],
            "map": { "cc_7": 1, "cc_8": [3, 2, 2, 900] },
            "rem": { "note_1": "scene:Intro", "note_2": ["sc:A", "ch:B", "nope"] },
            "chases": { "x": { "steps": ["a"], "hold": 100, "f": 80.0 } }
        }));

        assert_eq!(doc.fixtures["par"], Fixture::rgb(10));
        assert_eq!(doc.fixtures["spot"].profile, vec![Role::Dimmer, Role::Other]);
        assert_eq!(doc.cues["intro"].frames[0].get(2), 6);
        assert_eq!(doc.show.len(), 2);
        assert_eq!(doc.show[0].kind, TargetKind::Scene);
        assert_eq!(doc.show[0].duration_ms, 0);
        assert_eq!(doc.show[1].duration_ms, 80);
        assert_eq!(doc.map["cc_7"], vec![1]);
        assert_eq!(doc.map["cc_8"], vec![2, 3]);
        assert_eq!(doc.rem["note_1"].0, vec![Target::new(TargetKind::Scene, "Intro")]);
        assert_eq!(doc.rem["note_2"].len(), 2);
        assert_eq!(doc.chases["x"].hold_ms, 100);
        assert_eq!(doc.chases["x"].fade_ms, 80);
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let doc = ShowDocument::from_value(&json!({
            "scenes": { "good": { "1": 255, "600": 3, "x": 1 }, "bad": 7 },
            "globals": "fast"
        }));
        assert_eq!(doc.scenes.len(), 1);
        assert_eq!(doc.scenes["good"].levels.len(), 1);
        assert_eq!(doc.globals.chase_speed, NEUTRAL_MASTER);
    }

    #[test]
    fn persisted_shape_round_trips() {
        let mut doc = ShowDocument::default();
        let mut frame = DmxFrame::new();
        frame.set(1, 255);
        frame.set(3, 10);
        doc.save_scene("A", &frame);
        doc.bind_remote("cc_1", "sc:A".parse().unwrap());
        doc.bind_remote("cc_2", "sc:A".parse().unwrap());
        doc.bind_remote("cc_2", "group:front".parse().unwrap());
        doc.add_show_entry(TargetKind::Scene, "A", 1500).unwrap();

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["scenes"]["A"], json!({ "1": 255, "3": 10 }));
        assert_eq!(value["rem"]["cc_1"], json!("sc:A"));
        assert_eq!(value["rem"]["cc_2"], json!(["sc:A", "grp:front"]));
        assert_eq!(value["show"][0], json!({ "type": "sc", "name": "A", "duration": 1500 }));
        assert_eq!(value["globals"]["chase_speed"], json!(127));

        assert_eq!(ShowDocument::from_value(&value), doc);
    }

    #[test]
    fn remote_bind_is_idempotent_and_unbind_drops_empty_signals() {
        let mut doc = ShowDocument::default();
        let intro: Target = "sc:Intro".parse().unwrap();
        assert!(doc.bind_remote("note_60", intro.clone()));
        assert!(!doc.bind_remote("note_60", intro.clone()));
        assert_eq!(doc.rem["note_60"].len(), 1);
        assert!(doc.unbind_remote("note_60", &intro));
        assert!(!doc.rem.contains_key("note_60"));
    }

    #[test]
    fn unmapping_last_channel_drops_the_mapping() {
        let mut doc = ShowDocument::default();
        doc.map_channels("cc_1", [4, 2]);
        assert_eq!(doc.map["cc_1"], vec![2, 4]);
        assert!(doc.unmap_channel("cc_1", 2));
        assert!(doc.unmap_channel("cc_1", 4));
        assert!(doc.map.is_empty());
    }

    #[test]
    fn cue_show_entries_last_as_long_as_their_frames() {
        let mut doc = ShowDocument::default();
        doc.store_cue("c", vec![DmxFrame::new(); 25]);
        doc.add_show_entry(TargetKind::Cue, "c", 5).unwrap();
        assert_eq!(doc.show[0].duration_ms, 1000);
        assert!(doc.add_show_entry(TargetKind::Group, "g", 0).is_err());
    }

    #[test]
    fn fixture_footprint_and_roles() {
        let fixture = Fixture::new(510, vec![Role::Dimmer, Role::Red, Role::Green, Role::Blue]);
        assert_eq!(fixture.footprint().collect::<Vec<_>>(), vec![510, 511, 512]);
        assert_eq!(fixture.role_at(511), Some(Role::Red));
        assert_eq!(fixture.role_at(509), None);
        assert_eq!("uv".parse::<Role>().unwrap(), Role::UV);
    }

    #[test]
    fn target_descriptors_accept_long_and_short_kinds() {
        let t: Target = "chase:Warm Up".parse().unwrap();
        assert_eq!(t.to_string(), "ch:Warm Up");
        let g: Target = "global:chase_speed".parse().unwrap();
        assert_eq!(g.kind, TargetKind::Global);
        assert!("colour:red".parse::<Target>().is_err());
        assert!("sc".parse::<Target>().is_err());
    }
}
