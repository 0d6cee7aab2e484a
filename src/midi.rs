//! Controller Mapping Manager
//!
//! Inbound controller messages are classified into [`MidiEvent`]s identified by a signal id
//! (`cc_<n>` or `note_<n>`). While learning, the next event binds the signal; otherwise the
//! signal's direct and remote mappings are executed.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use crossbeam_channel::Sender;
use midir::{Ignore, MidiInput, MidiInputConnection};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::playback::Playback;
use crate::show::{Role, ShowDocument, Target, TargetKind};
use crate::universe::{Layer, Universe};

const CLIENT_NAME: &str = "midi-dmx";
/// Raw controller value a continuous control must rise above to fire a toggle.
pub const EDGE_THRESHOLD: u8 = 64;

/// A classified controller message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MidiEvent {
    ControlChange { controller: u8, value: u8 },
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
}

impl MidiEvent {
    /// Decodes a raw channel-voice message. Other message kinds yield `None`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (&status, data) = bytes.split_first()?;
        let first = *data.first()? & 0x7f;
        let second = data.get(1).map(|v| v & 0x7f);
        match status & 0xf0 {
            0xb0 => Some(Self::ControlChange {
                controller: first,
                value: second?,
            }),
            0x90 => match second? {
                0 => Some(Self::NoteOff { note: first }),
                velocity => Some(Self::NoteOn {
                    note: first,
                    velocity,
                }),
            },
            0x80 => Some(Self::NoteOff { note: first }),
            _ => None,
        }
    }

    pub fn signal(&self) -> String {
        match self {
            Self::ControlChange { controller, .. } => format!("cc_{controller}"),
            Self::NoteOn { note, .. } | Self::NoteOff { note } => format!("note_{note}"),
        }
    }

    /// Value for the Live layer: continuous 0-127 scales to 0-255, notes are 255 or 0.
    pub fn level(&self) -> u8 {
        match self {
            Self::ControlChange { value, .. } => {
                ((*value as f64) * 255.0 / 127.0).round().min(255.0) as u8
            }
            Self::NoteOn { .. } => 255,
            Self::NoteOff { .. } => 0,
        }
    }
}

/// What the next event gets bound to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LearnTarget {
    /// The current channel selection, as a direct mapping
    Channels,
    /// A remote target, merged with any already bound
    Remote(Target),
}

impl FromStr for LearnTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "channels" | "chans" => Ok(Self::Channels),
            other => other.parse().map(Self::Remote),
        }
    }
}

impl std::fmt::Display for LearnTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channels => write!(f, "channels"),
            Self::Remote(target) => write!(f, "{target}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LearnState {
    #[default]
    Idle,
    Listening(LearnTarget),
}

/// Result of handling one event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Handled {
    /// Binding made while learning
    pub learned: Option<(String, LearnTarget)>,
    /// A scene, chase or cue was toggled
    pub playback_changed: bool,
    /// Live channels were written
    pub live_written: bool,
}

/// Learn state, channel selection and edge detection for controller input.
#[derive(Debug, Default)]
pub struct MappingManager {
    learn: LearnState,
    selection: BTreeSet<u16>,
    selected_group: Option<String>,
    above_threshold: HashMap<String, bool>,
}

impl MappingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn learn_state(&self) -> &LearnState {
        &self.learn
    }

    pub fn enter_learn(&mut self, target: LearnTarget) {
        info!(%target, "learn: waiting for controller");
        self.learn = LearnState::Listening(target);
    }

    pub fn cancel_learn(&mut self) {
        if self.learn != LearnState::Idle {
            info!("learn cancelled");
        }
        self.learn = LearnState::Idle;
    }

    pub fn selection(&self) -> &BTreeSet<u16> {
        &self.selection
    }

    pub fn selected_group(&self) -> Option<&str> {
        self.selected_group.as_deref()
    }

    pub fn set_selection(&mut self, channels: impl IntoIterator<Item = u16>) {
        self.selection = channels
            .into_iter()
            .filter(|ch| (1..=512).contains(ch))
            .collect();
        self.selected_group = None;
    }

    /// Selects the group's channels, or clears the selection if that group is already selected.
    pub fn select_group(&mut self, doc: &ShowDocument, name: &str) -> Result<()> {
        if self.selected_group.as_deref() == Some(name) {
            self.selection.clear();
            self.selected_group = None;
            return Ok(());
        }
        let channels = doc.groups.get(name).ok_or_else(|| Error::UnknownItem {
            kind: "group",
            name: name.to_string(),
        })?;
        self.selection = channels.iter().copied().collect();
        self.selected_group = Some(name.to_string());
        Ok(())
    }

    /// Selects the union of the named fixtures' footprints. Unknown names are skipped.
    pub fn select_fixtures<'a>(
        &mut self,
        doc: &ShowDocument,
        names: impl IntoIterator<Item = &'a str>,
    ) {
        self.selection = names
            .into_iter()
            .filter_map(|n| doc.fixtures.get(n))
            .flat_map(|f| f.footprint().collect::<Vec<_>>())
            .collect();
        self.selected_group = None;
    }

    /// Writes `level` into Live for every selected channel.
    pub fn set_selection_level(&self, universe: &Universe, level: i64) {
        let channels: Vec<u16> = self.selection.iter().copied().collect();
        universe.write_many(Layer::Live, &channels, level);
    }

    /// Handles one controller event against the document and playback.
    pub fn handle(
        &mut self,
        event: MidiEvent,
        doc: &mut ShowDocument,
        playback: &mut Playback,
        universe: &Universe,
        now_ms: u64,
    ) -> Handled {
        let signal = event.signal();
        let rising = self.rising_edge(&signal, &event);

        if let LearnState::Listening(target) = std::mem::take(&mut self.learn) {
            match &target {
                LearnTarget::Channels => {
                    doc.map_channels(&signal, self.selection.iter().copied());
                }
                LearnTarget::Remote(t) => {
                    doc.bind_remote(&signal, t.clone());
                }
            }
            info!(%signal, %target, "learned");
            return Handled {
                learned: Some((signal, target)),
                ..Handled::default()
            };
        }

        let level = event.level();
        let mut handled = Handled::default();

        if let Some(channels) = doc.map.get(&signal) {
            universe.write_many(Layer::Live, channels, level as i64);
            handled.live_written = true;
        }

        let targets: Vec<Target> = doc
            .rem
            .get(&signal)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        for target in targets {
            match target.kind {
                TargetKind::Group => {
                    let channels = doc.group_channels(&target.name).to_vec();
                    universe.write_many(Layer::Live, &channels, level as i64);
                    handled.live_written = true;
                }
                TargetKind::Fixture => {
                    if let Some(fixture) = doc.fixtures.get(&target.name) {
                        let channels: Vec<u16> = fixture.footprint().collect();
                        universe.write_many(Layer::Live, &channels, level as i64);
                        handled.live_written = true;
                    }
                }
                TargetKind::Global => {
                    if !doc.globals.set_named(&target.name, level) {
                        debug!(name = %target.name, "unknown global parameter");
                    }
                }
                kind if rising => match playback.toggle(doc, kind, &target.name, now_ms) {
                    Ok(_) => handled.playback_changed = true,
                    Err(e) => warn!(%e, "remote toggle failed"),
                },
                _ => {}
            }
        }
        trace!(%signal, level, "controller event");
        handled
    }

    /// Note-on always fires. A continuous control fires when it crosses above mid-scale and
    /// re-arms once it falls back.
    fn rising_edge(&mut self, signal: &str, event: &MidiEvent) -> bool {
        match event {
            MidiEvent::NoteOn { .. } => true,
            MidiEvent::NoteOff { .. } => false,
            MidiEvent::ControlChange { value, .. } => {
                let above = *value > EDGE_THRESHOLD;
                let was_above = self
                    .above_threshold
                    .insert(signal.to_string(), above)
                    .unwrap_or(false);
                above && !was_above
            }
        }
    }
}

/// Writes an RGB colour to the named fixtures: colour roles take the colour, dimmers go to
/// full and white goes to zero.
pub fn set_fixture_color<'a>(
    doc: &ShowDocument,
    universe: &Universe,
    fixtures: impl IntoIterator<Item = &'a str>,
    (r, g, b): (u8, u8, u8),
) {
    let writes: Vec<(u16, u8)> = fixtures
        .into_iter()
        .filter_map(|name| doc.fixtures.get(name))
        .flat_map(|f| f.channels().collect::<Vec<_>>())
        .filter_map(|(ch, role)| {
            let level = match role {
                Role::Red => r,
                Role::Green => g,
                Role::Blue => b,
                Role::Dimmer => 255,
                Role::White => 0,
                _ => return None,
            };
            Some((ch, level))
        })
        .collect();
    universe.update(Layer::Live, |frame| {
        for (ch, level) in &writes {
            frame.set(*ch as usize, *level);
        }
    });
}

/// An open controller input. Dropping it closes the port.
pub struct ControllerInput {
    port_name: String,
    connection: MidiInputConnection<Sender<MidiEvent>>,
}

impl ControllerInput {
    /// Opens the first input port whose name equals or contains `name` and forwards classified
    /// events to `events`. Events are dropped when the queue is full.
    pub fn open(name: &str, events: Sender<MidiEvent>) -> Result<Self> {
        let mut input = MidiInput::new(CLIENT_NAME).map_err(|e| Error::Midi(e.to_string()))?;
        input.ignore(Ignore::All);
        let ports = input.ports();
        let found = ports
            .iter()
            .filter_map(|p| input.port_name(p).ok().map(|n| (p, n)))
            .find(|(_, n)| n == name)
            .or_else(|| {
                ports
                    .iter()
                    .filter_map(|p| input.port_name(p).ok().map(|n| (p, n)))
                    .find(|(_, n)| n.contains(name))
            });
        let Some((port, port_name)) = found else {
            return Err(Error::UnknownItem {
                kind: "MIDI port",
                name: name.to_string(),
            });
        };
        let connection = input
            .connect(
                port,
                "midi-dmx-in",
                |_stamp, bytes, events| {
                    if let Some(event) = MidiEvent::parse(bytes) {
                        if events.try_send(event).is_err() {
                            trace!("controller queue full, event dropped");
                        }
                    }
                },
                events,
            )
            .map_err(|e| Error::Midi(e.to_string()))?;
        info!(port = %port_name, "controller input opened");
        Ok(Self {
            port_name,
            connection,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn close(self) {
        let (_input, _) = self.connection.close();
        debug!(port = %self.port_name, "controller input port released");
        info!(port = %self.port_name, "controller input closed");
    }
}

/// Names of the available controller input ports.
pub fn list_ports() -> Result<Vec<String>> {
    let input = MidiInput::new(CLIENT_NAME).map_err(|e| Error::Midi(e.to_string()))?;
    Ok(input
        .ports()
        .iter()
        .filter_map(|p| input.port_name(p).ok())
        .collect())
}
