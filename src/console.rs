use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use scan_fmt::scan_fmt;
use thiserror::Error;
use tracing::info;

use crate::effects::{Algorithm, EffectId, EffectParams};
use crate::engine::Engine;
use crate::fx_chase::{FxChaseSpec, Pattern};
use crate::midi::LearnTarget;
use crate::reaction::{ReactionLink, ReactionSource};
use crate::show::{GlobalParam, Role, TargetKind};
use crate::universe::DMX_CHANNELS;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Invalid channel: {0}. Must be between 1 and {1}")]
    InvalidChannel(String, usize),
    #[error("Invalid level: {0}. Must be between 0 and 255")]
    InvalidLevel(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Missing arguments for command: {0}")]
    MissingArgs(String),
    #[error(transparent)]
    Engine(#[from] crate::error::Error),
}

/// Comma separated list in command echoes.
#[derive(Clone, Debug, PartialEq)]
pub struct List<T>(pub Vec<T>);

impl<T: fmt::Display> fmt::Display for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, strum::Display)]
pub enum ConsoleCommand {
    #[strum(serialize = "Chan {ch} at {value}")]
    SetChannel { ch: usize, value: i64 },
    #[strum(serialize = "Blackout")]
    StopAll,
    #[strum(serialize = "Scene {name}")]
    ToggleScene { name: String },
    #[strum(serialize = "Chase {name}")]
    ToggleChase { name: String },
    #[strum(serialize = "Cue {name}")]
    ToggleCue { name: String },
    #[strum(serialize = "Record")]
    StartRecording,
    #[strum(serialize = "Record Stop {name}")]
    StopRecording { name: String },
    #[strum(serialize = "Save Scene {name}")]
    SaveScene { name: String },
    #[strum(serialize = "Save")]
    SaveShow,
    #[strum(serialize = "{param} {value}")]
    SetGlobal { param: GlobalParam, value: u8 },
    #[strum(serialize = "Select {channels}")]
    Select { channels: List<u16> },
    #[strum(serialize = "Select Group {name}")]
    SelectGroup { name: String },
    #[strum(serialize = "Select Fix {fixtures}")]
    SelectFixtures { fixtures: List<String> },
    #[strum(serialize = "Level {value}")]
    SelectionLevel { value: i64 },
    #[strum(serialize = "Group {name}")]
    CreateGroup { name: String },
    #[strum(serialize = "Color {fixtures} R{r} G{g} B{b}")]
    Color {
        fixtures: List<String>,
        r: u8,
        g: u8,
        b: u8,
    },
    #[strum(serialize = "Learn {target}")]
    Learn { target: LearnTarget },
    #[strum(serialize = "Learn Cancel")]
    CancelLearn,
    #[strum(serialize = "Fx {algorithm} On {fixtures}")]
    AddEffect {
        algorithm: Algorithm,
        fixtures: List<String>,
    },
    #[strum(serialize = "Fx {id} Remove")]
    RemoveEffect { id: EffectId },
    #[strum(serialize = "Fx {id} Threshold {value}")]
    EffectThreshold { id: EffectId, value: f32 },
    #[strum(serialize = "Fx {id} Intensity {value}")]
    EffectIntensity { id: EffectId, value: f32 },
    #[strum(serialize = "Fx {id} Active {active}")]
    EffectActive { id: EffectId, active: bool },
    #[strum(serialize = "FxChase {name} {pattern} {steps} {hold_ms} {spread} On {fixtures}")]
    FxChase {
        name: String,
        pattern: Pattern,
        steps: usize,
        hold_ms: u64,
        spread: f32,
        fixtures: List<String>,
    },
    #[strum(serialize = "React {source} {group} {attribute} {min} {max}")]
    AddReaction {
        source: ReactionSource,
        group: String,
        attribute: Role,
        min: u8,
        max: u8,
    },
    #[strum(serialize = "React Remove {index}")]
    RemoveReaction { index: usize },
    #[strum(serialize = "Serial {port}")]
    ConnectSerial { port: String },
    #[strum(serialize = "ArtNet {host} Universe {universe}")]
    ConnectNetwork { host: String, universe: u16 },
    #[strum(serialize = "Disconnect")]
    Disconnect,
    #[strum(serialize = "Midi {port}")]
    OpenController { port: String },
    #[strum(serialize = "Midi Close")]
    CloseController,
    #[strum(serialize = "Audio On")]
    StartAudio,
    #[strum(serialize = "Audio Off")]
    StopAudio,
    #[strum(serialize = "Show Next")]
    ShowNext,
    #[strum(serialize = "Show Play {index}")]
    ShowPlay { index: usize },
    #[strum(serialize = "Show Add {kind}:{name} {duration_ms}")]
    ShowAdd {
        kind: TargetKind,
        name: String,
        duration_ms: u64,
    },
    #[strum(serialize = "Status")]
    Status,
    #[strum(serialize = "Ports")]
    Ports,
}

/// Text after `keyword` when `input` starts with it as a whole word, ignoring case.
fn after<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    let head = input.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let tail = &input[keyword.len()..];
    if !tail.is_empty() && !tail.starts_with(char::is_whitespace) {
        return None;
    }
    Some(tail.trim())
}

fn required<'a>(value: &'a str, command: &str) -> Result<&'a str, ConsoleError> {
    if value.is_empty() {
        Err(ConsoleError::MissingArgs(command.to_string()))
    } else {
        Ok(value)
    }
}

fn name_list(value: &str, command: &str) -> Result<List<String>, ConsoleError> {
    let names: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Err(ConsoleError::MissingArgs(command.to_string()));
    }
    Ok(List(names))
}

fn channel(token: &str) -> Result<u16, ConsoleError> {
    token
        .parse::<u16>()
        .ok()
        .filter(|ch| (1..=DMX_CHANNELS as u16).contains(ch))
        .ok_or_else(|| ConsoleError::InvalidChannel(token.to_string(), DMX_CHANNELS))
}

/// Channels as `1 2 5-8` or `1,2,5-8`.
fn channel_list(value: &str) -> Result<List<u16>, ConsoleError> {
    let mut channels = Vec::new();
    for token in value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        match token.split_once('-') {
            Some((from, to)) => {
                let (from, to) = (channel(from)?, channel(to)?);
                channels.extend(from.min(to)..=from.max(to));
            }
            None => channels.push(channel(token)?),
        }
    }
    if channels.is_empty() {
        return Err(ConsoleError::MissingArgs("select".into()));
    }
    Ok(List(channels))
}

fn parsed<T: FromStr>(token: &str) -> Result<T, ConsoleError> {
    token
        .parse()
        .map_err(|_| ConsoleError::InvalidValue(token.to_string()))
}

fn level(token: &str) -> Result<u8, ConsoleError> {
    token
        .parse()
        .map_err(|_| ConsoleError::InvalidLevel(token.to_string()))
}

fn effect_command(id: EffectId, rest: &str) -> Result<ConsoleCommand, ConsoleError> {
    let s = rest.to_lowercase();
    if s == "remove" || s == "rm" {
        return Ok(ConsoleCommand::RemoveEffect { id });
    }
    if s == "on" || s == "off" {
        return Ok(ConsoleCommand::EffectActive {
            id,
            active: s == "on",
        });
    }
    if let Ok(value) = scan_fmt!(&s, "threshold {}", f32) {
        return Ok(ConsoleCommand::EffectThreshold { id, value });
    }
    if let Ok(value) = scan_fmt!(&s, "intensity {}", f32) {
        return Ok(ConsoleCommand::EffectIntensity { id, value });
    }
    Err(ConsoleError::UnknownCommand(format!("fx {} {rest}", id.0)))
}

impl TryFrom<String> for ConsoleCommand {
    type Error = ConsoleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let input = value.trim();
        let s = input.to_lowercase();
        if s == "b/o" || s == "blackout" || s == "bo" || s == "stop all" {
            return Ok(ConsoleCommand::StopAll);
        }
        match s.as_str() {
            "record" | "rec" => return Ok(ConsoleCommand::StartRecording),
            "save" => return Ok(ConsoleCommand::SaveShow),
            "learn cancel" => return Ok(ConsoleCommand::CancelLearn),
            "disconnect" => return Ok(ConsoleCommand::Disconnect),
            "midi close" => return Ok(ConsoleCommand::CloseController),
            "audio on" => return Ok(ConsoleCommand::StartAudio),
            "audio off" => return Ok(ConsoleCommand::StopAudio),
            "show next" | "go" => return Ok(ConsoleCommand::ShowNext),
            "status" => return Ok(ConsoleCommand::Status),
            "ports" => return Ok(ConsoleCommand::Ports),
            _ => {}
        }
        if let Ok((ch, value)) = scan_fmt!(&s, "chan {} at {}", String, i64) {
            let ch = channel(&ch)? as usize;
            return Ok(ConsoleCommand::SetChannel { ch, value });
        }
        if let Ok(value) = scan_fmt!(&s, "speed {}", String) {
            return Ok(ConsoleCommand::SetGlobal {
                param: GlobalParam::ChaseSpeed,
                value: level(&value)?,
            });
        }
        if let Ok(value) = scan_fmt!(&s, "fade {}", String) {
            return Ok(ConsoleCommand::SetGlobal {
                param: GlobalParam::ChaseFade,
                value: level(&value)?,
            });
        }
        if let Ok(value) = scan_fmt!(&s, "level {}", i64) {
            return Ok(ConsoleCommand::SelectionLevel { value });
        }
        if let Ok(index) = scan_fmt!(&s, "show play {}", usize) {
            return Ok(ConsoleCommand::ShowPlay { index });
        }
        if let Ok(index) = scan_fmt!(&s, "react remove {}", usize) {
            return Ok(ConsoleCommand::RemoveReaction { index });
        }

        if let Some(name) = after(input, "record stop") {
            let name = required(name, "record stop")?.to_string();
            return Ok(ConsoleCommand::StopRecording { name });
        }
        if let Some(name) = after(input, "save scene") {
            let name = required(name, "save scene")?.to_string();
            return Ok(ConsoleCommand::SaveScene { name });
        }
        if let Some(name) = after(input, "scene") {
            let name = required(name, "scene")?.to_string();
            return Ok(ConsoleCommand::ToggleScene { name });
        }
        if let Some(name) = after(input, "chase") {
            let name = required(name, "chase")?.to_string();
            return Ok(ConsoleCommand::ToggleChase { name });
        }
        if let Some(name) = after(input, "cue") {
            let name = required(name, "cue")?.to_string();
            return Ok(ConsoleCommand::ToggleCue { name });
        }
        if let Some(name) = after(input, "select group") {
            let name = required(name, "select group")?.to_string();
            return Ok(ConsoleCommand::SelectGroup { name });
        }
        if let Some(names) = after(input, "select fix") {
            let fixtures = name_list(names, "select fix")?;
            return Ok(ConsoleCommand::SelectFixtures { fixtures });
        }
        if let Some(channels) = after(input, "select") {
            let channels = channel_list(channels)?;
            return Ok(ConsoleCommand::Select { channels });
        }
        if let Some(name) = after(input, "group") {
            let name = required(name, "group")?.to_string();
            return Ok(ConsoleCommand::CreateGroup { name });
        }
        if let Some(rest) = after(input, "color") {
            let parts: Vec<&str> = rest.rsplitn(4, char::is_whitespace).collect();
            let [b, g, r, fixtures] = parts.as_slice() else {
                return Err(ConsoleError::MissingArgs("color".into()));
            };
            return Ok(ConsoleCommand::Color {
                fixtures: name_list(fixtures, "color")?,
                r: level(r)?,
                g: level(g)?,
                b: level(b)?,
            });
        }
        if let Some(target) = after(input, "learn") {
            let target = required(target, "learn")?.parse()?;
            return Ok(ConsoleCommand::Learn { target });
        }
        if let Some(rest) = after(input, "fxchase") {
            let (head, fixtures) = rest
                .rsplit_once(" on ")
                .ok_or_else(|| ConsoleError::MissingArgs("fxchase".into()))?;
            let words: Vec<&str> = head.split_whitespace().collect();
            let [name, pattern, steps, hold, spread] = words.as_slice() else {
                return Err(ConsoleError::MissingArgs("fxchase".into()));
            };
            return Ok(ConsoleCommand::FxChase {
                name: name.to_string(),
                pattern: parsed(pattern)?,
                steps: parsed(steps)?,
                hold_ms: parsed(hold)?,
                spread: parsed(spread)?,
                fixtures: name_list(fixtures, "fxchase")?,
            });
        }
        if let Some(rest) = after(input, "fx") {
            let (first, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if let Ok(id) = first.parse::<u32>() {
                return effect_command(EffectId(id), tail.trim());
            }
            let (algorithm, fixtures) = rest
                .rsplit_once(" on ")
                .ok_or_else(|| ConsoleError::MissingArgs("fx".into()))?;
            return Ok(ConsoleCommand::AddEffect {
                algorithm: parsed(algorithm.trim())?,
                fixtures: name_list(fixtures, "fx")?,
            });
        }
        if let Some(rest) = after(input, "react") {
            let words: Vec<&str> = rest.split_whitespace().collect();
            let (source, group, attribute, min, max) = match words.as_slice() {
                [source, group, attribute] => (source, group, attribute, "0", "255"),
                [source, group, attribute, min, max] => (source, group, attribute, *min, *max),
                _ => return Err(ConsoleError::MissingArgs("react".into())),
            };
            return Ok(ConsoleCommand::AddReaction {
                source: parsed(source)?,
                group: group.to_string(),
                attribute: parsed(attribute)?,
                min: level(min)?,
                max: level(max)?,
            });
        }
        if let Some(port) = after(input, "serial") {
            let port = required(port, "serial")?.to_string();
            return Ok(ConsoleCommand::ConnectSerial { port });
        }
        if let Some(rest) = after(input, "artnet") {
            let words: Vec<&str> = rest.split_whitespace().collect();
            let (host, universe) = match words.as_slice() {
                [host] => (host.to_string(), 0),
                [host, universe] => (host.to_string(), parsed(universe)?),
                _ => return Err(ConsoleError::MissingArgs("artnet".into())),
            };
            return Ok(ConsoleCommand::ConnectNetwork { host, universe });
        }
        if let Some(port) = after(input, "midi") {
            let port = required(port, "midi")?.to_string();
            return Ok(ConsoleCommand::OpenController { port });
        }
        if let Some(rest) = after(input, "show add") {
            let words: Vec<&str> = rest.split_whitespace().collect();
            let (kind, name, duration_ms) = match words.as_slice() {
                [kind, name] => (kind, name, 0),
                [kind, name, duration] => (kind, name, parsed(duration)?),
                _ => return Err(ConsoleError::MissingArgs("show add".into())),
            };
            return Ok(ConsoleCommand::ShowAdd {
                kind: parsed(kind)?,
                name: name.to_string(),
                duration_ms,
            });
        }
        Err(ConsoleError::UnknownCommand(value))
    }
}

impl ConsoleCommand {
    pub fn parse(input: &str) -> Result<ConsoleCommand, ConsoleError> {
        ConsoleCommand::try_from(input.to_string())
    }
}

/// Text front end: parses lines, runs them on the engine and keeps a history.
pub struct Console {
    show_path: PathBuf,
    history: Vec<ConsoleCommand>,
}

impl Console {
    pub fn new(show_path: impl Into<PathBuf>) -> Self {
        Self {
            show_path: show_path.into(),
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ConsoleCommand] {
        &self.history
    }

    /// Parses and executes one line. Returns a short confirmation.
    pub fn run(&mut self, engine: &Engine, line: &str) -> Result<String, ConsoleError> {
        let command = ConsoleCommand::parse(line)?;
        let reply = self.execute(engine, &command)?;
        self.history.push(command);
        Ok(reply)
    }

    fn execute(&self, engine: &Engine, command: &ConsoleCommand) -> Result<String, ConsoleError> {
        let on_off = |active: bool| if active { "on" } else { "off" };
        let reply = match command {
            ConsoleCommand::SetChannel { ch, value } => {
                engine.set_channel(*ch, *value)?;
                command.to_string()
            }
            ConsoleCommand::StopAll => {
                engine.stop_all();
                "All playback stopped".into()
            }
            ConsoleCommand::ToggleScene { name } => {
                format!("Scene {name} {}", on_off(engine.toggle_scene(name)?))
            }
            ConsoleCommand::ToggleChase { name } => {
                format!("Chase {name} {}", on_off(engine.toggle_chase(name)?))
            }
            ConsoleCommand::ToggleCue { name } => {
                format!("Cue {name} {}", on_off(engine.toggle_cue(name)?))
            }
            ConsoleCommand::StartRecording => {
                engine.start_recording();
                "Recording".into()
            }
            ConsoleCommand::StopRecording { name } => {
                let frames = engine.stop_recording(name)?;
                format!("Cue {name} stored with {frames} frames")
            }
            ConsoleCommand::SaveScene { name } => {
                engine.save_scene(name);
                format!("Scene {name} saved")
            }
            ConsoleCommand::SaveShow => {
                engine.save(&self.show_path)?;
                info!(path = %self.show_path.display(), "show saved from console");
                format!("Saved to {}", self.show_path.display())
            }
            ConsoleCommand::SetGlobal { param, value } => {
                engine.set_global(*param, *value);
                command.to_string()
            }
            ConsoleCommand::Select { channels } => {
                engine.select_channels(channels.0.iter().copied());
                format!("{} channels selected", engine.selection().len())
            }
            ConsoleCommand::SelectGroup { name } => {
                engine.select_group(name)?;
                format!("{} channels selected", engine.selection().len())
            }
            ConsoleCommand::SelectFixtures { fixtures } => {
                engine.select_fixtures(fixtures.0.iter().map(String::as_str));
                format!("{} channels selected", engine.selection().len())
            }
            ConsoleCommand::SelectionLevel { value } => {
                engine.set_selection_level(*value);
                command.to_string()
            }
            ConsoleCommand::CreateGroup { name } => {
                engine.create_group(name)?;
                format!("Group {name} created")
            }
            ConsoleCommand::Color { fixtures, r, g, b } => {
                engine.set_fixture_color(fixtures.0.iter().map(String::as_str), (*r, *g, *b));
                command.to_string()
            }
            ConsoleCommand::Learn { target } => {
                engine.enter_learn(target.clone());
                format!("Move a control to bind {target}")
            }
            ConsoleCommand::CancelLearn => {
                engine.cancel_learn();
                "Learn cancelled".into()
            }
            ConsoleCommand::AddEffect {
                algorithm,
                fixtures,
            } => {
                let id = engine.add_effect(*algorithm, fixtures.0.clone())?;
                format!("Effect {id} {algorithm} running")
            }
            ConsoleCommand::RemoveEffect { id } => {
                if !engine.remove_effect(*id) {
                    return Err(crate::error::Error::UnknownItem {
                        kind: "effect",
                        name: id.to_string(),
                    }
                    .into());
                }
                format!("Effect {id} removed")
            }
            ConsoleCommand::EffectThreshold { id, value } => {
                engine.configure_effect(
                    *id,
                    EffectParams {
                        threshold: Some(*value),
                        ..EffectParams::default()
                    },
                )?;
                command.to_string()
            }
            ConsoleCommand::EffectIntensity { id, value } => {
                engine.configure_effect(
                    *id,
                    EffectParams {
                        intensity: Some(*value),
                        ..EffectParams::default()
                    },
                )?;
                command.to_string()
            }
            ConsoleCommand::EffectActive { id, active } => {
                engine.configure_effect(
                    *id,
                    EffectParams {
                        active: Some(*active),
                        ..EffectParams::default()
                    },
                )?;
                format!("Effect {id} {}", on_off(*active))
            }
            ConsoleCommand::FxChase {
                name,
                pattern,
                steps,
                hold_ms,
                spread,
                fixtures,
            } => {
                let spec = FxChaseSpec {
                    pattern: *pattern,
                    steps: *steps,
                    hold_ms: *hold_ms,
                    spread: *spread,
                };
                let scenes =
                    engine.generate_fx_chase(name, fixtures.0.iter().map(String::as_str), &spec)?;
                format!("Chase {name} created with {} steps", scenes.len())
            }
            ConsoleCommand::AddReaction {
                source,
                group,
                attribute,
                min,
                max,
            } => {
                let link = ReactionLink::new(*source, group.clone(), *attribute).with_range(*min, *max);
                let index = engine.add_reaction(link);
                format!("Reaction {index} added")
            }
            ConsoleCommand::RemoveReaction { index } => {
                let link = engine.remove_reaction(*index)?;
                format!("Reaction {link} removed")
            }
            ConsoleCommand::ConnectSerial { port } => {
                engine.connect_serial(port)?;
                format!("DMX on {port}")
            }
            ConsoleCommand::ConnectNetwork { host, universe } => {
                engine.connect_network(host, *universe)?;
                format!("Art-Net to {host} universe {universe}")
            }
            ConsoleCommand::Disconnect => {
                engine.disconnect();
                "Disconnected".into()
            }
            ConsoleCommand::OpenController { port } => {
                let opened = engine.open_controller(port)?;
                format!("Controller {opened} open")
            }
            ConsoleCommand::CloseController => {
                engine.close_controller();
                "Controller closed".into()
            }
            ConsoleCommand::StartAudio => {
                let rate = engine.start_audio()?;
                format!("Audio running at {rate} Hz")
            }
            ConsoleCommand::StopAudio => {
                engine.stop_audio();
                "Audio stopped".into()
            }
            ConsoleCommand::ShowNext => {
                if engine.show_next()? {
                    "Next show step".into()
                } else {
                    "Running order is empty".into()
                }
            }
            ConsoleCommand::ShowPlay { index } => {
                engine.play_show_item(*index)?;
                command.to_string()
            }
            ConsoleCommand::ShowAdd {
                kind,
                name,
                duration_ms,
            } => {
                engine.add_show_entry(*kind, name, *duration_ms)?;
                command.to_string()
            }
            ConsoleCommand::Status => {
                let transmit = engine.transmit_status();
                let playback = engine.playback_state();
                format!(
                    "{} (connected: {}, frames: {}, failures: {}) | scene: {} | chase: {} | cue: {} | recording: {} | learn: {:?}",
                    transmit.state,
                    transmit.connected,
                    transmit.frames_sent,
                    transmit.failures,
                    playback.scene.as_deref().unwrap_or("-"),
                    playback.chase.as_deref().unwrap_or("-"),
                    playback.cue.as_deref().unwrap_or("-"),
                    playback.recording,
                    engine.learn_state(),
                )
            }
            ConsoleCommand::Ports => {
                let serial = engine.list_serial_ports()?;
                let midi = engine.list_controller_ports()?;
                format!("serial: [{}] | midi: [{}]", serial.join(", "), midi.join(", "))
            }
        };
        Ok(reply)
    }
}
