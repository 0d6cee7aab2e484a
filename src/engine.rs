//! Engine context
//!
//! [`Engine`] owns every component and its lifecycle. Besides the transmit thread it runs two
//! workers:
//!
//! - the scheduler, which drains controller events and drives the playback tick
//! - the procedural worker, which analyses audio blocks and renders effects and reactions
//!
//! Producers (the controller callback, the audio callback) only push into bounded queues.
//! Shared state is locked in a fixed order: show, playback, mapping, effects, reactions.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select, tick};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioCapture, AudioReactor, AudioSnapshot};
use crate::config::EngineConfig;
use crate::effects::{Algorithm, EffectEngine, EffectId, EffectParams, GenerativeEffect};
use crate::error::{Error, Result};
use crate::fx_chase::{FxChaseSpec, create_fx_chase};
use crate::midi::{self, ControllerInput, LearnState, LearnTarget, MappingManager, MidiEvent};
use crate::output::{TransmitEngine, TransmitStatus, TransportState};
use crate::playback::{Playback, PlaybackState};
use crate::reaction::{ReactionEngine, ReactionLink};
use crate::serial;
use crate::show::{Fixture, GlobalParam, ShowDocument, ShowEntry, Target, TargetKind};
use crate::universe::{Layer, Universe};

/// Advisory state change. Delivery is best effort.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    PlaybackChanged(PlaybackState),
    LearnChanged(LearnState),
    MappingsChanged,
    TransportChanged(TransportState),
}

/// State reachable from the workers.
struct Shared {
    clock: Instant,
    universe: Arc<Universe>,
    show: RwLock<ShowDocument>,
    playback: Mutex<Playback>,
    mapping: Mutex<MappingManager>,
    effects: Mutex<EffectEngine>,
    reactions: Mutex<ReactionEngine>,
    reactor: Mutex<AudioReactor>,
    audio: ArcSwap<AudioSnapshot>,
    notifications: Sender<Notification>,
}

impl Shared {
    fn now_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    fn notify(&self, notification: Notification) {
        match self.notifications.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => trace!(?n, "notification dropped"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn playback_changed(&self, playback: &Playback) {
        self.notify(Notification::PlaybackChanged(playback.state()));
    }

    fn handle_event(&self, event: MidiEvent) {
        let now = self.now_ms();
        let mut doc = self.show.write();
        let mut playback = self.playback.lock();
        let mut mapping = self.mapping.lock();
        let handled = mapping.handle(event, &mut doc, &mut playback, &self.universe, now);
        if handled.learned.is_some() {
            self.notify(Notification::LearnChanged(LearnState::Idle));
            self.notify(Notification::MappingsChanged);
        }
        if handled.playback_changed {
            self.playback_changed(&playback);
        }
    }

    fn playback_tick(&self) {
        let now = self.now_ms();
        let doc = self.show.read();
        let mut playback = self.playback.lock();
        if playback.tick(&doc, now) {
            self.playback_changed(&playback);
        }
    }

    fn process_block(&self, block: &[f32]) {
        let snapshot = match self.reactor.lock().process(block) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(%e, "audio block skipped");
                return;
            }
        };
        self.audio.store(Arc::new(snapshot));
        self.render_procedural(&snapshot);
    }

    /// Renders effects and reactions against `audio` into Live.
    fn render_procedural(&self, audio: &AudioSnapshot) {
        let doc = self.show.read();
        self.effects.lock().tick(&doc, audio, &self.universe);
        self.reactions.lock().tick(&doc, audio, &self.universe);
    }

    /// Re-renders with the last analysed block so channels of muted or removed effects go dark
    /// while no audio is arriving.
    fn refresh_procedural(&self) {
        let audio = **self.audio.load();
        self.render_procedural(&audio);
    }

    /// Replaces the reactor with one analysing at `sample_rate`, keeping the user gain.
    fn rebuild_reactor(&self, sample_rate: u32) {
        let mut reactor = self.reactor.lock();
        let gain = reactor.gain();
        *reactor = AudioReactor::new(sample_rate, gain);
    }
}

/// A named thread stopped through a channel.
struct Worker {
    thread_stopper: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(name: &str, task: impl FnOnce(Receiver<()>) + Send + 'static) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || task(stop_rx))?;
        Ok(Self {
            thread_stopper: stop_tx,
            thread_handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        let _ = self.thread_stopper.try_send(());
        if let Some(handle) = self.thread_handle.take() {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!(%name, "worker panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scheduler_loop(shared: Arc<Shared>, period: Duration, events: Receiver<MidiEvent>, stop: Receiver<()>) {
    let ticker = tick(period);
    'schedule: loop {
        select! {
            recv(stop) -> _ => break 'schedule,
            recv(events) -> event => match event {
                Ok(event) => shared.handle_event(event),
                Err(_) => break 'schedule,
            },
            recv(ticker) -> _ => shared.playback_tick(),
        }
    }
    debug!("scheduler stopped");
}

fn procedural_loop(shared: Arc<Shared>, blocks: Receiver<Vec<f32>>, stop: Receiver<()>) {
    'procedural: loop {
        select! {
            recv(stop) -> _ => break 'procedural,
            recv(blocks) -> block => match block {
                Ok(block) => shared.process_block(&block),
                Err(_) => break 'procedural,
            },
        }
    }
    debug!("procedural worker stopped");
}

pub struct Engine {
    config: EngineConfig,
    shared: Arc<Shared>,
    subscriber: Receiver<Notification>,
    transmit: TransmitEngine,
    controller_events: Sender<MidiEvent>,
    controller: Mutex<Option<ControllerInput>>,
    audio_blocks: Sender<Vec<f32>>,
    capture: Mutex<Option<AudioCapture>>,
    scheduler: Worker,
    procedural: Worker,
}

impl Engine {
    /// Starts the transmit loop and both workers. Hardware stays disconnected.
    pub fn start(config: EngineConfig, doc: ShowDocument) -> Result<Self> {
        let universe = Arc::new(Universe::new());
        let (notify_tx, notify_rx) = bounded(config.notification_queue.max(1));
        let shared = Arc::new(Shared {
            clock: Instant::now(),
            universe: Arc::clone(&universe),
            show: RwLock::new(doc),
            playback: Mutex::new(Playback::new(Arc::clone(&universe))),
            mapping: Mutex::new(MappingManager::new()),
            effects: Mutex::new(EffectEngine::new()),
            reactions: Mutex::new(ReactionEngine::new()),
            reactor: Mutex::new(AudioReactor::new(config.audio.sample_rate, config.audio.gain)),
            audio: ArcSwap::from_pointee(AudioSnapshot::default()),
            notifications: notify_tx,
        });

        let transmit = TransmitEngine::start(universe, config.transmit_period(), config.backoff())?;

        let (event_tx, event_rx) = bounded(config.controller_queue.max(1));
        let scheduler = {
            let shared = Arc::clone(&shared);
            let period = config.tick_period();
            Worker::spawn("playback-scheduler", move |stop| {
                scheduler_loop(shared, period, event_rx, stop)
            })?
        };

        let (block_tx, block_rx) = bounded(config.audio_queue.max(1));
        let procedural = {
            let shared = Arc::clone(&shared);
            Worker::spawn("procedural", move |stop| {
                procedural_loop(shared, block_rx, stop)
            })?
        };

        info!("engine started");
        Ok(Self {
            config,
            shared,
            subscriber: notify_rx,
            transmit,
            controller_events: event_tx,
            controller: Mutex::new(None),
            audio_blocks: block_tx,
            capture: Mutex::new(None),
            scheduler,
            procedural,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn universe(&self) -> Arc<Universe> {
        Arc::clone(&self.shared.universe)
    }

    /// Milliseconds since the engine started.
    pub fn now_ms(&self) -> u64 {
        self.shared.now_ms()
    }

    /// Receiver of advisory notifications. All clones share one queue.
    pub fn subscribe(&self) -> Receiver<Notification> {
        self.subscriber.clone()
    }

    /// Runs `f` against the current document.
    pub fn with_document<R>(&self, f: impl FnOnce(&ShowDocument) -> R) -> R {
        f(&self.shared.show.read())
    }

    fn edit_document<R>(&self, f: impl FnOnce(&mut ShowDocument) -> R) -> R {
        f(&mut self.shared.show.write())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.shared.show.read().save(path)
    }

    // Transport

    pub fn connect_serial(&self, port: &str) -> Result<()> {
        self.transmit.connect_serial(port)?;
        self.shared
            .notify(Notification::TransportChanged(self.transmit.status().state));
        Ok(())
    }

    pub fn connect_network(&self, host: &str, universe: u16) -> Result<()> {
        self.transmit.connect_network(host, universe)?;
        self.shared
            .notify(Notification::TransportChanged(self.transmit.status().state));
        Ok(())
    }

    pub fn disconnect(&self) {
        self.transmit.disconnect();
        self.shared
            .notify(Notification::TransportChanged(TransportState::Disconnected));
    }

    pub fn transmit_status(&self) -> TransmitStatus {
        self.transmit.status()
    }

    pub fn list_serial_ports(&self) -> Result<Vec<String>> {
        serial::available_ports()
    }

    // Live layer

    /// Stores `clamp(value, 0, 255)` into the Live layer.
    pub fn set_channel(&self, channel: usize, value: i64) -> Result<()> {
        self.shared.universe.write(Layer::Live, channel, value)
    }

    pub fn set_global(&self, param: GlobalParam, value: u8) {
        self.edit_document(|doc| doc.globals.set(param, value));
    }

    // Playback

    pub fn playback_state(&self) -> PlaybackState {
        self.shared.playback.lock().state()
    }

    /// Toggles a scene, chase or cue. Returns whether it is active afterwards.
    pub fn toggle(&self, kind: TargetKind, name: &str) -> Result<bool> {
        let now = self.now_ms();
        let doc = self.shared.show.read();
        let mut playback = self.shared.playback.lock();
        let active = playback.toggle(&doc, kind, name, now)?;
        self.shared.playback_changed(&playback);
        Ok(active)
    }

    pub fn toggle_scene(&self, name: &str) -> Result<bool> {
        self.toggle(TargetKind::Scene, name)
    }

    pub fn toggle_chase(&self, name: &str) -> Result<bool> {
        self.toggle(TargetKind::Chase, name)
    }

    pub fn toggle_cue(&self, name: &str) -> Result<bool> {
        self.toggle(TargetKind::Cue, name)
    }

    pub fn start_recording(&self) {
        let mut playback = self.shared.playback.lock();
        playback.start_recording();
        self.shared.playback_changed(&playback);
    }

    /// Ends recording and stores the frames as cue `name`. Returns the frame count.
    pub fn stop_recording(&self, name: &str) -> Result<usize> {
        let mut doc = self.shared.show.write();
        let mut playback = self.shared.playback.lock();
        let frames = playback
            .stop_recording()
            .ok_or(Error::NotRunning("cue recording"))?;
        let count = frames.len();
        doc.store_cue(name, frames);
        self.shared.playback_changed(&playback);
        Ok(count)
    }

    /// Ends recording without keeping anything.
    pub fn discard_recording(&self) {
        let mut playback = self.shared.playback.lock();
        if playback.stop_recording().is_some() {
            self.shared.playback_changed(&playback);
        }
    }

    pub fn stop_all(&self) {
        let mut playback = self.shared.playback.lock();
        playback.stop_all();
        self.shared.playback_changed(&playback);
    }

    // Running order

    pub fn add_show_entry(&self, kind: TargetKind, name: &str, duration_ms: u64) -> Result<()> {
        self.edit_document(|doc| doc.add_show_entry(kind, name, duration_ms))
    }

    pub fn remove_show_entry(&self, index: usize) -> Result<ShowEntry> {
        self.edit_document(|doc| doc.remove_show_entry(index))
            .ok_or_else(|| Error::UnknownItem {
                kind: "show step",
                name: index.to_string(),
            })
    }

    pub fn play_show_item(&self, index: usize) -> Result<()> {
        let now = self.now_ms();
        let doc = self.shared.show.read();
        let mut playback = self.shared.playback.lock();
        playback.play_show_item(&doc, index, now)?;
        self.shared.playback_changed(&playback);
        Ok(())
    }

    pub fn show_next(&self) -> Result<bool> {
        let now = self.now_ms();
        let doc = self.shared.show.read();
        let mut playback = self.shared.playback.lock();
        let advanced = playback.show_next(&doc, now)?;
        if advanced {
            self.shared.playback_changed(&playback);
        }
        Ok(advanced)
    }

    // Document editing

    /// Stores the non-zero channels of the current Output as scene `name`.
    pub fn save_scene(&self, name: &str) {
        let output = self.shared.universe.recompute();
        self.edit_document(|doc| doc.save_scene(name, &output));
        info!(scene = name, "scene saved");
    }

    pub fn delete_scene(&self, name: &str) -> bool {
        self.edit_document(|doc| doc.delete_scene(name))
    }

    pub fn create_chase(&self, name: &str, steps: Vec<String>, hold_ms: u64, fade_ms: u64) {
        self.edit_document(|doc| doc.create_chase(name, steps, hold_ms, fade_ms));
    }

    pub fn delete_chase(&self, name: &str) -> bool {
        self.edit_document(|doc| doc.delete_chase(name))
    }

    pub fn delete_cue(&self, name: &str) -> bool {
        self.edit_document(|doc| doc.delete_cue(name))
    }

    /// Stores the current selection as group `name`.
    pub fn create_group(&self, name: &str) -> Result<()> {
        let mut doc = self.shared.show.write();
        let mapping = self.shared.mapping.lock();
        if mapping.selection().is_empty() {
            return Err(Error::NothingSelected("channels"));
        }
        doc.create_group(name, mapping.selection().iter().copied());
        Ok(())
    }

    pub fn delete_group(&self, name: &str) -> bool {
        self.edit_document(|doc| doc.delete_group(name))
    }

    pub fn create_fixture(&self, name: &str, fixture: Fixture) {
        self.edit_document(|doc| doc.create_fixture(name, fixture));
    }

    pub fn delete_fixture(&self, name: &str) -> bool {
        self.edit_document(|doc| doc.delete_fixture(name))
    }

    pub fn unbind_remote(&self, signal: &str, target: &Target) -> bool {
        let removed = self.edit_document(|doc| doc.unbind_remote(signal, target));
        if removed {
            self.shared.notify(Notification::MappingsChanged);
        }
        removed
    }

    pub fn unmap_channel(&self, signal: &str, channel: u16) -> bool {
        let removed = self.edit_document(|doc| doc.unmap_channel(signal, channel));
        if removed {
            self.shared.notify(Notification::MappingsChanged);
        }
        removed
    }

    pub fn clear_direct_mappings(&self) {
        self.edit_document(ShowDocument::clear_direct_mappings);
        self.shared.notify(Notification::MappingsChanged);
    }

    /// Generates pattern step scenes and a chase over the named fixtures.
    pub fn generate_fx_chase<'a>(
        &self,
        chase: &str,
        fixtures: impl IntoIterator<Item = &'a str>,
        spec: &FxChaseSpec,
    ) -> Result<Vec<String>> {
        self.edit_document(|doc| create_fx_chase(doc, chase, fixtures, spec))
    }

    // Controller

    /// Opens a controller input port by exact or partial name. Replaces any open port.
    pub fn open_controller(&self, name: &str) -> Result<String> {
        let input = ControllerInput::open(name, self.controller_events.clone())?;
        let port = input.port_name().to_string();
        if let Some(previous) = self.controller.lock().replace(input) {
            previous.close();
        }
        Ok(port)
    }

    pub fn close_controller(&self) {
        if let Some(input) = self.controller.lock().take() {
            input.close();
        }
    }

    pub fn controller_port(&self) -> Option<String> {
        self.controller
            .lock()
            .as_ref()
            .map(|c| c.port_name().to_string())
    }

    pub fn list_controller_ports(&self) -> Result<Vec<String>> {
        midi::list_ports()
    }

    /// Queues an event as if it came from the controller port.
    pub fn send_controller_event(&self, event: MidiEvent) -> Result<()> {
        self.controller_events
            .try_send(event)
            .map_err(|_| Error::NotRunning("controller queue"))
    }

    pub fn enter_learn(&self, target: LearnTarget) {
        let mut mapping = self.shared.mapping.lock();
        mapping.enter_learn(target);
        self.shared
            .notify(Notification::LearnChanged(mapping.learn_state().clone()));
    }

    pub fn cancel_learn(&self) {
        self.shared.mapping.lock().cancel_learn();
        self.shared
            .notify(Notification::LearnChanged(LearnState::Idle));
    }

    pub fn learn_state(&self) -> LearnState {
        self.shared.mapping.lock().learn_state().clone()
    }

    // Selection

    pub fn select_channels(&self, channels: impl IntoIterator<Item = u16>) {
        self.shared.mapping.lock().set_selection(channels);
    }

    /// Selects a group, or clears the selection when that group is already selected.
    pub fn select_group(&self, name: &str) -> Result<()> {
        let doc = self.shared.show.read();
        self.shared.mapping.lock().select_group(&doc, name)
    }

    pub fn select_fixtures<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let doc = self.shared.show.read();
        self.shared.mapping.lock().select_fixtures(&doc, names);
    }

    pub fn selection(&self) -> BTreeSet<u16> {
        self.shared.mapping.lock().selection().clone()
    }

    pub fn set_selection_level(&self, level: i64) {
        self.shared
            .mapping
            .lock()
            .set_selection_level(&self.shared.universe, level);
    }

    pub fn set_fixture_color<'a>(&self, fixtures: impl IntoIterator<Item = &'a str>, rgb: (u8, u8, u8)) {
        let doc = self.shared.show.read();
        midi::set_fixture_color(&doc, &self.shared.universe, fixtures, rgb);
    }

    // Audio and effects

    /// Opens the configured input device and feeds the procedural worker.
    pub fn start_audio(&self) -> Result<u32> {
        let mut capture = self.capture.lock();
        drop(capture.take());
        let started = AudioCapture::start(&self.config.audio, self.audio_blocks.clone())?;
        let rate = started.sample_rate();
        self.shared.rebuild_reactor(rate);
        *capture = Some(started);
        info!(sample_rate = rate, "audio reactor running");
        Ok(rate)
    }

    /// Stops capture and renders one silent frame.
    pub fn stop_audio(&self) {
        drop(self.capture.lock().take());
        self.shared.audio.store(Arc::new(AudioSnapshot::default()));
        self.shared.refresh_procedural();
    }

    pub fn is_audio_running(&self) -> bool {
        self.capture.lock().is_some()
    }

    /// Queues one mono block for analysis, as the capture callback does.
    /// Returns false when the queue is full and the block was dropped.
    pub fn feed_audio(&self, block: Vec<f32>) -> bool {
        self.audio_blocks.try_send(block).is_ok()
    }

    pub fn audio_snapshot(&self) -> AudioSnapshot {
        **self.shared.audio.load()
    }

    pub fn set_audio_gain(&self, gain: f32) {
        self.shared.reactor.lock().set_gain(gain);
    }

    pub fn add_effect(&self, algorithm: Algorithm, fixtures: Vec<String>) -> Result<EffectId> {
        self.shared.effects.lock().add(algorithm, fixtures)
    }

    pub fn remove_effect(&self, id: EffectId) -> bool {
        let removed = self.shared.effects.lock().remove(id);
        if removed {
            self.shared.refresh_procedural();
        }
        removed
    }

    pub fn configure_effect(&self, id: EffectId, params: EffectParams) -> Result<()> {
        self.shared.effects.lock().configure(id, params)?;
        if params.active.is_some() {
            self.shared.refresh_procedural();
        }
        Ok(())
    }

    pub fn effects(&self) -> Vec<(EffectId, GenerativeEffect)> {
        self.shared
            .effects
            .lock()
            .iter()
            .map(|(id, fx)| (id, fx.clone()))
            .collect()
    }

    pub fn add_reaction(&self, link: ReactionLink) -> usize {
        self.shared.reactions.lock().add(link)
    }

    pub fn remove_reaction(&self, index: usize) -> Result<ReactionLink> {
        self.shared.reactions.lock().remove(index)
    }

    pub fn reactions(&self) -> Vec<ReactionLink> {
        self.shared.reactions.lock().links().to_vec()
    }

    /// Stops every worker, releases the hardware and closes the controller and audio inputs.
    pub fn shutdown(self) {
        self.close_controller();
        self.stop_audio();
        let Self {
            mut scheduler,
            mut procedural,
            transmit,
            ..
        } = self;
        scheduler.stop();
        procedural.stop();
        transmit.shutdown();
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::show::{Role, Scene};
    use std::collections::BTreeMap;

    fn wait_for(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn config() -> EngineConfig {
        EngineConfig {
            transmit_period_ms: 5,
            tick_period_ms: 5,
            ..EngineConfig::default()
        }
    }

    fn doc() -> ShowDocument {
        let mut doc = ShowDocument::default();
        doc.scenes.insert(
            "warm".into(),
            Scene {
                levels: BTreeMap::from([(1, 200), (2, 90)]),
            },
        );
        doc.create_fixture("par", Fixture::new(10, vec![Role::Dimmer, Role::Red]));
        doc
    }

    #[test]
    fn toggled_scene_reaches_output_without_hardware() {
        let engine = Engine::start(config(), doc()).unwrap();
        let notes = engine.subscribe();
        assert!(engine.toggle_scene("warm").unwrap());
        let universe = engine.universe();
        assert!(wait_for(|| universe.level(Layer::Output, 1) == 200));
        assert!(matches!(
            notes.try_recv(),
            Ok(Notification::PlaybackChanged(PlaybackState { scene: Some(_), .. }))
        ));
        assert!(!engine.toggle_scene("warm").unwrap());
        assert!(wait_for(|| universe.level(Layer::Output, 1) == 0));
        engine.shutdown();
    }

    #[test]
    fn controller_learn_then_execute() {
        let engine = Engine::start(config(), doc()).unwrap();
        engine.select_channels([3, 4]);
        engine.enter_learn(LearnTarget::Channels);
        engine
            .send_controller_event(MidiEvent::ControlChange {
                controller: 7,
                value: 0,
            })
            .unwrap();
        assert!(wait_for(|| engine.learn_state() == LearnState::Idle));
        assert_eq!(
            engine.with_document(|d| d.map.get("cc_7").cloned()),
            Some(vec![3, 4])
        );

        engine
            .send_controller_event(MidiEvent::ControlChange {
                controller: 7,
                value: 127,
            })
            .unwrap();
        let universe = engine.universe();
        assert!(wait_for(|| universe.level(Layer::Live, 4) == 255));
        engine.shutdown();
    }

    #[test]
    fn device_rate_rebuilds_reactor_with_user_gain() {
        let engine = Engine::start(config(), doc()).unwrap();
        engine.set_audio_gain(2.5);
        let square = (0..1024).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        assert!(engine.feed_audio(square));
        assert!(wait_for(|| engine.shared.reactor.lock().rolling_peak() > 0.4));

        engine.shared.rebuild_reactor(48_000);
        {
            let reactor = engine.shared.reactor.lock();
            assert_eq!(reactor.sample_rate(), 48_000);
            assert_eq!(reactor.gain(), 2.5);
            assert_eq!(
                reactor.rolling_peak(),
                AudioReactor::new(48_000, 2.5).rolling_peak()
            );
        }
        engine.shutdown();
    }

    #[test]
    fn recording_stores_a_cue() {
        let engine = Engine::start(config(), doc()).unwrap();
        assert!(matches!(
            engine.stop_recording("nothing"),
            Err(Error::NotRunning(_))
        ));
        engine.set_channel(5, 300).unwrap();
        engine.start_recording();
        assert!(wait_for(|| engine.playback_state().recorded_frames >= 3));
        let frames = engine.stop_recording("take").unwrap();
        assert!(frames >= 3);
        let stored = engine.with_document(|d| d.cues["take"].frames[0].get(5));
        assert_eq!(stored, 255);
        engine.shutdown();
    }

    #[test]
    fn audio_blocks_drive_effects() {
        let engine = Engine::start(config(), doc()).unwrap();
        let id = engine
            .add_effect(Algorithm::SpectralSplit, vec!["par".into()])
            .unwrap();
        engine
            .configure_effect(
                id,
                EffectParams {
                    threshold: Some(0.0),
                    ..EffectParams::default()
                },
            )
            .unwrap();
        let tone: Vec<f32> = (0..1024)
            .map(|n| (2.0 * std::f32::consts::PI * 86.0 * n as f32 / 44_100.0).sin())
            .collect();
        let universe = engine.universe();
        assert!(wait_for(|| {
            engine.feed_audio(tone.clone());
            universe.level(Layer::Live, 11) == 255
        }));
        assert!(engine.audio_snapshot().bass() > 0);
        engine.shutdown();
    }

    #[test]
    fn group_needs_a_selection() {
        let engine = Engine::start(config(), doc()).unwrap();
        assert!(matches!(
            engine.create_group("empty"),
            Err(Error::NothingSelected(_))
        ));
        engine.select_fixtures(["par"]);
        engine.create_group("pars").unwrap();
        assert_eq!(
            engine.with_document(|d| d.group_channels("pars").to_vec()),
            vec![10, 11]
        );
        engine.shutdown();
    }
}
