//! Playback Engine
//!
//! Owns which scene, chase and cue are active and writes the Scene, Chase and Cue layers.
//! Time is passed in explicitly as milliseconds on a monotonic clock so the state machines
//! are deterministic under test.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::show::{Chase, Globals, NEUTRAL_MASTER, Scene, ShowDocument, TargetKind};
use crate::universe::{DMX_CHANNELS, DmxFrame, Layer, Universe};

/// Shortest multiplier a chase master can apply to base timings.
pub const MIN_TIME_FACTOR: f64 = 0.05;

/// Master value to timing multiplier: 0 -> 0.05x, 127 -> 1x, 255 -> ~2x.
pub fn time_factor(master: u8) -> f64 {
    (master as f64 / NEUTRAL_MASTER as f64).max(MIN_TIME_FACTOR)
}

/// Effective `(hold, fade)` in milliseconds after the chase masters.
pub fn effective_timing(chase: &Chase, globals: &Globals) -> (u64, u64) {
    let hold = (chase.hold_ms as f64 * time_factor(globals.chase_speed)) as u64;
    let fade = (chase.fade_ms as f64 * time_factor(globals.chase_fade)) as u64;
    (hold, fade)
}

fn cycle_len(hold: u64, fade: u64) -> u64 {
    (hold + fade).max(1)
}

/// Chase layer contents `elapsed_ms` after the chase started.
/// Returns `None` for a chase without steps.
pub fn chase_frame(
    doc: &ShowDocument,
    chase: &Chase,
    hold: u64,
    fade: u64,
    elapsed_ms: u64,
) -> Option<DmxFrame> {
    let steps = chase.steps.len() as u64;
    if steps == 0 {
        return None;
    }
    let cycle = cycle_len(hold, fade);
    let elapsed = elapsed_ms % (cycle * steps);
    let index = (elapsed / cycle) as usize;
    let t = elapsed % cycle;

    let empty = Scene::default();
    let scene = |i: usize| {
        doc.scenes
            .get(&chase.steps[i % chase.steps.len()])
            .unwrap_or(&empty)
    };
    let a = scene(index);
    if t < hold {
        return Some(a.to_frame());
    }
    let b = scene(index + 1);
    let progress = if fade > 0 {
        (t - hold) as f64 / fade as f64
    } else {
        1.0
    };
    let mut frame = DmxFrame::new();
    for ch in 1..=DMX_CHANNELS as u16 {
        let va = a.level(ch) as f64;
        let vb = b.level(ch) as f64;
        frame.set(ch as usize, (va + (vb - va) * progress) as u8);
    }
    Some(frame)
}

#[derive(Debug, Clone)]
struct ChaseRun {
    name: String,
    start_ms: i64,
    timing: Option<(u64, u64)>,
}

impl ChaseRun {
    /// Moves the start so the loop position keeps its fraction when timings change.
    fn reanchor(&mut self, now_ms: u64, steps: u64, timing: (u64, u64)) {
        let Some(previous) = self.timing.replace(timing) else {
            return;
        };
        if previous == timing {
            return;
        }
        let old_loop = (cycle_len(previous.0, previous.1) * steps) as i64;
        let new_loop = (cycle_len(timing.0, timing.1) * steps) as i64;
        let position = (now_ms as i64 - self.start_ms).rem_euclid(old_loop);
        let fraction = position as f64 / old_loop as f64;
        let new_position = (fraction * new_loop as f64) as i64;
        self.start_ms = now_ms as i64 - new_position;
        debug!(chase = %self.name, ?previous, ?timing, "chase timing changed, phase kept");
    }

    fn elapsed(&self, now_ms: u64) -> u64 {
        (now_ms as i64 - self.start_ms).max(0) as u64
    }
}

/// Running-order cursor.
#[derive(Debug, Clone, Default)]
pub struct ShowRunner {
    /// Index of the entry played last
    pub current: Option<usize>,
    /// When the next entry fires on its own
    pub deadline_ms: Option<u64>,
}

/// Snapshot of what is active, for displays and notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackState {
    pub scene: Option<String>,
    pub chase: Option<String>,
    pub cue: Option<String>,
    pub recording: bool,
    pub recorded_frames: usize,
    pub show_index: Option<usize>,
}

impl PlaybackState {
    /// A scene, chase or cue is playing.
    pub fn is_active(&self) -> bool {
        self.scene.is_some() || self.chase.is_some() || self.cue.is_some()
    }
}

pub struct Playback {
    universe: Arc<Universe>,
    active_scene: Option<String>,
    chase: Option<ChaseRun>,
    active_cue: Option<String>,
    cue_index: usize,
    recording: Option<Vec<DmxFrame>>,
    show: ShowRunner,
}

impl Playback {
    pub fn new(universe: Arc<Universe>) -> Self {
        Self {
            universe,
            active_scene: None,
            chase: None,
            active_cue: None,
            cue_index: 0,
            recording: None,
            show: ShowRunner::default(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState {
            scene: self.active_scene.clone(),
            chase: self.chase.as_ref().map(|c| c.name.clone()),
            cue: self.active_cue.clone(),
            recording: self.recording.is_some(),
            recorded_frames: self.recording.as_ref().map_or(0, Vec::len),
            show_index: self.show.current,
        }
    }

    pub fn show_runner(&self) -> &ShowRunner {
        &self.show
    }

    /// Activates `name` (replacing the Scene layer) or, if it is already active, clears it.
    /// Returns whether the scene is active afterwards.
    pub fn toggle_scene(&mut self, doc: &ShowDocument, name: &str) -> bool {
        if self.active_scene.as_deref() == Some(name) {
            self.active_scene = None;
            self.universe.clear(Layer::Scene);
            info!(scene = name, "scene off");
            return false;
        }
        let frame = doc
            .scenes
            .get(name)
            .map(Scene::to_frame)
            .unwrap_or_default();
        self.universe.replace(Layer::Scene, frame);
        self.active_scene = Some(name.to_string());
        info!(scene = name, "scene on");
        true
    }

    /// Starts `name` from its first step at `now_ms`, or stops it if it is running.
    pub fn toggle_chase(&mut self, name: &str, now_ms: u64) -> bool {
        if self.chase.as_ref().is_some_and(|c| c.name == name) {
            self.chase = None;
            self.universe.clear(Layer::Chase);
            info!(chase = name, "chase off");
            return false;
        }
        self.chase = Some(ChaseRun {
            name: name.to_string(),
            start_ms: now_ms as i64,
            timing: None,
        });
        info!(chase = name, "chase on");
        true
    }

    /// Starts `name` from its first frame, or stops it if it is playing.
    pub fn toggle_cue(&mut self, name: &str) -> bool {
        if self.active_cue.as_deref() == Some(name) {
            self.active_cue = None;
            self.universe.clear(Layer::Cue);
            info!(cue = name, "cue off");
            return false;
        }
        self.active_cue = Some(name.to_string());
        self.cue_index = 0;
        info!(cue = name, "cue on");
        true
    }

    /// Toggles whatever `kind` names. Groups, globals and fixtures are not playable.
    pub fn toggle(
        &mut self,
        doc: &ShowDocument,
        kind: TargetKind,
        name: &str,
        now_ms: u64,
    ) -> Result<bool> {
        match kind {
            TargetKind::Scene => Ok(self.toggle_scene(doc, name)),
            TargetKind::Chase => Ok(self.toggle_chase(name, now_ms)),
            TargetKind::Cue => Ok(self.toggle_cue(name)),
            other => Err(Error::UnknownItem {
                kind: "playable kind",
                name: other.to_string(),
            }),
        }
    }

    pub fn start_recording(&mut self) {
        self.recording = Some(Vec::new());
        info!("cue recording started");
    }

    /// Ends recording and hands back the captured frames.
    pub fn stop_recording(&mut self) -> Option<Vec<DmxFrame>> {
        let frames = self.recording.take();
        if let Some(frames) = &frames {
            info!(frames = frames.len(), "cue recording stopped");
        }
        frames
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Deactivates everything, drops any recording and zeroes the four source layers.
    pub fn stop_all(&mut self) {
        self.active_scene = None;
        self.chase = None;
        self.active_cue = None;
        self.recording = None;
        self.show.deadline_ms = None;
        for layer in Layer::sources() {
            self.universe.clear(layer);
        }
        info!("all playback stopped");
    }

    /// Plays running-order entry `index` and arms its auto-advance.
    pub fn play_show_item(&mut self, doc: &ShowDocument, index: usize, now_ms: u64) -> Result<()> {
        let entry = doc.show.get(index).ok_or_else(|| Error::UnknownItem {
            kind: "show step",
            name: index.to_string(),
        })?;
        self.toggle(doc, entry.kind, &entry.name, now_ms)?;
        self.show.current = Some(index);
        self.show.deadline_ms = (entry.duration_ms > 0).then(|| now_ms + entry.duration_ms);
        info!(index, step = %entry.target(), duration_ms = entry.duration_ms, "show step");
        Ok(())
    }

    /// Plays the entry after the current one, wrapping to the first.
    /// Returns false when the running order is empty.
    pub fn show_next(&mut self, doc: &ShowDocument, now_ms: u64) -> Result<bool> {
        if doc.show.is_empty() {
            self.show.deadline_ms = None;
            return Ok(false);
        }
        let next = self
            .show
            .current
            .map_or(0, |current| (current + 1) % doc.show.len());
        self.play_show_item(doc, next, now_ms)?;
        Ok(true)
    }

    /// One playback period: capture, chase, cue, then show auto-advance.
    /// Returns true when the active items changed.
    pub fn tick(&mut self, doc: &ShowDocument, now_ms: u64) -> bool {
        if let Some(frames) = self.recording.as_mut() {
            frames.push(DmxFrame::clone(&self.universe.recompute()));
        }

        let mut changed = false;
        if let Some(run) = self.chase.as_mut() {
            match doc.chases.get(&run.name).filter(|c| !c.steps.is_empty()) {
                Some(chase) => {
                    let timing = effective_timing(chase, &doc.globals);
                    run.reanchor(now_ms, chase.steps.len() as u64, timing);
                    if let Some(frame) =
                        chase_frame(doc, chase, timing.0, timing.1, run.elapsed(now_ms))
                    {
                        self.universe.replace(Layer::Chase, frame);
                    }
                }
                None => {
                    debug!(chase = %run.name, "running chase deleted or emptied");
                    self.chase = None;
                    self.universe.clear(Layer::Chase);
                    changed = true;
                }
            }
        }

        if let Some(name) = &self.active_cue {
            match doc.cues.get(name).filter(|c| !c.frames.is_empty()) {
                Some(cue) => {
                    let index = self.cue_index % cue.frames.len();
                    self.universe.replace(Layer::Cue, cue.frames[index].clone());
                    self.cue_index = (index + 1) % cue.frames.len();
                }
                None => {
                    debug!(cue = %name, "running cue deleted or emptied");
                    self.active_cue = None;
                    self.cue_index = 0;
                    self.universe.clear(Layer::Cue);
                    changed = true;
                }
            }
        }

        let advanced = match self.show.deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.show.deadline_ms = None;
                match self.show_next(doc, now_ms) {
                    Ok(advanced) => advanced,
                    Err(e) => {
                        debug!(%e, "show auto-advance skipped");
                        false
                    }
                }
            }
            _ => false,
        };
        changed || advanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::show::Cue;

    fn scene(levels: &[(u16, u8)]) -> Scene {
        Scene {
            levels: levels.iter().copied().collect(),
        }
    }

    fn doc_with_chase(hold: u64, fade: u64) -> ShowDocument {
        let mut doc = ShowDocument::default();
        doc.scenes.insert("A".into(), scene(&[(1, 10)]));
        doc.scenes.insert("B".into(), scene(&[(1, 110)]));
        doc.create_chase("X", vec!["A".into(), "B".into()], hold, fade);
        doc
    }

    fn setup() -> (Arc<Universe>, Playback) {
        let universe = Arc::new(Universe::new());
        let playback = Playback::new(universe.clone());
        (universe, playback)
    }

    #[test]
    fn scene_toggle_twice_returns_to_dark() {
        let (universe, mut playback) = setup();
        let mut doc = ShowDocument::default();
        doc.scenes.insert("Warm".into(), scene(&[(1, 200), (7, 50)]));

        assert!(playback.toggle_scene(&doc, "Warm"));
        assert_eq!(universe.level(Layer::Scene, 1), 200);
        assert_eq!(universe.level(Layer::Scene, 7), 50);
        assert!(!playback.toggle_scene(&doc, "Warm"));
        assert!(universe.snapshot(Layer::Scene).is_dark());
        assert_eq!(playback.state().scene, None);
    }

    #[test]
    fn switching_scenes_replaces_the_layer() {
        let (universe, mut playback) = setup();
        let mut doc = ShowDocument::default();
        doc.scenes.insert("A".into(), scene(&[(1, 200)]));
        doc.scenes.insert("B".into(), scene(&[(2, 100)]));
        playback.toggle_scene(&doc, "A");
        playback.toggle_scene(&doc, "B");
        assert_eq!(universe.level(Layer::Scene, 1), 0);
        assert_eq!(universe.level(Layer::Scene, 2), 100);
        assert_eq!(playback.state().scene.as_deref(), Some("B"));
    }

    #[test]
    fn missing_scene_activates_as_empty() {
        let (universe, mut playback) = setup();
        universe.write(Layer::Scene, 3, 30).unwrap();
        assert!(playback.toggle_scene(&ShowDocument::default(), "Ghost"));
        assert!(universe.snapshot(Layer::Scene).is_dark());
    }

    #[test]
    fn chase_interpolates_halfway_through_fade() {
        let (universe, mut playback) = setup();
        let doc = doc_with_chase(100, 100);
        playback.toggle_chase("X", 1_000);

        playback.tick(&doc, 1_050);
        assert_eq!(universe.level(Layer::Chase, 1), 10);
        playback.tick(&doc, 1_150);
        assert_eq!(universe.level(Layer::Chase, 1), 60);
        // Second step fades back to the first.
        playback.tick(&doc, 1_350);
        assert_eq!(universe.level(Layer::Chase, 1), 60);
        playback.tick(&doc, 1_400);
        assert_eq!(universe.level(Layer::Chase, 1), 10);
    }

    #[test]
    fn zero_hold_chase_is_linear_from_the_start() {
        let (universe, mut playback) = setup();
        let mut doc = ShowDocument::default();
        doc.scenes.insert("A".into(), scene(&[(1, 255)]));
        doc.scenes.insert("B".into(), scene(&[(1, 0)]));
        doc.create_chase("X", vec!["A".into(), "B".into()], 0, 1000);

        playback.toggle_chase("X", 0);
        playback.tick(&doc, 500);
        assert_eq!(universe.level(Layer::Chase, 1), 127);
    }

    #[test]
    fn zero_fade_snaps_and_zero_cycle_does_not_divide_by_zero() {
        let doc = doc_with_chase(0, 0);
        let chase = &doc.chases["X"];
        let frame = chase_frame(&doc, chase, 0, 0, 12_345).unwrap();
        assert!(frame.get(1) == 10 || frame.get(1) == 110);
        assert!(chase_frame(&doc, &Chase::default(), 10, 10, 5).is_none());
    }

    #[test]
    fn chase_over_deleted_scenes_plays_dark() {
        let (universe, mut playback) = setup();
        let mut doc = doc_with_chase(100, 100);
        doc.delete_scene("A");
        doc.delete_scene("B");
        playback.toggle_chase("X", 0);
        playback.tick(&doc, 150);
        assert!(universe.snapshot(Layer::Chase).is_dark());
    }

    #[test]
    fn master_speed_scales_hold_and_keeps_phase() {
        let (universe, mut playback) = setup();
        let mut doc = doc_with_chase(100, 100);
        playback.toggle_chase("X", 0);
        playback.tick(&doc, 100);
        // 100 ms into a 400 ms loop, i.e. 25%.
        doc.globals.chase_speed = 254;
        doc.globals.chase_fade = 254;
        playback.tick(&doc, 100);
        // Loop is now 800 ms, 25% is 200 ms: the start of the first fade.
        assert_eq!(universe.level(Layer::Chase, 1), 10);
        playback.tick(&doc, 200);
        assert_eq!(universe.level(Layer::Chase, 1), 60);
    }

    #[test]
    fn time_factor_has_a_floor() {
        assert_eq!(time_factor(0), MIN_TIME_FACTOR);
        assert_eq!(time_factor(127), 1.0);
        let (hold, fade) = effective_timing(
            &Chase {
                steps: vec![],
                hold_ms: 1000,
                fade_ms: 1000,
            },
            &Globals {
                chase_speed: 0,
                chase_fade: 254,
            },
        );
        assert_eq!(hold, 50);
        assert_eq!(fade, 2000);
    }

    #[test]
    fn chase_toggle_off_clears_layer() {
        let (universe, mut playback) = setup();
        let doc = doc_with_chase(100, 100);
        playback.toggle_chase("X", 0);
        playback.tick(&doc, 10);
        assert!(!universe.snapshot(Layer::Chase).is_dark());
        assert!(!playback.toggle_chase("X", 20));
        assert!(universe.snapshot(Layer::Chase).is_dark());
    }

    #[test]
    fn deleted_running_chase_goes_dark() {
        let (universe, mut playback) = setup();
        let mut doc = doc_with_chase(100, 0);
        playback.toggle_chase("X", 0);
        playback.tick(&doc, 10);
        assert_eq!(universe.level(Layer::Chase, 1), 10);

        assert!(doc.delete_chase("X"));
        assert!(playback.tick(&doc, 5000));
        assert!(universe.snapshot(Layer::Chase).is_dark());
        assert_eq!(playback.state().chase, None);
    }

    #[test]
    fn chase_edited_to_no_steps_goes_dark() {
        let (universe, mut playback) = setup();
        let mut doc = doc_with_chase(100, 0);
        playback.toggle_chase("X", 0);
        playback.tick(&doc, 10);
        doc.create_chase("X", Vec::new(), 100, 0);
        playback.tick(&doc, 20);
        assert!(universe.snapshot(Layer::Chase).is_dark());
        assert!(!playback.state().is_active());
    }

    #[test]
    fn deleted_running_cue_goes_dark() {
        let (universe, mut playback) = setup();
        let mut doc = ShowDocument::default();
        let mut frame = DmxFrame::new();
        frame.set(1, 90);
        doc.cues.insert("C".into(), Cue { frames: vec![frame] });
        playback.toggle_cue("C");
        playback.tick(&doc, 0);
        assert_eq!(universe.level(Layer::Cue, 1), 90);

        assert!(doc.delete_cue("C"));
        assert!(playback.tick(&doc, 40));
        assert!(universe.snapshot(Layer::Cue).is_dark());
        assert_eq!(playback.state().cue, None);
    }

    #[test]
    fn cue_loops_over_its_frames() {
        let (universe, mut playback) = setup();
        let mut doc = ShowDocument::default();
        let frames = (1..=3u8)
            .map(|v| {
                let mut f = DmxFrame::new();
                f.set(1, v);
                f
            })
            .collect();
        doc.cues.insert("C".into(), Cue { frames });
        playback.toggle_cue("C");

        let seen: Vec<u8> = (0..5)
            .map(|i| {
                playback.tick(&doc, i * 40);
                universe.level(Layer::Cue, 1)
            })
            .collect();
        assert_eq!(seen, vec![1, 2, 3, 1, 2]);

        assert!(!playback.toggle_cue("C"));
        assert!(universe.snapshot(Layer::Cue).is_dark());
    }

    #[test]
    fn empty_cue_is_a_no_op() {
        let (universe, mut playback) = setup();
        let mut doc = ShowDocument::default();
        doc.cues.insert("Empty".into(), Cue::default());
        playback.toggle_cue("Empty");
        playback.tick(&doc, 0);
        playback.toggle_cue("Missing");
        playback.tick(&doc, 40);
        assert!(universe.snapshot(Layer::Cue).is_dark());
    }

    #[test]
    fn recording_captures_layered_output() {
        let (universe, mut playback) = setup();
        let doc = doc_with_chase(1000, 0);
        universe.write(Layer::Live, 5, 99).unwrap();
        playback.toggle_chase("X", 0);
        playback.tick(&doc, 0);
        playback.start_recording();
        playback.tick(&doc, 40);
        playback.tick(&doc, 80);
        let frames = playback.stop_recording().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].get(5), 99);
        assert_eq!(frames[0].get(1), 10);
        assert!(!playback.is_recording());
    }

    #[test]
    fn stop_all_zeroes_every_source_layer() {
        let (universe, mut playback) = setup();
        let doc = doc_with_chase(100, 100);
        for layer in Layer::sources() {
            universe.write(layer, 1, 255).unwrap();
        }
        playback.toggle_scene(&doc, "A");
        playback.toggle_chase("X", 0);
        playback.start_recording();
        playback.stop_all();
        for layer in Layer::sources() {
            assert!(universe.snapshot(layer).is_dark(), "{layer}");
        }
        assert_eq!(playback.state(), PlaybackState::default());
    }

    #[test]
    fn show_auto_advances_and_wraps() {
        let (universe, mut playback) = setup();
        let mut doc = ShowDocument::default();
        doc.scenes.insert("A".into(), scene(&[(1, 255)]));
        doc.scenes.insert("B".into(), scene(&[(2, 255)]));
        doc.add_show_entry(TargetKind::Scene, "A", 1000).unwrap();
        doc.add_show_entry(TargetKind::Scene, "B", 0).unwrap();

        assert!(playback.show_next(&doc, 0).unwrap());
        assert_eq!(playback.show_runner().current, Some(0));
        assert_eq!(playback.show_runner().deadline_ms, Some(1000));
        assert!(!playback.tick(&doc, 999));
        assert!(playback.tick(&doc, 1000));
        assert_eq!(playback.show_runner().current, Some(1));
        assert_eq!(playback.show_runner().deadline_ms, None);
        assert_eq!(universe.level(Layer::Scene, 2), 255);

        playback.show_next(&doc, 2000).unwrap();
        assert_eq!(playback.show_runner().current, Some(0));
        assert!(playback.play_show_item(&doc, 9, 0).is_err());
    }
}
