//! Procedural Effect Engine
//!
//! Generative patterns driven by the latest [`AudioSnapshot`]. Each tick the engine zeroes
//! every Live channel owned by an effect (this tick or the previous one), renders all active
//! effects into a scratch frame merged with `max`, and writes the result back in one update.

use std::collections::{BTreeMap, BTreeSet};
use std::f32::consts::TAU;

use strum::{Display, EnumIter, EnumString};
use tracing::{debug, info};

use crate::audio::AudioSnapshot;
use crate::error::{Error, Result};
use crate::show::{Fixture, Role, ShowDocument};
use crate::universe::{DmxFrame, Layer, Universe};

const DEFAULT_THRESHOLD: f32 = 0.2;
/// Flash levels below this are not rendered.
const FLASH_FLOOR: f32 = 10.0;
const FLASH_RELEASE: f32 = 0.75;
/// Above this threshold the flash also needs high-band energy.
const FLASH_GATE: f32 = 0.5;
const SPOT_FLOOR: f32 = 5.0;
const SPOT_HUE_STEP: f32 = 0.001;
const WAVE_BASE_STEP: f32 = 0.05;
const WAVE_BASS_STEP: f32 = 0.15;
const WAVE_SPREAD: f32 = 3.0;
const WAVE_IDLE_BRIGHTNESS: f32 = 0.1;
/// RGB sum above which white emitters start to light.
const WHITE_KNEE: i32 = 240;

/// Converts HSV (all 0.0-1.0) to RGB components in 0.0-1.0.
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    if s <= 0.0 {
        return (v, v, v);
    }
    let h = h.rem_euclid(1.0) * 6.0;
    let sector = h.floor();
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u8 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

/// Stable handle of an effect instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EffectId(pub u32);

impl std::fmt::Display for EffectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum Algorithm {
    /// Fixtures split by position into bass/red, mid/green and high/blue thirds
    #[strum(to_string = "Spectral Split", serialize = "spectral")]
    SpectralSplit,
    /// White flash on snare onsets with a fast release
    #[strum(to_string = "Percussive Flash", serialize = "flash", serialize = "snare")]
    PercussiveFlash,
    /// Sine wave travelling across the fixtures, pushed by bass energy
    #[strum(to_string = "Traveling Wave", serialize = "wave", serialize = "bass wave")]
    TravelingWave,
    /// All fixtures follow the mid band through a slow envelope with a cycling hue
    #[strum(to_string = "Smoothed Spotlight", serialize = "spotlight", serialize = "solo")]
    SmoothedSpotlight,
}

/// Fast attack, multiplicative release.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Envelope {
    value: f32,
    attack: f32,
    release: f32,
}

impl Envelope {
    fn new(attack: f32, release: f32) -> Self {
        Self {
            value: 0.0,
            attack,
            release,
        }
    }

    fn update(&mut self, target: f32) -> f32 {
        if target > self.value {
            self.value += (target - self.value) * self.attack;
        } else {
            self.value *= self.release;
        }
        self.value
    }
}

/// Optional changes applied by [`EffectEngine::configure`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EffectParams {
    pub threshold: Option<f32>,
    pub intensity: Option<f32>,
    pub active: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct GenerativeEffect {
    algorithm: Algorithm,
    fixtures: Vec<String>,
    threshold: f32,
    intensity: f32,
    active: bool,
    signal: f32,
    phase: f32,
    hue: f32,
    flash: f32,
    envelope: Envelope,
}

impl GenerativeEffect {
    pub fn new(algorithm: Algorithm, fixtures: Vec<String>) -> Self {
        Self {
            algorithm,
            fixtures,
            threshold: DEFAULT_THRESHOLD,
            intensity: 1.0,
            active: true,
            signal: 0.0,
            phase: 0.0,
            hue: 0.1,
            flash: 0.0,
            envelope: Envelope::new(0.3, 0.92),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn fixtures(&self) -> &[String] {
        &self.fixtures
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Input level seen on the last tick (0-255), for meters.
    pub fn signal(&self) -> f32 {
        self.signal
    }

    /// Target fixtures present in the document, ordered by start address.
    fn resolve<'d>(&self, doc: &'d ShowDocument) -> Vec<&'d Fixture> {
        let mut fixtures: Vec<&Fixture> = self
            .fixtures
            .iter()
            .filter_map(|name| doc.fixtures.get(name))
            .collect();
        fixtures.sort_by_key(|f| f.address);
        fixtures
    }

    /// Merges one fixture's colour into `frame` with `max`.
    fn apply_pixel(&self, frame: &mut DmxFrame, fixture: &Fixture, (r, g, b): (u8, u8, u8), dim: u8) {
        for (ch, role) in fixture.channels() {
            let level = match role {
                Role::Red => r as i32,
                Role::Green => g as i32,
                Role::Blue => b as i32,
                Role::White => (r as i32 + g as i32 + b as i32 - WHITE_KNEE).max(0),
                Role::Dimmer => dim as i32,
                _ => 0,
            };
            let scaled = (level as f32 * self.intensity).clamp(0.0, 255.0) as u8;
            frame.merge_max(ch as usize, scaled);
        }
    }

    fn render(&mut self, fixtures: &[&Fixture], audio: &AudioSnapshot, frame: &mut DmxFrame) {
        let gate = self.threshold * 255.0;
        match self.algorithm {
            Algorithm::SpectralSplit => {
                let bands = audio.bands.map(f32::from);
                self.signal = bands.iter().sum::<f32>() / 3.0;
                let count = fixtures.len() as f32;
                for (i, fixture) in fixtures.iter().enumerate() {
                    let position = i as f32 / count;
                    let (band, colour) = if position < 0.33 {
                        (bands[0], (255, 0, 0))
                    } else if position < 0.66 {
                        (bands[1], (0, 255, 0))
                    } else {
                        (bands[2], (0, 0, 255))
                    };
                    let dim = if band < gate { 0.0 } else { band };
                    self.apply_pixel(frame, fixture, colour, dim as u8);
                }
            }
            Algorithm::PercussiveFlash => {
                self.signal = if audio.snare { 255.0 } else { 0.0 };
                let high = audio.high() as f32 / 255.0;
                let gated = self.threshold > FLASH_GATE && high < self.threshold;
                if audio.snare && !gated {
                    self.flash = 255.0;
                } else {
                    self.flash *= FLASH_RELEASE;
                }
                if self.flash < FLASH_FLOOR {
                    return;
                }
                let dim = self.flash as u8;
                for fixture in fixtures {
                    self.apply_pixel(frame, fixture, (255, 255, 255), dim);
                }
            }
            Algorithm::TravelingWave => {
                let bass = audio.bass() as f32 / 255.0;
                self.signal = audio.bass() as f32;
                let brightness = if bass < self.threshold {
                    WAVE_IDLE_BRIGHTNESS
                } else {
                    1.0
                };
                self.phase = (self.phase + WAVE_BASE_STEP + bass * WAVE_BASS_STEP) % TAU;
                let count = fixtures.len() as f32;
                for (i, fixture) in fixtures.iter().enumerate() {
                    let position = i as f32 / count;
                    let wave = ((self.phase - position * WAVE_SPREAD).sin() + 1.0) / 2.0;
                    let colour = if wave > 0.8 && bass > self.threshold {
                        (255, 50, 0)
                    } else {
                        ((100.0 * wave) as u8, 0, 200)
                    };
                    let dim = (wave * 255.0 * brightness) as u8;
                    self.apply_pixel(frame, fixture, colour, dim);
                }
            }
            Algorithm::SmoothedSpotlight => {
                let mid = audio.mid() as f32;
                self.signal = mid;
                let target = if mid > gate { mid } else { 0.0 };
                let level = self.envelope.update(target);
                if level < SPOT_FLOOR {
                    return;
                }
                self.hue = (self.hue + SPOT_HUE_STEP) % 1.0;
                let (r, g, b) = hsv_to_rgb(self.hue, 0.9, 1.0);
                let colour = ((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8);
                for fixture in fixtures {
                    self.apply_pixel(frame, fixture, colour, level as u8);
                }
            }
        }
    }
}

/// The running set of generative effects.
#[derive(Debug, Default)]
pub struct EffectEngine {
    effects: BTreeMap<EffectId, GenerativeEffect>,
    next_id: u32,
    owned_last_tick: BTreeSet<u16>,
}

impl EffectEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, algorithm: Algorithm, fixtures: Vec<String>) -> Result<EffectId> {
        if fixtures.is_empty() {
            return Err(Error::NothingSelected("fixtures"));
        }
        let id = EffectId(self.next_id);
        self.next_id += 1;
        info!(%id, %algorithm, fixtures = fixtures.len(), "effect added");
        self.effects
            .insert(id, GenerativeEffect::new(algorithm, fixtures));
        Ok(id)
    }

    pub fn remove(&mut self, id: EffectId) -> bool {
        let removed = self.effects.remove(&id).is_some();
        if removed {
            info!(%id, "effect removed");
        }
        removed
    }

    /// Changes threshold, intensity or active flag of a running effect in place.
    pub fn configure(&mut self, id: EffectId, params: EffectParams) -> Result<()> {
        let effect = self.effects.get_mut(&id).ok_or_else(|| Error::UnknownItem {
            kind: "effect",
            name: id.to_string(),
        })?;
        if let Some(threshold) = params.threshold {
            effect.threshold = threshold.clamp(0.0, 1.0);
        }
        if let Some(intensity) = params.intensity {
            effect.intensity = intensity.max(0.0);
        }
        if let Some(active) = params.active {
            effect.active = active;
        }
        debug!(%id, ?params, "effect configured");
        Ok(())
    }

    pub fn get(&self, id: EffectId) -> Option<&GenerativeEffect> {
        self.effects.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EffectId, &GenerativeEffect)> {
        self.effects.iter().map(|(id, fx)| (*id, fx))
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn clear(&mut self) {
        self.effects.clear();
    }

    /// Renders one frame of every active effect into Live.
    pub fn tick(&mut self, doc: &ShowDocument, audio: &AudioSnapshot, universe: &Universe) {
        let mut render = DmxFrame::new();
        let mut owned = BTreeSet::new();
        for effect in self.effects.values_mut().filter(|fx| fx.active) {
            let fixtures = effect.resolve(doc);
            owned.extend(fixtures.iter().flat_map(|f| f.footprint()));
            effect.render(&fixtures, audio, &mut render);
        }
        if owned.is_empty() && self.owned_last_tick.is_empty() {
            return;
        }
        let touched: Vec<u16> = owned.union(&self.owned_last_tick).copied().collect();
        universe.update(Layer::Live, |frame| {
            for ch in &touched {
                frame.set(*ch as usize, render.get(*ch as usize));
            }
        });
        self.owned_last_tick = owned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rig(count: u16) -> (ShowDocument, Universe) {
        let mut doc = ShowDocument::default();
        for i in 0..count {
            doc.create_fixture(
                &format!("par{}", i + 1),
                Fixture::new(
                    1 + i * 4,
                    vec![Role::Dimmer, Role::Red, Role::Green, Role::Blue],
                ),
            );
        }
        (doc, Universe::new())
    }

    fn names(count: u16) -> Vec<String> {
        (1..=count).map(|i| format!("par{i}")).collect()
    }

    fn live(universe: &Universe, ch: usize) -> u8 {
        universe.level(Layer::Live, ch)
    }

    #[test]
    fn hsv_primaries() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), (1.0, 0.0, 0.0));
        let (r, g, b) = hsv_to_rgb(1.0 / 3.0, 1.0, 1.0);
        assert!(r.abs() < 1e-5 && (g - 1.0).abs() < 1e-5 && b.abs() < 1e-5);
        assert_eq!(hsv_to_rgb(0.5, 0.0, 0.4), (0.4, 0.4, 0.4));
    }

    #[test]
    fn algorithm_names() {
        assert_eq!("spectral".parse::<Algorithm>().unwrap(), Algorithm::SpectralSplit);
        assert_eq!("Bass Wave".parse::<Algorithm>().unwrap(), Algorithm::TravelingWave);
        assert_eq!(Algorithm::PercussiveFlash.to_string(), "Percussive Flash");
    }

    #[test]
    fn spectral_split_gates_each_third() {
        let (doc, universe) = rig(3);
        let mut fx = EffectEngine::new();
        fx.add(Algorithm::SpectralSplit, names(3)).unwrap();
        let audio = AudioSnapshot {
            bands: [200, 100, 50],
            ..AudioSnapshot::default()
        };
        fx.tick(&doc, &audio, &universe);

        assert_eq!(live(&universe, 1), 200);
        assert_eq!(live(&universe, 2), 255);
        assert_eq!(live(&universe, 3), 0);
        assert_eq!(live(&universe, 5), 100);
        assert_eq!(live(&universe, 7), 255);
        // high band 50 is below 0.2 * 255
        assert_eq!(live(&universe, 9), 0);
        assert_eq!(live(&universe, 12), 255);
    }

    #[test]
    fn flash_fires_on_snare_and_releases() {
        let (mut doc, universe) = rig(1);
        doc.create_fixture("strip", Fixture::new(20, vec![Role::White, Role::Strobe]));
        let mut fx = EffectEngine::new();
        fx.add(Algorithm::PercussiveFlash, vec!["par1".into(), "strip".into()])
            .unwrap();

        let hit = AudioSnapshot {
            snare: true,
            ..AudioSnapshot::default()
        };
        fx.tick(&doc, &hit, &universe);
        assert_eq!(live(&universe, 1), 255);
        assert_eq!(live(&universe, 2), 255);
        assert_eq!(live(&universe, 20), 255);
        assert_eq!(live(&universe, 21), 0);

        fx.tick(&doc, &AudioSnapshot::default(), &universe);
        assert_eq!(live(&universe, 1), 191);

        for _ in 0..20 {
            fx.tick(&doc, &AudioSnapshot::default(), &universe);
        }
        assert!(universe.snapshot(Layer::Live).is_dark());
    }

    #[test]
    fn high_threshold_requires_high_energy_for_flash() {
        let (doc, universe) = rig(1);
        let mut fx = EffectEngine::new();
        let id = fx.add(Algorithm::PercussiveFlash, names(1)).unwrap();
        fx.configure(
            id,
            EffectParams {
                threshold: Some(0.8),
                ..EffectParams::default()
            },
        )
        .unwrap();
        let quiet_hit = AudioSnapshot {
            snare: true,
            bands: [0, 0, 100],
            ..AudioSnapshot::default()
        };
        fx.tick(&doc, &quiet_hit, &universe);
        assert_eq!(live(&universe, 1), 0);
        assert_eq!(fx.get(id).unwrap().signal(), 255.0);
    }

    #[test]
    fn muted_effect_goes_dark_and_leaves_other_channels_alone() {
        let (doc, universe) = rig(2);
        universe.write(Layer::Live, 100, 42).unwrap();
        let mut fx = EffectEngine::new();
        let id = fx.add(Algorithm::SpectralSplit, names(2)).unwrap();
        let loud = AudioSnapshot {
            bands: [255, 255, 255],
            ..AudioSnapshot::default()
        };
        fx.tick(&doc, &loud, &universe);
        assert_eq!(live(&universe, 1), 255);

        fx.configure(
            id,
            EffectParams {
                active: Some(false),
                ..EffectParams::default()
            },
        )
        .unwrap();
        fx.tick(&doc, &loud, &universe);
        assert_eq!(live(&universe, 1), 0);
        assert_eq!(live(&universe, 2), 0);
        assert_eq!(live(&universe, 100), 42);
    }

    #[test]
    fn overlapping_effects_merge_highest() {
        let (doc, universe) = rig(1);
        let mut fx = EffectEngine::new();
        let dim = fx.add(Algorithm::SpectralSplit, names(1)).unwrap();
        fx.add(Algorithm::SpectralSplit, names(1)).unwrap();
        fx.configure(
            dim,
            EffectParams {
                intensity: Some(0.5),
                ..EffectParams::default()
            },
        )
        .unwrap();
        let audio = AudioSnapshot {
            bands: [200, 0, 0],
            ..AudioSnapshot::default()
        };
        fx.tick(&doc, &audio, &universe);
        assert_eq!(live(&universe, 1), 200);
    }

    #[test]
    fn wave_idles_dim_below_threshold() {
        let (doc, universe) = rig(4);
        let mut fx = EffectEngine::new();
        let id = fx.add(Algorithm::TravelingWave, names(4)).unwrap();
        fx.tick(&doc, &AudioSnapshot::default(), &universe);
        let frame = universe.snapshot(Layer::Live);
        for fixture in 0..4 {
            let dim = frame.get(1 + fixture * 4);
            assert!(dim <= 26, "idle wave too bright: {dim}");
            assert_eq!(frame.get(4 + fixture * 4), 200);
        }
        let phase = fx.get(id).unwrap().phase;
        assert!((phase - WAVE_BASE_STEP).abs() < 1e-6);
    }

    #[test]
    fn spotlight_needs_mid_above_threshold() {
        let (doc, universe) = rig(1);
        let mut fx = EffectEngine::new();
        fx.add(Algorithm::SmoothedSpotlight, names(1)).unwrap();
        let soft = AudioSnapshot {
            bands: [0, 40, 0],
            ..AudioSnapshot::default()
        };
        fx.tick(&doc, &soft, &universe);
        assert_eq!(live(&universe, 1), 0);

        let loud = AudioSnapshot {
            bands: [0, 200, 0],
            ..AudioSnapshot::default()
        };
        fx.tick(&doc, &loud, &universe);
        // attack 0.3 of 200
        assert_eq!(live(&universe, 1), 60);
        assert!(live(&universe, 2) > 0);
    }

    #[test]
    fn empty_target_list_is_rejected() {
        let mut fx = EffectEngine::new();
        assert!(matches!(
            fx.add(Algorithm::TravelingWave, Vec::new()),
            Err(Error::NothingSelected(_))
        ));
        assert!(fx.configure(EffectId(9), EffectParams::default()).is_err());
    }
}
