//! Chase generator. Renders a pattern over a fixture list into hidden scenes and a chase
//! that steps through them.

use std::f32::consts::TAU;

use strum::{Display, EnumIter, EnumString};
use tracing::info;

use crate::effects::hsv_to_rgb;
use crate::error::{Error, Result};
use crate::show::{Fixture, Role, Scene, ShowDocument};

/// Prefix of generated step scenes.
pub const FX_SCENE_PREFIX: &str = "__fx_";

/// Per unit of distance from the scanner head.
const SCANNER_FALLOFF: f32 = 150.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum Pattern {
    /// Hue wheel, one full turn per cycle
    #[strum(to_string = "Rainbow")]
    Rainbow,
    /// Soft up/down fade of dimmer and colour
    #[strum(to_string = "Sine Wave", serialize = "sine")]
    SineWave,
    /// Hard on/off square wave
    #[strum(to_string = "Dimmer Chase", serialize = "dimmer")]
    DimmerChase,
    /// Red/blue alternation
    #[strum(to_string = "Police")]
    Police,
    /// Red scanner bouncing across the fixtures
    #[strum(to_string = "Knight Rider", serialize = "scanner")]
    KnightRider,
}

fn level(v: f32) -> u8 {
    (v * 255.0).clamp(0.0, 255.0) as u8
}

/// Renders `steps` scenes of `pattern`. `spread` (percent) offsets each fixture's phase
/// across the list.
pub fn generate_steps(fixtures: &[&Fixture], pattern: Pattern, steps: usize, spread: f32) -> Vec<Scene> {
    let count = fixtures.len();
    if count == 0 {
        return Vec::new();
    }
    (0..steps)
        .map(|step| {
            let t = step as f32 / steps as f32;
            let mut scene = Scene::default();
            for (index, fixture) in fixtures.iter().enumerate() {
                let phase = if count > 1 {
                    index as f32 / (count - 1) as f32 * spread / 100.0
                } else {
                    0.0
                };
                let wave = ((TAU * (t - phase)).sin() + 1.0) / 2.0;
                for (ch, role) in fixture.channels() {
                    if let Some(v) = pattern_level(pattern, role, t, phase, wave, index, count) {
                        scene.levels.insert(ch, v);
                    }
                }
            }
            scene
        })
        .collect()
}

fn pattern_level(
    pattern: Pattern,
    role: Role,
    t: f32,
    phase: f32,
    wave: f32,
    index: usize,
    count: usize,
) -> Option<u8> {
    match pattern {
        Pattern::Rainbow => {
            let (r, g, b) = hsv_to_rgb((t + phase) % 1.0, 1.0, 1.0);
            match role {
                Role::Red => Some(level(r)),
                Role::Green => Some(level(g)),
                Role::Blue => Some(level(b)),
                Role::Dimmer => Some(255),
                _ => None,
            }
        }
        Pattern::SineWave => match role {
            Role::Dimmer | Role::Red | Role::Green | Role::Blue | Role::White => Some(level(wave)),
            _ => None,
        },
        Pattern::DimmerChase => match role {
            Role::Dimmer | Role::Red | Role::Green | Role::Blue => {
                Some(if wave > 0.5 { 255 } else { 0 })
            }
            _ => None,
        },
        Pattern::Police => {
            let red = wave > 0.5;
            match role {
                Role::Red => Some(if red { 255 } else { 0 }),
                Role::Blue => Some(if red { 0 } else { 255 }),
                Role::Green => Some(0),
                Role::Dimmer => Some(255),
                _ => None,
            }
        }
        Pattern::KnightRider => {
            let ping_pong = 1.0 - ((t * 2.0) % 2.0 - 1.0).abs();
            let head = ping_pong * (count - 1) as f32;
            let distance = (head - index as f32).abs();
            let v = (255 - (distance * SCANNER_FALLOFF) as i32).max(0) as u8;
            match role {
                Role::Red => Some(v),
                Role::Green | Role::Blue => Some(0),
                Role::Dimmer => Some(255),
                _ => None,
            }
        }
    }
}

/// Settings for one generated chase.
#[derive(Clone, Debug, PartialEq)]
pub struct FxChaseSpec {
    pub pattern: Pattern,
    pub steps: usize,
    pub hold_ms: u64,
    /// Phase spread across the fixture list, 0-100
    pub spread: f32,
}

fn is_step_of(scene: &str, chase: &str) -> bool {
    scene
        .strip_prefix(FX_SCENE_PREFIX)
        .and_then(|rest| rest.strip_prefix(chase))
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Generates step scenes `__fx_<chase>_<n>` and chase `chase` over them with
/// `fade = hold * 0.8`. Step scenes from an earlier generation of the same chase are replaced.
pub fn create_fx_chase<'a>(
    doc: &mut ShowDocument,
    chase: &str,
    fixtures: impl IntoIterator<Item = &'a str>,
    spec: &FxChaseSpec,
) -> Result<Vec<String>> {
    let targets: Vec<Fixture> = fixtures
        .into_iter()
        .filter_map(|name| doc.fixtures.get(name).cloned())
        .collect();
    if targets.is_empty() {
        return Err(Error::NothingSelected("fixtures"));
    }
    let refs: Vec<&Fixture> = targets.iter().collect();
    let scenes = generate_steps(&refs, spec.pattern, spec.steps.max(1), spec.spread);

    doc.scenes.retain(|name, _| !is_step_of(name, chase));
    let names: Vec<String> = scenes
        .into_iter()
        .enumerate()
        .map(|(i, scene)| {
            let name = format!("{FX_SCENE_PREFIX}{chase}_{}", i + 1);
            doc.scenes.insert(name.clone(), scene);
            name
        })
        .collect();
    let fade_ms = spec.hold_ms * 4 / 5;
    doc.create_chase(chase, names.clone(), spec.hold_ms, fade_ms);
    info!(%chase, pattern = %spec.pattern, steps = names.len(), "fx chase generated");
    Ok(names)
}
