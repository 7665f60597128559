//! Parameterized patches with idempotent re-application.
//!
//! Each variant knows two transformations. When a file does not carry the
//! patch marker yet, the original edit is made near a known anchor and the
//! marker is appended as a trailing `//` comment. When the marker is already
//! present, the previously inserted line is found again by a regex that
//! matches the anchor syntax, the old numeric value and the literal marker,
//! and only the value is rewritten. Running the same patch twice with
//! different values therefore leaves exactly one marked line.

use super::Transform;
use crate::marker::Marker;
use crate::vpath;
use regex::{Captures, NoExpand, Regex};
use std::borrow::Cow;
use std::ops::RangeInclusive;

pub const MULTIPLIER_RANGE: RangeInclusive<f64> = 1.0..=2.0;
pub const GAMMA_RANGE: RangeInclusive<f64> = 1.4..=2.6;
pub const ZOOM_RANGE: RangeInclusive<u32> = 1..=3;
pub const LIGHT_RANGE: RangeInclusive<f64> = 0.0..=1.0;

const HDR_ANCHOR: &str = "return colour * hdr_scale;";
const SDR_ANCHOR: &str = "return float4(linCol.xyz * sdr_scale, linCol.w);";
const ZOOM_CALL: &str = "CreateCameraZoomNode";
const GI_ANCHOR: &str = "float3 global_illumination = ComputeGlobalIllumination(surface);";

fn clamp_f64(value: f64, range: &RangeInclusive<f64>) -> f64 {
    if value.is_nan() {
        return *range.start();
    }
    value.clamp(*range.start(), *range.end())
}

/// Typed parameters of a specialized patch, clamped on construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Specialized {
    /// HDR brightness boost inserted ahead of the tonemap return.
    Brightness { multiplier: f64 },
    /// Scale applied to the SDR output path.
    SdrScale { multiplier: f64 },
    /// Output gamma divisor.
    Gamma { gamma: f64 },
    /// Camera zoom node injected into the character object.
    CameraZoom { zoom_level: u32 },
    /// Comments out continuous particle effects.
    EnvParticles,
    /// Replaces the global illumination pass with fixed light weights.
    GlobalIllumination { env_light: f64, indirect_light: f64 },
}

impl Specialized {
    pub fn brightness(multiplier: f64) -> Self {
        Specialized::Brightness {
            multiplier: clamp_f64(multiplier, &MULTIPLIER_RANGE),
        }
    }

    pub fn sdr_scale(multiplier: f64) -> Self {
        Specialized::SdrScale {
            multiplier: clamp_f64(multiplier, &MULTIPLIER_RANGE),
        }
    }

    pub fn gamma(gamma: f64) -> Self {
        Specialized::Gamma {
            gamma: clamp_f64(gamma, &GAMMA_RANGE),
        }
    }

    pub fn camera_zoom(zoom_level: u32) -> Self {
        Specialized::CameraZoom {
            zoom_level: zoom_level.clamp(*ZOOM_RANGE.start(), *ZOOM_RANGE.end()),
        }
    }

    pub fn global_illumination(env_light: f64, indirect_light: f64) -> Self {
        Specialized::GlobalIllumination {
            env_light: clamp_f64(env_light, &LIGHT_RANGE),
            indirect_light: clamp_f64(indirect_light, &LIGHT_RANGE),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Specialized::Brightness { .. } => "brightness",
            Specialized::SdrScale { .. } => "sdr-scale",
            Specialized::Gamma { .. } => "gamma",
            Specialized::CameraZoom { .. } => "camera-zoom",
            Specialized::EnvParticles => "env-particles",
            Specialized::GlobalIllumination { .. } => "global-illumination",
        }
    }

    /// The numeric parameter, if the variant has one.
    pub fn value(&self) -> Option<f64> {
        match *self {
            Specialized::Brightness { multiplier } | Specialized::SdrScale { multiplier } => {
                Some(multiplier)
            }
            Specialized::Gamma { gamma } => Some(gamma),
            Specialized::CameraZoom { zoom_level } => Some(f64::from(zoom_level)),
            Specialized::GlobalIllumination { env_light, .. } => Some(env_light),
            Specialized::EnvParticles => None,
        }
    }

    /// Whether the variant cannot work without a nominated marker file.
    pub fn requires_marker_file(&self) -> bool {
        matches!(self, Specialized::CameraZoom { .. })
    }
}

#[derive(Debug, Clone)]
enum Logic {
    Brightness {
        multiplier: f64,
        existing: Regex,
    },
    SdrScale {
        multiplier: f64,
        existing: Regex,
    },
    Gamma {
        gamma: f64,
        pattern: Regex,
        applied: Regex,
    },
    CameraZoom {
        zoom_level: u32,
        marker_line: Regex,
        otc_marked: Regex,
        otc_original: Regex,
    },
    EnvParticles {
        effect: Regex,
    },
    GlobalIllumination {
        env_light: f64,
        indirect_light: f64,
        existing: Regex,
    },
}

/// A [`Specialized`] variant bound to its marker, with regexes compiled.
#[derive(Debug, Clone)]
pub struct SpecializedPatch {
    marker: Marker,
    marker_file: Option<String>,
    logic: Logic,
}

impl SpecializedPatch {
    pub fn new(
        params: Specialized,
        marker: Marker,
        marker_file: Option<String>,
    ) -> Result<Self, regex::Error> {
        let m = marker.escaped();
        let logic = match params {
            Specialized::Brightness { multiplier } => Logic::Brightness {
                multiplier,
                existing: Regex::new(&format!(r"colour\.rgb \*= ([\d\.,]+)f; //\s*{m}"))?,
            },
            Specialized::SdrScale { multiplier } => Logic::SdrScale {
                multiplier,
                existing: Regex::new(&format!(
                    r"return float4\(linCol\.xyz \* sdr_scale \* ([\d\.]+)f, linCol\.w\); //{m}"
                ))?,
            },
            Specialized::Gamma { gamma } => Logic::Gamma {
                gamma,
                pattern: Regex::new(&format!(r"float m = 1\.0f / ([\d\.]+)f;(\s*//{m})?"))?,
                applied: Regex::new(&format!(r"float m = 1\.0f / ([\d\.]+)f;\s*//{m}"))?,
            },
            Specialized::CameraZoom { zoom_level } => Logic::CameraZoom {
                zoom_level,
                marker_line: Regex::new(&format!(
                    r#"on_initial_position_set\s*=\s*"CreateCameraZoomNode\s*\(\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*\)\s*;"\s*//{m}"#
                ))?,
                otc_marked: Regex::new(&format!(
                    r"CreateCameraZoomNode\s*\(\s*1\s*,\s*1\s*,\s*(\d+)\s*\)\s*;\s*//{m}"
                ))?,
                otc_original: Regex::new(
                    r"CreateCameraZoomNode\s*\(\s*(\d+(?:\.\d+)?)\s*,\s*(\d+(?:\.\d+)?)\s*,\s*(\d+(?:\.\d+)?)\s*\)\s*;",
                )?,
            },
            Specialized::EnvParticles => Logic::EnvParticles {
                effect: Regex::new(&format!(
                    r#"(\s*)(//{m}\s*)?(continuous_effect\s*=\s*"[^"]*")"#
                ))?,
            },
            Specialized::GlobalIllumination {
                env_light,
                indirect_light,
            } => Logic::GlobalIllumination {
                env_light,
                indirect_light,
                existing: Regex::new(&format!(
                    r"float3 global_illumination = surface\.albedo \* \(env_colour \* ([\d\.]+)f \+ indirect_colour \* ([\d\.]+)f\); //{m}"
                ))?,
            },
        };
        Ok(Self {
            marker,
            marker_file,
            logic,
        })
    }

    pub fn params(&self) -> Specialized {
        match &self.logic {
            Logic::Brightness { multiplier, .. } => Specialized::Brightness {
                multiplier: *multiplier,
            },
            Logic::SdrScale { multiplier, .. } => Specialized::SdrScale {
                multiplier: *multiplier,
            },
            Logic::Gamma { gamma, .. } => Specialized::Gamma { gamma: *gamma },
            Logic::CameraZoom { zoom_level, .. } => Specialized::CameraZoom {
                zoom_level: *zoom_level,
            },
            Logic::EnvParticles { .. } => Specialized::EnvParticles,
            Logic::GlobalIllumination {
                env_light,
                indirect_light,
                ..
            } => Specialized::GlobalIllumination {
                env_light: *env_light,
                indirect_light: *indirect_light,
            },
        }
    }

    pub fn transform(&self, path: &str, text: &str) -> Transform {
        let marker = self.marker.as_str();
        let has_marker = self.marker.is_in(text);
        match &self.logic {
            Logic::Brightness {
                multiplier,
                existing,
            } => {
                let line = format!("colour.rgb *= {multiplier:.2}f; //{marker}");
                if has_marker {
                    return replace_existing(existing, text, &line);
                }
                if !text.contains(HDR_ANCHOR) {
                    return Transform::Unchanged;
                }
                Transform::Changed(text.replace(HDR_ANCHOR, &format!("{line}\r\n\t{HDR_ANCHOR}")))
            }
            Logic::SdrScale {
                multiplier,
                existing,
            } => {
                let line = format!(
                    "return float4(linCol.xyz * sdr_scale * {multiplier:.2}f, linCol.w); //{marker}"
                );
                if has_marker {
                    return replace_existing(existing, text, &line);
                }
                if !text.contains(SDR_ANCHOR) {
                    return Transform::Unchanged;
                }
                Transform::Changed(text.replace(SDR_ANCHOR, &line))
            }
            Logic::Gamma { gamma, pattern, .. } => {
                let line = format!("float m = 1.0f / {gamma:.1}f; //{marker}");
                if !pattern.is_match(text) {
                    return if has_marker {
                        Transform::NoMatch
                    } else {
                        Transform::Unchanged
                    };
                }
                Transform::from_edit(text, pattern.replace_all(text, NoExpand(&line)))
            }
            Logic::CameraZoom {
                zoom_level,
                marker_line,
                otc_marked,
                otc_original,
            } => {
                let is_marker_file = self
                    .marker_file
                    .as_deref()
                    .is_some_and(|file| vpath::eq(file, path));
                if is_marker_file {
                    let line = format!(
                        "on_initial_position_set = \"{ZOOM_CALL}(1000000, 1000000, {zoom_level});\" //{marker}"
                    );
                    if has_marker {
                        return replace_existing(marker_line, text, &line);
                    }
                    return match insert_in_positioned(text, &line) {
                        Some(updated) => Transform::Changed(updated),
                        None => Transform::Unchanged,
                    };
                }

                if vpath::extension(path).as_deref() != Some(".otc") || !text.contains(ZOOM_CALL) {
                    return Transform::Unchanged;
                }
                let line = format!("{ZOOM_CALL}(1, 1, {zoom_level});//{marker}");
                if has_marker {
                    return replace_existing(otc_marked, text, &line);
                }
                Transform::from_edit(text, otc_original.replace_all(text, NoExpand(&line)))
            }
            Logic::EnvParticles { effect } => {
                if !text.to_ascii_lowercase().contains("continuous_effect") {
                    return Transform::Unchanged;
                }
                let edited = effect.replace_all(text, |caps: &Captures<'_>| {
                    if caps.get(2).is_some() {
                        return caps[0].to_string();
                    }
                    format!("{}//{marker} {}", &caps[1], &caps[3])
                });
                Transform::from_edit(text, edited)
            }
            Logic::GlobalIllumination {
                env_light,
                indirect_light,
                existing,
            } => {
                // Marked files only take the value rewrite, unmarked ones only
                // the anchor replacement.
                let line = format!(
                    "float3 global_illumination = surface.albedo * (env_colour * {env_light:.2}f + indirect_colour * {indirect_light:.2}f); //{marker}"
                );
                if has_marker {
                    return replace_existing(existing, text, &line);
                }
                if !text.contains(GI_ANCHOR) {
                    return Transform::Unchanged;
                }
                Transform::Changed(text.replace(GI_ANCHOR, &line))
            }
        }
    }

    /// Currently applied parameter, read back from a marked line.
    pub fn probe(&self, text: &str) -> Option<f64> {
        let (re, group) = match &self.logic {
            Logic::Brightness { existing, .. } | Logic::SdrScale { existing, .. } => (existing, 1),
            Logic::Gamma { applied, .. } => (applied, 1),
            Logic::CameraZoom { marker_line, .. } => (marker_line, 3),
            Logic::GlobalIllumination { existing, .. } => (existing, 1),
            Logic::EnvParticles { .. } => return None,
        };
        let caps = re.captures(text)?;
        caps.get(group)?.as_str().replace(',', ".").parse().ok()
    }
}

fn replace_existing(re: &Regex, text: &str, line: &str) -> Transform {
    if !re.is_match(text) {
        return Transform::NoMatch;
    }
    Transform::from_edit(text, re.replace_all(text, NoExpand(line)))
}

/// Insert `line` on its own line just before the closing brace of the first
/// `Positioned` block, indented one step deeper than that brace.
fn insert_in_positioned(text: &str, line: &str) -> Option<String> {
    let start = text.to_ascii_lowercase().find("positioned")?;
    let open = start + text[start..].find('{')?;

    let mut depth = 1usize;
    let mut close = None;
    for (offset, byte) in text.as_bytes()[open + 1..].iter().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + 1 + offset);
                    break;
                }
            }
            _ => {}
        }
    }
    let close = close?;

    let mut indentation = Cow::Borrowed("\t");
    if let Some(newline) = text[..close].rfind('\n') {
        let closing_indent = &text[newline + 1..close];
        if closing_indent.chars().all(char::is_whitespace) {
            let step = if closing_indent.is_empty() || closing_indent.contains('\t') {
                "\t"
            } else {
                "    "
            };
            indentation = Cow::Owned(format!("{closing_indent}{step}"));
        }
    }

    let mut out = String::with_capacity(text.len() + line.len() + 8);
    out.push_str(&text[..close]);
    out.push_str("\r\n");
    out.push_str(&indentation);
    out.push_str(line);
    out.push_str(&text[close..]);
    Some(out)
}
