//! Parameter registry: every option a generation request understands, with
//! its declared kind, default and constraints. Validation clamps numerics to
//! their range and coerces strings to the allow-list, falling back to the
//! declared default rather than failing.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const PROMPT: &str = "prompt";
pub const NEG_PROMPT: &str = "negative_prompt";
pub const PREFIX: &str = "prefix";
pub const NEG_PREFIX: &str = "neg_prefix";
pub const STEPS: &str = "steps";
pub const CFG: &str = "cfg";
pub const SAMPLER: &str = "sampler";
pub const SEED: &str = "seed";
pub const WIDTH: &str = "width";
pub const HEIGHT: &str = "height";
pub const VAE: &str = "vae";
pub const MODEL: &str = "model";
pub const REFINER: &str = "refiner";
pub const REFINER_SWITCH_AT: &str = "refiner_switch_at";
pub const SCALE: &str = "scale";
pub const DENOISING_STR: &str = "denoising_strength";
pub const HIGHRES_STEPS: &str = "highres_steps";
pub const UPSCALER: &str = "upscaler";
pub const AUTOSIZE: &str = "autosize";
pub const AUTOSIZE_MAXSIZE: &str = "autosize_maxsize";
pub const DENOISING_STR_IMG2IMG: &str = "denoising_strength_img2img";
pub const RESIZE_MODE: &str = "resize_mode";
pub const RESIZE_SCALE: &str = "resize_scale";
pub const BATCH_SIZE: &str = "batch_size";

/// Key carried through the ack codec for img2img sources. Not a declared
/// parameter: it has no default and passes through validation untouched.
pub const IMAGE_URL: &str = "image_url";

pub const SEED_MAX: i64 = 4_294_967_294;

/// Refiner value meaning "no refiner pass".
pub const REFINER_NONE: &str = "None";

const SAMPLERS: &[&str] = &[
    "Euler a",
    "Euler",
    "LMS",
    "Heun",
    "DPM2",
    "DPM2 a",
    "DPM++ 2S a",
    "DPM++ 2M",
    "DPM++ SDE",
    "DPM fast",
    "DPM adaptive",
    "LMS Karras",
    "DPM2 Karras",
    "DPM2 a Karras",
    "DPM++ 2S a Karras",
    "DPM++ 2M Karras",
    "DPM++ SDE Karras",
    "DDIM",
    "PLMS",
];

pub const UPSCALER_LATENT: &str = "Latent";

const UPSCALERS: &[&str] = &["Latent", "R-ESRGAN 4x+", "R-ESRGAN 4x+ Anime6B"];

/// Backend resize modes, in wire order (the sdapi takes the index).
pub const RESIZE_MODES: &[&str] = &[
    "Just resize",
    "Crop and resize",
    "Resize and fill",
    "Just resize (latent upscale)",
];

/// A single parameter value. Numeric kinds are normalized during validation
/// (an integer handed to a float parameter becomes `Float`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Str(v) => write!(f, "{v}"),
        }
    }
}

/// An ordered name → value map, the unit the codec and validation work on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    values: BTreeMap<String, ParamValue>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.values.remove(name)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(ParamValue::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(ParamValue::as_f64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(ParamValue::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(ParamValue::as_bool)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Declared kind and constraints of one parameter.
#[derive(Debug, Clone)]
pub enum ParamKind {
    Int { default: i64, min: i64, max: i64 },
    Float { default: f64, min: f64, max: f64 },
    /// Free-form string, no allow-list.
    Text { default: String },
    /// String restricted to an allow-list.
    Enum { default: String, values: Vec<String> },
    Bool { default: bool },
}

impl ParamKind {
    pub fn default_value(&self) -> ParamValue {
        match self {
            ParamKind::Int { default, .. } => ParamValue::Int(*default),
            ParamKind::Float { default, .. } => ParamValue::Float(*default),
            ParamKind::Text { default } => ParamValue::Str(default.clone()),
            ParamKind::Enum { default, .. } => ParamValue::Str(default.clone()),
            ParamKind::Bool { default } => ParamValue::Bool(*default),
        }
    }

    /// Clamp/coerce a raw value to this kind. Strings parse into numerics
    /// where possible; anything unusable falls back to the default.
    pub fn validate(&self, value: &ParamValue) -> ParamValue {
        match self {
            ParamKind::Int { default, min, max } => {
                let v = match value {
                    ParamValue::Str(s) => s.trim().parse::<i64>().unwrap_or(*default),
                    other => other.as_i64().unwrap_or(*default),
                };
                ParamValue::Int(v.clamp(*min, *max))
            }
            ParamKind::Float { default, min, max } => {
                let v = match value {
                    ParamValue::Str(s) => s.trim().parse::<f64>().unwrap_or(*default),
                    other => other.as_f64().unwrap_or(*default),
                };
                ParamValue::Float(v.clamp(*min, *max))
            }
            ParamKind::Text { default } => match value {
                ParamValue::Str(s) => ParamValue::Str(s.clone()),
                _ => ParamValue::Str(default.clone()),
            },
            ParamKind::Enum { default, values } => match value {
                ParamValue::Str(s) if values.iter().any(|v| v == s) => ParamValue::Str(s.clone()),
                _ => ParamValue::Str(default.clone()),
            },
            ParamKind::Bool { default } => match value {
                ParamValue::Bool(b) => ParamValue::Bool(*b),
                ParamValue::Str(s) => {
                    let s = s.trim().to_ascii_lowercase();
                    ParamValue::Bool(!matches!(s.as_str(), "false" | "no"))
                }
                _ => ParamValue::Bool(*default),
            },
        }
    }
}

/// VRAM ceilings used by [`max_batch_size`], in pixels of latent/image area
/// a single batch may occupy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PixelCeilings {
    #[serde(default = "default_latent_budget")]
    pub max_pixel_count_latent: u64,
    #[serde(default = "default_esrgan_budget")]
    pub max_pixel_count_esrgan: u64,
}

fn default_latent_budget() -> u64 {
    2_097_152
}

fn default_esrgan_budget() -> u64 {
    1_048_576
}

impl Default for PixelCeilings {
    fn default() -> Self {
        Self {
            max_pixel_count_latent: default_latent_budget(),
            max_pixel_count_esrgan: default_esrgan_budget(),
        }
    }
}

/// Largest batch the backend can fit for the given output geometry: at most
/// four images, shrinking as the upscaled pixel count grows.
pub fn max_batch_size(width: u32, height: u32, scale: f64, upscaler: &str, ceilings: &PixelCeilings) -> u32 {
    let budget = if upscaler == UPSCALER_LATENT {
        ceilings.max_pixel_count_latent
    } else {
        ceilings.max_pixel_count_esrgan
    };
    let pixels = f64::from(width) * f64::from(height) * scale * scale;
    if pixels <= 0.0 {
        return 0;
    }
    ((budget as f64 / pixels).floor() as u32).min(4)
}

/// The full declared parameter table, built from the configured generation
/// catalog (models, vaes) plus the static lists above.
#[derive(Debug, Clone)]
pub struct ParamRegistry {
    specs: BTreeMap<&'static str, ParamKind>,
    models: Vec<String>,
    vaes: Vec<String>,
    ceilings: PixelCeilings,
}

fn str_enum(default: &str, values: &[&str]) -> ParamKind {
    ParamKind::Enum {
        default: default.to_string(),
        values: values.iter().map(|s| s.to_string()).collect(),
    }
}

impl ParamRegistry {
    pub fn new(
        models: Vec<String>,
        default_model: Option<String>,
        vaes: Vec<String>,
        ceilings: PixelCeilings,
    ) -> anyhow::Result<Self> {
        if models.is_empty() {
            anyhow::bail!("generation catalog lists no models, nothing could be scheduled");
        }
        let default_model = match default_model {
            Some(m) if models.contains(&m) => m,
            Some(m) => anyhow::bail!("default model {m:?} is not in the model list"),
            None => models[0].clone(),
        };
        let vaes = if vaes.is_empty() {
            vec!["Automatic".to_string(), "None".to_string()]
        } else {
            vaes
        };
        let default_vae = if vaes.iter().any(|v| v == "Automatic") {
            "Automatic".to_string()
        } else {
            vaes[0].clone()
        };

        let mut refiners = vec![REFINER_NONE.to_string()];
        refiners.extend(models.iter().cloned());

        let text = |d: &str| ParamKind::Text { default: d.to_string() };

        let mut specs: BTreeMap<&'static str, ParamKind> = BTreeMap::new();
        specs.insert(PROMPT, text(""));
        specs.insert(NEG_PROMPT, text(""));
        specs.insert(PREFIX, text(""));
        specs.insert(NEG_PREFIX, text(""));
        specs.insert(STEPS, ParamKind::Int { default: 28, min: 0, max: 50 });
        specs.insert(CFG, ParamKind::Float { default: 8.0, min: 0.0, max: 30.0 });
        specs.insert(SAMPLER, str_enum("DPM++ 2M", SAMPLERS));
        specs.insert(SEED, ParamKind::Int { default: -1, min: -1, max: SEED_MAX });
        specs.insert(WIDTH, ParamKind::Int { default: 512, min: 256, max: 1024 });
        specs.insert(HEIGHT, ParamKind::Int { default: 512, min: 256, max: 1024 });
        specs.insert(
            VAE,
            ParamKind::Enum { default: default_vae, values: vaes.clone() },
        );
        specs.insert(
            MODEL,
            ParamKind::Enum { default: default_model, values: models.clone() },
        );
        specs.insert(
            REFINER,
            ParamKind::Enum { default: REFINER_NONE.to_string(), values: refiners },
        );
        specs.insert(REFINER_SWITCH_AT, ParamKind::Float { default: 0.8, min: 0.0, max: 1.0 });
        specs.insert(SCALE, ParamKind::Float { default: 1.0, min: 1.0, max: 2.0 });
        specs.insert(DENOISING_STR, ParamKind::Float { default: 0.7, min: 0.0, max: 1.0 });
        specs.insert(HIGHRES_STEPS, ParamKind::Int { default: 10, min: 1, max: 20 });
        specs.insert(UPSCALER, str_enum(UPSCALER_LATENT, UPSCALERS));
        specs.insert(AUTOSIZE, ParamKind::Bool { default: true });
        specs.insert(AUTOSIZE_MAXSIZE, ParamKind::Int { default: 512, min: 256, max: 1024 });
        specs.insert(DENOISING_STR_IMG2IMG, ParamKind::Float { default: 0.55, min: 0.0, max: 1.0 });
        specs.insert(RESIZE_MODE, str_enum("Crop and resize", RESIZE_MODES));
        specs.insert(RESIZE_SCALE, ParamKind::Float { default: 1.0, min: 0.5, max: 2.0 });
        specs.insert(BATCH_SIZE, ParamKind::Int { default: 4, min: 1, max: 4 });

        Ok(Self { specs, models, vaes, ceilings })
    }

    pub fn spec(&self, name: &str) -> Option<&ParamKind> {
        self.specs.get(name)
    }

    pub fn is_param(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.keys().copied()
    }

    pub fn default_value(&self, name: &str) -> Option<ParamValue> {
        self.specs.get(name).map(ParamKind::default_value)
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn vaes(&self) -> &[String] {
        &self.vaes
    }

    pub fn ceilings(&self) -> &PixelCeilings {
        &self.ceilings
    }

    /// Clamp/coerce a single named value. Unknown names pass through as-is.
    pub fn validate_value(&self, name: &str, value: &ParamValue) -> ParamValue {
        match self.specs.get(name) {
            Some(kind) => kind.validate(value),
            None => value.clone(),
        }
    }

    /// Validate every declared parameter present in the set, in place.
    /// Keys the registry does not know are left untouched.
    pub fn validate_set(&self, set: &mut ParamSet) {
        let names: Vec<String> = set.iter().map(|(k, _)| k.to_string()).collect();
        for name in names {
            if let Some(kind) = self.specs.get(name.as_str()) {
                let validated = kind.validate(set.get(&name).unwrap_or(&kind.default_value()));
                set.insert(name, validated);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ParamRegistry {
        ParamRegistry::new(
            vec!["test model".to_string(), "other model".to_string()],
            None,
            vec!["Automatic".to_string(), "None".to_string(), "test vae".to_string()],
            PixelCeilings::default(),
        )
        .unwrap()
    }

    #[test]
    fn validate_clamps_out_of_range_numerics_and_rejects_unknown_strings() {
        let reg = registry();
        let bad_string = "dkjhasdluhlgkjhduskl???????";

        let mut below = ParamSet::new();
        let mut above = ParamSet::new();
        for name in reg.names().collect::<Vec<_>>() {
            match reg.spec(name).unwrap() {
                ParamKind::Int { min, max, .. } => {
                    below.insert(name, ParamValue::Int(min - 1));
                    above.insert(name, ParamValue::Int(max + 1));
                }
                ParamKind::Float { min, max, .. } => {
                    below.insert(name, ParamValue::Float(min - 1.0));
                    above.insert(name, ParamValue::Float(max + 1.0));
                }
                ParamKind::Enum { .. } => {
                    below.insert(name, ParamValue::Str(bad_string.to_string()));
                    above.insert(name, ParamValue::Str(bad_string.to_string()));
                }
                ParamKind::Text { .. } | ParamKind::Bool { .. } => {}
            }
        }

        reg.validate_set(&mut below);
        reg.validate_set(&mut above);

        for set in [&below, &above] {
            for (name, value) in set.iter() {
                match reg.spec(name).unwrap() {
                    ParamKind::Int { min, max, .. } => {
                        let v = value.as_i64().unwrap();
                        assert!(v >= *min && v <= *max, "{name} out of range: {v}");
                    }
                    ParamKind::Float { min, max, .. } => {
                        let v = value.as_f64().unwrap();
                        assert!(v >= *min && v <= *max, "{name} out of range: {v}");
                    }
                    ParamKind::Enum { values, .. } => {
                        let v = value.as_str().unwrap();
                        assert!(values.iter().any(|a| a == v), "{name} not allow-listed: {v}");
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn validate_coerces_string_numerics() {
        let reg = registry();
        assert_eq!(
            reg.validate_value(STEPS, &ParamValue::Str("30".to_string())),
            ParamValue::Int(30)
        );
        assert_eq!(
            reg.validate_value(CFG, &ParamValue::Str("nonsense".to_string())),
            ParamValue::Float(8.0)
        );
        assert_eq!(
            reg.validate_value(CFG, &ParamValue::Int(9)),
            ParamValue::Float(9.0)
        );
    }

    #[test]
    fn batch_ceiling_respects_declared_bounds() {
        let ceilings = PixelCeilings::default();
        assert_eq!(max_batch_size(512, 512, 2.0, "Latent", &ceilings), 2);
        assert_eq!(max_batch_size(512, 512, 2.0, "R-ESRGAN 4x+", &ceilings), 1);
        assert!(max_batch_size(1024, 1024, 2.0, "Latent", &ceilings) < 2);
        assert!(max_batch_size(512, 512, 2.0, "R-ESRGAN 4x+", &ceilings) < 2);
        // Plain 512x512 txt2img keeps the full batch.
        assert_eq!(max_batch_size(512, 512, 1.0, "Latent", &ceilings), 4);
    }

    #[test]
    fn seed_range_is_declared() {
        let reg = registry();
        assert_eq!(
            reg.validate_value(SEED, &ParamValue::Int(SEED_MAX + 10)),
            ParamValue::Int(SEED_MAX)
        );
        assert_eq!(reg.validate_value(SEED, &ParamValue::Int(-5)), ParamValue::Int(-1));
    }
}
