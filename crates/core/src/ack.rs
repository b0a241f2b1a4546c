//! The acknowledgement-message codec. The ack sent back on submission is the
//! canonical serialization of the request: `parse(render(v))` equals the
//! validated form of `v`, which is what makes the "generate again from a
//! previous ack" command possible.
//!
//! Line grammar (fixed order; bracketed lines optional, at most one of the
//! img2img / upscaling pair):
//!
//! ```text
//! Generating <n> images for prompt: <prompt>
//! negative prompt: <neg_prompt>
//! Using model: <model>, vae: <vae>, image size: <W>x<H>
//! Using steps: <steps>, cfg: <cfg>, sampler: <sampler>, seed <seed>
//! [img2img resize mode: <mode>, denoising str <d>, url: <url>]
//! [Upscaling by <scale> using highres upscaler <upscaler>, <steps> steps. Denoising str <d>]
//! [Using refiner model: <refiner>, refiner switch at value: <s>]
//! ```

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use crate::params::{
    self, ParamRegistry, ParamSet, ParamValue, BATCH_SIZE, CFG, DENOISING_STR,
    DENOISING_STR_IMG2IMG, HEIGHT, HIGHRES_STEPS, IMAGE_URL, MODEL, NEG_PROMPT, PROMPT, REFINER,
    REFINER_SWITCH_AT, RESIZE_MODE, SAMPLER, SCALE, SEED, STEPS, UPSCALER, VAE, WIDTH,
};

#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("ack message is missing required field {0}")]
    MissingField(&'static str),
    #[error("malformed ack message: {0}")]
    Malformed(String),
}

static RE_HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Generating (\d+) images for prompt: (.*)$").unwrap());
static RE_NEG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^negative prompt: (.*)$").unwrap());
static RE_MODEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Using model: (.*?), vae: (.*), image size: (\d+)x(\d+)$").unwrap()
});
static RE_SAMPLING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Using steps: (\d+), cfg: (\d+(?:\.\d+)?), sampler: (.*), seed (\d+)$").unwrap()
});
static RE_IMG2IMG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^img2img resize mode: (.*?), denoising str (\d+(?:\.\d+)?), url: (.*)$").unwrap()
});
static RE_UPSCALE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Upscaling by (\d+(?:\.\d+)?) using highres upscaler (.*?), (\d+) steps\. Denoising str (\d+(?:\.\d+)?)$",
    )
    .unwrap()
});
static RE_REFINER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Using refiner model: (.*?), refiner switch at value: (\d+(?:\.\d+)?)$").unwrap()
});

fn need_i64(set: &ParamSet, name: &'static str) -> Result<i64, AckError> {
    set.get_i64(name).ok_or(AckError::MissingField(name))
}

fn need_f64(set: &ParamSet, name: &'static str) -> Result<f64, AckError> {
    set.get_f64(name).ok_or(AckError::MissingField(name))
}

fn need_str<'a>(set: &'a ParamSet, name: &'static str) -> Result<&'a str, AckError> {
    set.get_str(name).ok_or(AckError::MissingField(name))
}

/// Render the ack message for a validated parameter set.
pub fn render(set: &ParamSet) -> Result<String, AckError> {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Generating {} images for prompt: {}",
        need_i64(set, BATCH_SIZE)?,
        need_str(set, PROMPT)?
    );
    let _ = writeln!(out, "negative prompt: {}", need_str(set, NEG_PROMPT)?);
    let _ = writeln!(
        out,
        "Using model: {}, vae: {}, image size: {}x{}",
        need_str(set, MODEL)?,
        need_str(set, VAE)?,
        need_i64(set, WIDTH)?,
        need_i64(set, HEIGHT)?
    );
    let _ = writeln!(
        out,
        "Using steps: {}, cfg: {:.2}, sampler: {}, seed {}",
        need_i64(set, STEPS)?,
        need_f64(set, CFG)?,
        need_str(set, SAMPLER)?,
        need_i64(set, SEED)?
    );

    if set.contains(IMAGE_URL) {
        // img2img wins over a high-res pass; the upscaling line is dropped.
        let _ = writeln!(
            out,
            "img2img resize mode: {}, denoising str {:.2}, url: {}",
            need_str(set, RESIZE_MODE)?,
            need_f64(set, DENOISING_STR_IMG2IMG)?,
            need_str(set, IMAGE_URL)?
        );
    } else if set.get_f64(SCALE).unwrap_or(1.0) > 1.0 {
        let _ = writeln!(
            out,
            "Upscaling by {:.2} using highres upscaler {}, {} steps. Denoising str {:.2}",
            need_f64(set, SCALE)?,
            need_str(set, UPSCALER)?,
            need_i64(set, HIGHRES_STEPS)?,
            need_f64(set, DENOISING_STR)?
        );
    }

    if let Some(refiner) = set.get_str(REFINER) {
        if refiner != params::REFINER_NONE {
            let _ = writeln!(
                out,
                "Using refiner model: {}, refiner switch at value: {:.2}",
                refiner,
                need_f64(set, REFINER_SWITCH_AT)?
            );
        }
    }

    Ok(out)
}

fn parse_i64(raw: &str, line: &str) -> Result<ParamValue, AckError> {
    raw.parse::<i64>()
        .map(ParamValue::Int)
        .map_err(|_| AckError::Malformed(format!("bad integer in line {line:?}")))
}

fn parse_f64(raw: &str, line: &str) -> Result<ParamValue, AckError> {
    raw.parse::<f64>()
        .map(ParamValue::Float)
        .map_err(|_| AckError::Malformed(format!("bad number in line {line:?}")))
}

/// Parse an ack message back into a validated parameter set.
pub fn parse(registry: &ParamRegistry, text: &str) -> Result<ParamSet, AckError> {
    let mut lines: Vec<&str> = text.lines().collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    if lines.len() < 4 {
        return Err(AckError::Malformed(format!(
            "expected at least 4 lines, got {}",
            lines.len()
        )));
    }

    let mut set = ParamSet::new();

    let caps = RE_HEAD
        .captures(lines[0])
        .ok_or_else(|| AckError::Malformed(format!("unrecognized first line {:?}", lines[0])))?;
    set.insert(BATCH_SIZE, parse_i64(&caps[1], lines[0])?);
    set.insert(PROMPT, ParamValue::Str(caps[2].to_string()));

    let caps = RE_NEG
        .captures(lines[1])
        .ok_or_else(|| AckError::Malformed(format!("unrecognized negative-prompt line {:?}", lines[1])))?;
    set.insert(NEG_PROMPT, ParamValue::Str(caps[1].to_string()));

    let caps = RE_MODEL
        .captures(lines[2])
        .ok_or_else(|| AckError::Malformed(format!("unrecognized model line {:?}", lines[2])))?;
    set.insert(MODEL, ParamValue::Str(caps[1].to_string()));
    set.insert(VAE, ParamValue::Str(caps[2].to_string()));
    set.insert(WIDTH, parse_i64(&caps[3], lines[2])?);
    set.insert(HEIGHT, parse_i64(&caps[4], lines[2])?);

    let caps = RE_SAMPLING
        .captures(lines[3])
        .ok_or_else(|| AckError::Malformed(format!("unrecognized sampling line {:?}", lines[3])))?;
    set.insert(STEPS, parse_i64(&caps[1], lines[3])?);
    set.insert(CFG, parse_f64(&caps[2], lines[3])?);
    set.insert(SAMPLER, ParamValue::Str(caps[3].to_string()));
    set.insert(SEED, parse_i64(&caps[4], lines[3])?);

    // Absent optional lines still pin the scale so round-trips are exact.
    set.insert(SCALE, ParamValue::Float(1.0));

    let mut idx = 4;
    if idx < lines.len() {
        if let Some(caps) = RE_IMG2IMG.captures(lines[idx]) {
            set.insert(RESIZE_MODE, ParamValue::Str(caps[1].to_string()));
            set.insert(DENOISING_STR_IMG2IMG, parse_f64(&caps[2], lines[idx])?);
            set.insert(IMAGE_URL, ParamValue::Str(caps[3].to_string()));
            idx += 1;
        } else if let Some(caps) = RE_UPSCALE.captures(lines[idx]) {
            set.insert(SCALE, parse_f64(&caps[1], lines[idx])?);
            set.insert(UPSCALER, ParamValue::Str(caps[2].to_string()));
            set.insert(HIGHRES_STEPS, parse_i64(&caps[3], lines[idx])?);
            set.insert(DENOISING_STR, parse_f64(&caps[4], lines[idx])?);
            idx += 1;
        }
    }

    if idx < lines.len() {
        if let Some(caps) = RE_REFINER.captures(lines[idx]) {
            set.insert(REFINER, ParamValue::Str(caps[1].to_string()));
            set.insert(REFINER_SWITCH_AT, parse_f64(&caps[2], lines[idx])?);
            idx += 1;
        }
    }

    if idx != lines.len() {
        return Err(AckError::Malformed(format!(
            "unrecognized trailing line {:?}",
            lines[idx]
        )));
    }

    registry.validate_set(&mut set);
    Ok(set)
}
