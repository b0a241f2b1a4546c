//! A line-based console transport: the in-repo stand-in for a real chat
//! integration. Requests are blocks of `name: value` lines introduced by a
//! command word and submitted with a blank line; replies print to stdout and
//! generated images land in the output directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use easel_core::params::{ParamSet, ParamValue};

use crate::chat::{ChatGateway, Reply, RequestContext};
use crate::commands::{AgainSource, Command, CommandDispatcher, InfoTopic};
use crate::admission::GenerationRequest;

static RE_OPTION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z0-9_]+)\s*:\s*(.*)$").unwrap());

/// Gateway that prints replies and writes image files.
pub struct ConsoleGateway {
    out_dir: PathBuf,
    seq: AtomicU64,
}

impl ConsoleGateway {
    pub fn new(out_dir: PathBuf) -> Self {
        Self { out_dir, seq: AtomicU64::new(0) }
    }
}

impl ChatGateway for ConsoleGateway {
    async fn send_reply(&self, _ctx: &RequestContext, reply: Reply) -> anyhow::Result<()> {
        match reply {
            Reply::Text(text) => println!("{text}"),
            Reply::Error(text) => eprintln!("{text}"),
            Reply::Images(files) => {
                let out_dir = self.out_dir.clone();
                let start = self.seq.fetch_add(files.len() as u64, Ordering::Relaxed);
                let written = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<PathBuf>> {
                    std::fs::create_dir_all(&out_dir)?;
                    let mut paths = Vec::with_capacity(files.len());
                    for (offset, file) in files.iter().enumerate() {
                        let path = out_dir.join(format!("{:04}-{}", start + offset as u64, file.name));
                        std::fs::write(&path, &file.data)?;
                        paths.push(path);
                    }
                    Ok(paths)
                })
                .await??;
                for path in written {
                    println!("wrote {}", path.display());
                }
            }
        }
        Ok(())
    }

    async fn trigger_typing(&self, channel_id: u64) {
        debug!(channel = channel_id, "typing");
    }

    async fn ack_text(&self, _channel_id: u64, _message_id: u64) -> anyhow::Result<String> {
        anyhow::bail!("the console transport keeps no message history; use `again` without a message id")
    }
}

/// Read request blocks from stdin until EOF or stop. Dispatcher replies go
/// back out through the same gateway contract a real chat transport would
/// implement.
pub async fn run_console<G: ChatGateway>(
    dispatcher: Arc<CommandDispatcher<G>>,
    gateway: Arc<G>,
    ctx: RequestContext,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    println!("easel console: first line is a command (txt2img, img2img, again, get_preferences, set_preferences, info ...); add `name: value` lines; submit with a blank line.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut block: Vec<String> = Vec::new();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = wait_for_stop(&stop) => break,
        };
        let Some(line) = line else {
            break;
        };

        if !line.trim().is_empty() {
            block.push(line.trim_end().to_string());
            continue;
        }
        if block.is_empty() {
            continue;
        }

        let parsed = parse_block(&block);
        block.clear();
        match parsed {
            Ok(command) => {
                for reply in dispatcher.handle(&ctx, command).await {
                    gateway.send_reply(&ctx, Reply::Text(reply)).await?;
                }
            }
            Err(message) => println!("{message}"),
        }
    }

    Ok(())
}

async fn wait_for_stop(stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn parse_options(lines: &[String]) -> Result<ParamSet, String> {
    let mut set = ParamSet::new();
    for line in lines {
        let caps = RE_OPTION_LINE
            .captures(line)
            .ok_or_else(|| format!("unrecognized option line {line:?} (expected `name: value`)"))?;
        set.insert(caps[1].to_string(), ParamValue::Str(caps[2].trim().to_string()));
    }
    Ok(set)
}

fn take_str(set: &mut ParamSet, name: &str) -> Option<String> {
    set.remove(name).and_then(|v| v.as_str().map(str::to_string))
}

fn generation_request(mut options: ParamSet, needs_image: bool) -> Result<GenerationRequest, String> {
    let prompt = take_str(&mut options, "prompt")
        .ok_or_else(|| "a `prompt:` line is required".to_string())?;
    let negative_prompt = take_str(&mut options, "negative_prompt").unwrap_or_default();
    let skip_prefixes = take_str(&mut options, "skip_prefixes")
        .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "no"))
        .unwrap_or(false);
    let image_url = take_str(&mut options, "image_url");
    if needs_image && image_url.is_none() {
        return Err("an `image_url:` line is required for img2img".to_string());
    }
    Ok(GenerationRequest { prompt, negative_prompt, skip_prefixes, values: options, image_url })
}

/// Parse one request block. The first line is the command word, optionally
/// followed by arguments (`info models vaes`); the rest are options.
fn parse_block(block: &[String]) -> Result<Command, String> {
    let mut head = block[0].split_whitespace();
    let command = head.next().unwrap_or_default().to_ascii_lowercase();
    let args: Vec<&str> = head.collect();
    let options = parse_options(&block[1..])?;

    match command.as_str() {
        "txt2img" => Ok(Command::Txt2Img(generation_request(options, false)?)),
        "img2img" => Ok(Command::Img2Img(generation_request(options, true)?)),
        "again" => {
            let mut overrides = options;
            let source = match take_str(&mut overrides, "message_id") {
                Some(raw) => AgainSource::MessageId(
                    raw.parse::<u64>().map_err(|_| format!("bad message id {raw:?}"))?,
                ),
                None => AgainSource::Last,
            };
            Ok(Command::Again { source, overrides })
        }
        "get_preferences" => Ok(Command::GetPreferences),
        "set_preferences" => Ok(Command::SetPreferences(options)),
        "info" => {
            let mut topics = Vec::new();
            for arg in args {
                topics.push(match arg.to_ascii_lowercase().as_str() {
                    "models" => InfoTopic::Models,
                    "vaes" => InfoTopic::Vaes,
                    "loras" => InfoTopic::Loras,
                    "embeddings" => InfoTopic::Embeddings,
                    "usage" => InfoTopic::Usage,
                    other => return Err(format!("unknown info topic {other:?}")),
                });
            }
            if topics.is_empty() {
                topics.push(InfoTopic::Usage);
            }
            Ok(Command::Info(topics))
        }
        other => Err(format!(
            "unknown command {other:?} (try txt2img, img2img, again, get_preferences, set_preferences, info)"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_txt2img_block() {
        let command = parse_block(&block(&[
            "txt2img",
            "prompt: a cat on a roof",
            "steps: 30",
            "seed: 77",
        ]))
        .unwrap();
        match command {
            Command::Txt2Img(req) => {
                assert_eq!(req.prompt, "a cat on a roof");
                assert_eq!(req.values.get_str("steps"), Some("30"));
                assert_eq!(req.values.get_str("seed"), Some("77"));
                assert!(req.image_url.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn txt2img_requires_a_prompt() {
        assert!(parse_block(&block(&["txt2img", "steps: 30"])).is_err());
    }

    #[test]
    fn img2img_requires_an_image_url() {
        assert!(parse_block(&block(&["img2img", "prompt: a cat"])).is_err());
        let command = parse_block(&block(&[
            "img2img",
            "prompt: a cat",
            "image_url: https://example.com/cat.png",
        ]))
        .unwrap();
        assert!(matches!(command, Command::Img2Img(req) if req.image_url.is_some()));
    }

    #[test]
    fn again_defaults_to_last_ack() {
        let command = parse_block(&block(&["again", "seed: -1"])).unwrap();
        match command {
            Command::Again { source: AgainSource::Last, overrides } => {
                assert_eq!(overrides.get_str("seed"), Some("-1"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn again_with_message_id() {
        let command = parse_block(&block(&["again", "message_id: 42"])).unwrap();
        assert!(matches!(
            command,
            Command::Again { source: AgainSource::MessageId(42), .. }
        ));
    }

    #[test]
    fn info_topics_parse() {
        let command = parse_block(&block(&["info models vaes"])).unwrap();
        assert!(matches!(
            command,
            Command::Info(ref topics) if topics == &[InfoTopic::Models, InfoTopic::Vaes]
        ));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(parse_block(&block(&["summon_demons"])).is_err());
    }
}
