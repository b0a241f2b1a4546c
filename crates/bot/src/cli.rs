use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;

fn parse_deadline_secs(input: &str) -> Result<Duration, String> {
    let secs: u64 = input
        .trim()
        .parse()
        .map_err(|_| format!("invalid deadline seconds: {input:?}"))?;
    if secs == 0 {
        return Err("deadline must be at least 1 second".to_string());
    }
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "easel", version, about = "Model-aware dispatcher for GPU image-generation backends")]
pub struct Cli {
    /// Backend base URLs, one per GPU engine (repeat or comma-separate).
    #[arg(
        long = "backend",
        env = "EASEL_BACKEND_URLS",
        value_delimiter = ',',
        required = true
    )]
    pub backends: Vec<Url>,

    /// Surface/catalog configuration file.
    #[arg(long, env = "EASEL_CONFIG", default_value = "easel_config.json")]
    pub config: PathBuf,

    /// User preferences file.
    #[arg(long, env = "EASEL_PREFERENCES", default_value = "user_preferences.json")]
    pub preferences: PathBuf,

    /// Directory generated images are written to by the console transport.
    #[arg(long, env = "EASEL_OUTPUT_DIR", default_value = "generated")]
    pub output_dir: PathBuf,

    /// Soft per-item deadline in seconds before the scheduler redistributes
    /// workers.
    #[arg(
        long = "soft-deadline",
        env = "EASEL_SOFT_DEADLINE_SECS",
        default_value = "30",
        value_parser = parse_deadline_secs
    )]
    pub soft_deadline: Duration,

    /// User id the console transport reports.
    #[arg(long, env = "EASEL_USER_ID", default_value_t = 0)]
    pub user_id: u64,

    /// Channel id the console transport reports.
    #[arg(long, env = "EASEL_CHANNEL_ID", default_value_t = 0)]
    pub channel_id: u64,

    /// Optional category id the console transport reports.
    #[arg(long, env = "EASEL_CATEGORY_ID")]
    pub category_id: Option<u64>,

    /// Optional guild id the console transport reports.
    #[arg(long, env = "EASEL_GUILD_ID")]
    pub guild_id: Option<u64>,
}
