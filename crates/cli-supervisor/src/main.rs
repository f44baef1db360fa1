use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::{JsonLines, NvidiaSmi, Supervisor, SupervisorConfig, Telemetry};

/// Run ffmpeg under supervision, reporting progress as JSON lines on stderr
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, disable_help_flag = true, disable_version_flag = true)]
struct Args {
    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Print version
    #[arg(long, action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Path to configuration file (JSON or TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Arguments passed through to ffmpeg. Wrapper options are long-only so
    /// ffmpeg's `-c`, `-v` and `-h` reach ffmpeg.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    ffmpeg_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger - use RUST_LOG env var or default to info level
    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.format_timestamp_secs().init();

    let mut cfg = SupervisorConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    cfg.apply_env();

    debug!("Configuration: {:?}", cfg);
    let telemetry = Telemetry::new(Arc::new(JsonLines::stderr()));
    info!("Supervising ffmpeg, run {}", telemetry.run_id());

    let supervisor = Supervisor::new(cfg, NvidiaSmi, telemetry);
    let outcome = supervisor.run(args.ffmpeg_args).await;

    std::process::exit(outcome.exit_code());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn passthrough(argv: &[&str]) -> Vec<String> {
        let mut full = vec!["ffmpeg-json"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap().ffmpeg_args
    }

    #[test]
    fn test_short_flags_reach_ffmpeg() {
        assert_eq!(passthrough(&["-h"]), vec!["-h"]);
        assert_eq!(passthrough(&["-V"]), vec!["-V"]);
        assert_eq!(passthrough(&["-h", "encoder=libx264"]), vec!["-h", "encoder=libx264"]);
        assert_eq!(
            passthrough(&["-y", "-hwaccel", "cuda", "-i", "in.mkv", "-c:v", "h264_nvenc", "-v", "error", "out.mp4"]),
            vec!["-y", "-hwaccel", "cuda", "-i", "in.mkv", "-c:v", "h264_nvenc", "-v", "error", "out.mp4"]
        );
    }

    #[test]
    fn test_wrapper_options_before_ffmpeg_args() {
        let args = Args::try_parse_from(["ffmpeg-json", "--verbose", "--config", "ff.toml", "-version"]).unwrap();
        assert!(args.verbose);
        assert_eq!(args.config, Some(PathBuf::from("ff.toml")));
        assert_eq!(args.ffmpeg_args, vec!["-version"]);
    }

    #[test]
    fn test_long_help_and_version() {
        let err = Args::try_parse_from(["ffmpeg-json", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        let err = Args::try_parse_from(["ffmpeg-json", "--version"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
    }
}
