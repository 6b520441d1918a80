use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use weaver_contracts::config::{non_empty_env, EngineConfig};
use weaver_contracts::events::{EventSink, EventWriter, ThinkingEvent};
use weaver_contracts::request::{EngineKind, GenerationRequest};
use weaver_engine::GenerationEngine;

mod server;

use server::{AppState, ServeOptions};

#[derive(Debug, Parser)]
#[command(name = "voidweaver", version, about = "VoidWeaver image generation service")]
struct Cli {
    /// JSON engine config; falls back to $VOIDWEAVER_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve(ServeArgs),
    Generate(GenerateArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,
    #[arg(long, default_value_t = 300)]
    stream_deadline_secs: u64,
    /// Allowed CORS origin; repeatable. None allows any origin.
    #[arg(long = "allow-origin")]
    allow_origins: Vec<String>,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "google-imagen")]
    engine: String,
    #[arg(long, default_value = "1024x1024")]
    resolution: String,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    scale: Option<f64>,
    #[arg(long)]
    strength: Option<f64>,
    /// Reference image for image-to-image.
    #[arg(long)]
    image: Option<PathBuf>,
    #[arg(long)]
    deep_thinking: bool,
    #[arg(long)]
    out: PathBuf,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("voidweaver error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Serve(args) => {
            run_serve(config, args)?;
            Ok(0)
        }
        Command::Generate(args) => run_generate(config, args),
    }
}

fn run_serve(config: EngineConfig, args: ServeArgs) -> Result<()> {
    if args.stream_deadline_secs == 0 {
        bail!("--stream-deadline-secs must be positive");
    }
    let state = AppState::new(config, Duration::from_secs(args.stream_deadline_secs));
    let options = ServeOptions {
        bind: args.bind,
        port: args.port,
        allow_origins: args.allow_origins,
    };
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(server::serve(state, options))
}

fn run_generate(config: EngineConfig, args: GenerateArgs) -> Result<i32> {
    let request = build_request(&args, non_empty_env)?;
    let engine = GenerationEngine::new(&config)?;
    let writer = EventWriter::new(ConsoleSink, "cli");
    match engine.stream(&request, &writer) {
        Ok(result) => {
            write_image(&args.out, &result.image_data)?;
            if let Some(sketch) = result.sketch_image.as_deref() {
                let sketch_path = sketch_path_for(&args.out);
                write_image(&sketch_path, sketch)?;
                eprintln!("sketch: {}", sketch_path.display());
            }
            println!("{}", args.out.display());
            Ok(0)
        }
        Err(err) => {
            eprintln!("voidweaver error [{}]: {err}", err.kind().code());
            Ok(1)
        }
    }
}

/// Builds the wire request from flags, taking the credential for the chosen
/// engine from the environment.
fn build_request<F>(args: &GenerateArgs, lookup: F) -> Result<GenerationRequest>
where
    F: Fn(&str) -> Option<String>,
{
    let kind: EngineKind = args.engine.parse()?;
    let mut request = GenerationRequest {
        prompt: args.prompt.clone(),
        engine: kind.as_str().to_string(),
        resolution: args.resolution.clone(),
        steps: args.steps,
        scale: args.scale,
        strength: args.strength,
        deep_thinking: args.deep_thinking,
        ..GenerationRequest::default()
    };
    match kind {
        EngineKind::GoogleImagen => {
            request.google_credentials =
                lookup("GEMINI_API_KEY").or_else(|| lookup("GOOGLE_API_KEY"));
        }
        EngineKind::NovelAi => {
            request.novelai_api_key = lookup("NOVELAI_API_KEY");
        }
    }
    if let Some(path) = args.image.as_deref() {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        request.image = Some(BASE64.encode(bytes));
    }
    Ok(request)
}

fn write_image(path: &Path, image_data: &str) -> Result<()> {
    let bytes = BASE64
        .decode(image_data.trim().as_bytes())
        .context("provider returned invalid base64 image data")?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn sketch_path_for(out: &Path) -> PathBuf {
    let stem = out
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("image");
    let extension = out
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("png");
    out.with_file_name(format!("{stem}.sketch.{extension}"))
}

/// Prints progress lines as they arrive; the outcome is reported by
/// `run_generate`.
struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn send(&self, event: ThinkingEvent) -> Result<()> {
        match event {
            ThinkingEvent::Log(line) => eprintln!("{line}"),
            ThinkingEvent::Sketch(data) => eprintln!("sketch received ({} base64 chars)", data.len()),
            ThinkingEvent::Result(_) | ThinkingEvent::Error(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn args(engine: &str) -> GenerateArgs {
        GenerateArgs {
            prompt: "a fox".to_string(),
            engine: engine.to_string(),
            resolution: "1024x1024".to_string(),
            steps: None,
            scale: None,
            strength: None,
            image: None,
            deep_thinking: true,
            out: PathBuf::from("out.png"),
        }
    }

    #[test]
    fn cli_parses_generate_flags() {
        let cli = Cli::try_parse_from([
            "voidweaver",
            "generate",
            "--prompt",
            "a fox",
            "--engine",
            "novelai",
            "--deep-thinking",
            "--out",
            "fox.png",
        ])
        .unwrap();
        match cli.command {
            Command::Generate(args) => {
                assert_eq!(args.engine, "novelai");
                assert!(args.deep_thinking);
                assert_eq!(args.resolution, "1024x1024");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_serve_defaults() {
        let cli = Cli::try_parse_from(["voidweaver", "serve"]).unwrap();
        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.bind, "0.0.0.0");
                assert_eq!(args.stream_deadline_secs, 300);
                assert!(args.allow_origins.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn gemini_credential_falls_back_to_google_key() -> anyhow::Result<()> {
        let vars = HashMap::from([("GOOGLE_API_KEY", "g-key"), ("NOVELAI_API_KEY", "n-key")]);
        let request = build_request(&args("GOOGLE_IMAGEN"), |key| {
            vars.get(key).map(|value| value.to_string())
        })?;
        assert_eq!(request.engine, "google-imagen");
        assert_eq!(request.google_credentials.as_deref(), Some("g-key"));
        assert!(request.novelai_api_key.is_none());
        Ok(())
    }

    #[test]
    fn reference_image_is_base64_encoded() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("ref.png");
        fs::write(&path, b"png-bytes")?;
        let mut with_image = args("novelai");
        with_image.image = Some(path);
        let request = build_request(&with_image, |_| None)?;
        assert_eq!(request.image.as_deref(), Some(BASE64.encode(b"png-bytes").as_str()));
        assert!(request.novelai_api_key.is_none());
        Ok(())
    }

    #[test]
    fn unknown_engine_flag_is_rejected() {
        assert!(build_request(&args("dall-e"), |_| None).is_err());
    }

    #[test]
    fn images_are_decoded_next_to_each_other() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("renders").join("fox.png");
        write_image(&out, &BASE64.encode(b"final"))?;
        assert_eq!(fs::read(&out)?, b"final");
        assert_eq!(sketch_path_for(&out), temp.path().join("renders").join("fox.sketch.png"));
        assert!(write_image(&out, "not base64!").is_err());
        Ok(())
    }
}
