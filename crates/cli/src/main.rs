use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use cdnpush_core::config::{
    Settings, load_settings, parse_settings, save_settings, to_toml, validate_settings,
};
use cdnpush_core::run_log::{JobLog, RunKind};
use cdnpush_core::{
    APP_NAME, EventSink, JobEvent, JobPhase, JobResult, SystemProcessRunner, UploadJob,
    UploadOrchestrator, build_manifest, manifest_path, write_manifest,
};
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "cdnpush")]
#[command(about = "Publish an asset folder through git and list its CDN URLs", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Print every job event as one JSON object per line.
    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    /// Copy a folder into the publish root, push it and write its manifest.
    Publish {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        publish_root: Option<PathBuf>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Rebuild the manifest of a folder that is already in the publish root.
    Manifest {
        #[arg(long)]
        folder: String,
        #[arg(long)]
        publish_root: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    /// Read TOML settings from stdin, validate and save them.
    Set,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("CDNPUSH_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("CDNPUSH_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
        Command::Publish {
            source,
            publish_root,
            owner,
            repo,
            branch,
        } => {
            let mut settings = load_settings(&config_dir).map_err(map_core_err)?;
            if let Some(owner) = owner {
                settings.remote.owner = owner;
            }
            if let Some(repo) = repo {
                settings.remote.repo = repo;
            }
            if let Some(branch) = branch {
                settings.remote.branch = branch;
            }
            let root = resolve_publish_root(publish_root, &settings)?;
            publish_run(&settings, &data_dir, source, root, cli.json, cli.events).await
        }
        Command::Manifest {
            folder,
            publish_root,
        } => {
            let settings = load_settings(&config_dir).map_err(map_core_err)?;
            let root = resolve_publish_root(publish_root, &settings)?;
            manifest_run(&settings, &data_dir, &folder, &root, cli.json)
        }
    }
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = to_toml(&settings).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = parse_settings(&input).map_err(map_core_err)?;
    save_settings(config_dir, &settings).map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "ok": true }));
    }
    Ok(())
}

async fn publish_run(
    settings: &Settings,
    data_dir: &Path,
    source: PathBuf,
    publish_root: PathBuf,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    validate_settings(settings).map_err(map_core_err)?;

    let job = UploadJob::new(source, publish_root, settings.identity());
    let log = JobLog::open(RunKind::Publish, job.id(), data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;
    tracing::info!(event = "run.start", kind = "publish", job_id = job.id(), "run.start");

    let orchestrator = UploadOrchestrator::new(SystemProcessRunner, settings.pipeline_config());
    let mut handle = orchestrator.spawn(job);
    while let Some(event) = handle.next_event().await {
        log.emit(event.clone());
        if events {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(event = "event.encode_failed", error = %e, "event.encode_failed"),
            }
        } else if !json {
            print_event(&event);
        }
    }
    let result = handle.join().await;
    tracing::info!(
        event = "run.finish",
        kind = "publish",
        status = if result.is_success() { "succeeded" } else { "failed" },
        "run.finish"
    );

    match result {
        JobResult::Success {
            manifest_path,
            assets,
            copy_failures,
            warning,
            stages,
            throughput,
        } => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "manifestPath": manifest_path,
                        "assets": assets,
                        "copyFailures": copy_failures,
                        "warning": warning,
                        "stages": stages,
                        "throughput": throughput,
                    })
                );
            } else if !events {
                println!("manifest={}", manifest_path.display());
                println!("assets={assets} copyFailures={copy_failures}");
                if let Some(rate) = throughput {
                    println!("speed={rate}");
                }
                if let Some(warning) = warning {
                    println!("warning={warning}");
                }
            }
            Ok(())
        }
        JobResult::Failure { reason } => Err(CliError::new("job.failed", reason)),
    }
}

fn manifest_run(
    settings: &Settings,
    data_dir: &Path,
    folder: &str,
    publish_root: &Path,
    json: bool,
) -> Result<(), CliError> {
    validate_settings(settings).map_err(map_core_err)?;
    let run_id = format!("man_{}", uuid::Uuid::new_v4());
    let log = JobLog::open(RunKind::Manifest, &run_id, data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;
    log.emit(JobEvent::Phase {
        phase: JobPhase::Manifest,
    });

    let asset_dir = publish_root.join(folder);
    if !asset_dir.is_dir() {
        return Err(CliError::new("manifest.folder_missing", "folder not found in publish root")
            .with_details(serde_json::json!({ "path": asset_dir })));
    }

    let config = settings.pipeline_config();
    let rows = build_manifest(
        &asset_dir,
        publish_root,
        &settings.identity(),
        &config.cdn_base,
        &config.assets,
    )
    .map_err(map_core_err)?;
    let path = manifest_path(
        publish_root,
        folder,
        &config.manifest_suffix,
        &config.manifest_extension,
    );
    write_manifest(&path, &rows).map_err(map_core_err)?;
    tracing::info!(event = "manifest.written", rows = rows.len() as u64, "manifest.written");
    log.emit(JobEvent::log(format!("manifest saved: {}", path.display())));

    if json {
        println!(
            "{}",
            serde_json::json!({ "manifestPath": path, "rows": rows.len() })
        );
    } else {
        println!("manifest={}", path.display());
        println!("rows={}", rows.len());
    }
    Ok(())
}

fn print_event(event: &JobEvent) {
    match event {
        JobEvent::Log { at, message } => {
            println!("[{}] {message}", at.format("%Y-%m-%d %H:%M:%S"));
        }
        JobEvent::Progress(p) => {
            println!("progress {} {}/{}", p.phase.as_str(), p.done, p.total);
        }
        JobEvent::Throughput(t) => println!("speed {}", t.rate),
        JobEvent::Phase { .. } | JobEvent::Finished { .. } => {}
    }
}

fn resolve_publish_root(flag: Option<PathBuf>, settings: &Settings) -> Result<PathBuf, CliError> {
    match flag.or_else(|| settings.publish_root()) {
        Some(root) => Ok(root),
        None => std::env::current_dir()
            .map_err(|e| CliError::new("config.invalid", format!("no publish root: {e}"))),
    }
}

fn default_config_dir() -> PathBuf {
    app_dir(env_non_empty("XDG_CONFIG_HOME"), env_non_empty("HOME"), ".config")
}

fn default_data_dir() -> PathBuf {
    app_dir(env_non_empty("XDG_DATA_HOME"), env_non_empty("HOME"), ".local/share")
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn app_dir(xdg: Option<String>, home: Option<String>, home_relative: &str) -> PathBuf {
    match (xdg, home) {
        (Some(xdg), _) => PathBuf::from(xdg).join(APP_NAME),
        (None, home) => PathBuf::from(home.unwrap_or_else(|| ".".to_string()))
            .join(home_relative)
            .join(APP_NAME),
    }
}

fn map_core_err(e: cdnpush_core::Error) -> CliError {
    match e {
        cdnpush_core::Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        cdnpush_core::Error::NonUtf8Path { path } => {
            CliError::new("path.non_utf8", "path is not valid UTF-8")
                .with_details(serde_json::json!({ "path": path }))
        }
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
