//! `terrafuse` – build and inspect a tiled elevation map from sensor frames.
//!
//! ```text
//! terrafuse [--config <path>] init-config [--force]
//! terrafuse [--config <path>] fuse <frame.json>...
//! terrafuse [--config <path>] inspect <sx> <sy>
//! ```
//!
//! Settings come from `~/.terrafuse/config.toml` (or `--config`), with
//! `TERRAFUSE_*` environment overrides.  Errors are printed and the process
//! exits with status 1.

mod config;
mod frame;
mod pipeline;
mod telemetry;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use colored::Colorize;
use tracing::info;

use terrafuse_map::{DemFusionEngine, StoreError, TileStore, TileSummary, open_store};
use terrafuse_perception::PointCloudTransformer;
use terrafuse_types::TileId;

use crate::frame::Frame;

#[derive(Debug, PartialEq)]
enum Command {
    InitConfig { force: bool },
    Fuse { frames: Vec<PathBuf> },
    Inspect { tile: TileId },
    Help,
}

#[derive(Debug, PartialEq)]
struct Invocation {
    config: Option<PathBuf>,
    command: Command,
}

fn main() -> ExitCode {
    let _guard = telemetry::init_tracing("terrafuse");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match parse_args(&args) {
        Ok(inv) => inv,
        Err(e) => {
            eprintln!("{}: {}", "Usage error".red(), e);
            print_usage();
            return ExitCode::FAILURE;
        }
    };
    let config_path = invocation.config.unwrap_or_else(config::config_path);

    let result = match invocation.command {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::InitConfig { force } => cmd_init_config(&config_path, force),
        Command::Fuse { frames } => cmd_fuse(&config_path, &frames),
        Command::Inspect { tile } => cmd_inspect(&config_path, tile),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument parsing
// ─────────────────────────────────────────────────────────────────────────────

fn parse_args(args: &[String]) -> Result<Invocation, String> {
    let mut config = None;
    let mut rest = args;
    while let [flag, tail @ ..] = rest {
        match flag.as_str() {
            "--config" | "-c" => {
                let [path, tail @ ..] = tail else {
                    return Err("--config needs a path".to_string());
                };
                config = Some(PathBuf::from(path));
                rest = tail;
            }
            _ => break,
        }
    }

    let command = match rest {
        [] => Command::Help,
        [cmd, args @ ..] => match cmd.as_str() {
            "help" | "--help" | "-h" => Command::Help,
            "init-config" => match args {
                [] => Command::InitConfig { force: false },
                [f] if f == "--force" => Command::InitConfig { force: true },
                _ => return Err("init-config takes only --force".to_string()),
            },
            "fuse" => {
                if args.is_empty() {
                    return Err("fuse needs at least one frame file".to_string());
                }
                Command::Fuse {
                    frames: args.iter().map(PathBuf::from).collect(),
                }
            }
            "inspect" => match args {
                [sx, sy] => {
                    let parse = |s: &str| s.parse::<i64>().map_err(|_| format!("'{s}' is not a tile index"));
                    Command::Inspect {
                        tile: TileId::new(parse(sx.as_str())?, parse(sy.as_str())?),
                    }
                }
                _ => return Err("inspect needs <sx> <sy>".to_string()),
            },
            other => return Err(format!("unknown command '{other}'")),
        },
    };
    Ok(Invocation { config, command })
}

fn print_usage() {
    println!();
    println!("  {} {}", "terrafuse".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Tiled elevation-map fusion");
    println!();
    println!("  {}", "Usage:".bold());
    println!("    terrafuse [--config <path>] init-config [--force]   write a default config");
    println!("    terrafuse [--config <path>] fuse <frame.json>...    fuse sensor frames into the map");
    println!("    terrafuse [--config <path>] inspect <sx> <sy>       show statistics of one tile");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_init_config(path: &Path, force: bool) -> Result<(), String> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    config::save_to(&config::Config::default(), path)?;
    println!(
        "  {} Config written to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

fn cmd_fuse(config_path: &Path, frames: &[PathBuf]) -> Result<(), String> {
    let cfg = config::resolve(config_path)?;
    let store = open_store(&cfg.storage).map_err(|e| e.to_string())?;
    info!(
        backend = %cfg.storage.backend,
        root = %cfg.storage.root.display(),
        frames = frames.len(),
        "starting fusion run"
    );

    let mut engine = DemFusionEngine::new(cfg.map.clone(), store);
    engine.init(cfg.map.width, cfg.map.height).map_err(|e| e.to_string())?;
    let mut transformer = PointCloudTransformer::new(cfg.robot_frame.clone(), cfg.fixed_frame.clone());

    let summary = pipeline::fuse_frames(&mut engine, &mut transformer, frames.iter().map(|p| Frame::load(p)))?;

    println!();
    println!("  {}", "Fusion complete".green().bold());
    println!("    frames    {}", summary.frames);
    println!("    points    {} ({} binned)", summary.points, summary.binned);
    println!("    adopted   {}", summary.adopted);
    println!("    combined  {}", summary.combined);
    println!("    skipped   {}", summary.skipped);
    println!("    swaps     {}", summary.swaps);
    if let Some(id) = engine.current_id() {
        println!("    current   {}", id.to_string().bold());
    }
    println!();
    Ok(())
}

fn cmd_inspect(config_path: &Path, tile: TileId) -> Result<(), String> {
    let cfg = config::resolve(config_path)?;
    let store = open_store(&cfg.storage).map_err(|e| e.to_string())?;
    match store.load(tile) {
        Ok(t) => {
            print_summary(&t.summary());
            Ok(())
        }
        Err(StoreError::NotFound(id)) => Err(format!(
            "tile {id} has not been saved under {}",
            cfg.storage.root.display()
        )),
        Err(e) => Err(e.to_string()),
    }
}

fn print_summary(s: &TileSummary) {
    let range = match (s.min_elevation, s.max_elevation) {
        (Some(lo), Some(hi)) => format!("{lo:.3} .. {hi:.3} m"),
        _ => "-".dimmed().to_string(),
    };
    println!();
    println!("  Tile {}  ({}x{} cells)", s.id.to_string().bold(), s.width, s.height);
    println!("    observed      {}", s.observed.to_string().green());
    println!("    ground prior  {}", s.ground_prior.to_string().yellow());
    println!("    unknown       {}", s.unknown.to_string().dimmed());
    println!("    elevation     {range}");
    println!(
        "    updated       {}",
        s.updated_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
    );
    println!();
}
