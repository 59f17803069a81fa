use std::path::PathBuf;

use anyhow::Context;
use beso::{
    mesh::{build_model, load_mesh},
    solver::ExternalSolver,
    Optimizer, RunConfig,
};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Topology optimization by bi-directional evolutionary structural optimization
#[derive(Parser)]
#[command(name = "beso")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Mesh file, overriding the configured one. `-` keeps the configured mesh
    mesh: Option<PathBuf>,

    /// Run configuration
    #[arg(short, long, default_value = "beso_conf.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = RunConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(mesh) = cli.mesh.filter(|m| m.as_os_str() != "-") {
        config.mesh_file = mesh;
    }

    let mesh = load_mesh(&config.mesh_path())?;
    let model = build_model(&mesh, &config)?;
    let solver = ExternalSolver::new(&config);

    let mut optimizer = Optimizer::new(config, model, solver)?;
    let outcome = optimizer.run()?;
    info!("optimization finished: {outcome:?}");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Err(err) = run(cli) {
        error!("{err:#}");
        std::process::exit(1);
    }
    Ok(())
}
