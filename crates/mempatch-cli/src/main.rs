mod cli;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Args, Command};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mempatch_common::hook::Hook;
use mempatch_common::patch::PatchPack;
use mempatch_manager::{Manager, SettingsStore};

fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mempatch=info,mempatch_manager=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let settings = SettingsStore::open(&args.settings)
        .with_context(|| format!("could not open settings {}", args.settings.display()))?;
    let manager = Manager::new(settings);
    let port = args.port.unwrap_or_else(|| manager.default_port());

    match args.command {
        Command::Launch { hooks, packs } => {
            register_definitions(&manager, &hooks, &packs)?;
            let core_id = manager
                .launch_target(port)
                .context("could not launch the target")?;
            info!(core = core_id, "target launched and core connected");
            wait_for_cores(&manager);
        }
        Command::Serve {
            hooks,
            packs,
            timeout,
        } => {
            register_definitions(&manager, &hooks, &packs)?;
            info!(port, "waiting for a core to connect");
            let core_id = manager
                .serve_one(port, Duration::from_secs(timeout))
                .context("no core connected")?;
            info!(core = core_id, "core connected");
            wait_for_cores(&manager);
        }
    }
    Ok(())
}

fn register_definitions(manager: &Manager, hooks: &[PathBuf], packs: &[PathBuf]) -> Result<()> {
    for path in hooks {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read hook file {}", path.display()))?;
        let hook: Hook = serde_json::from_str(&content)
            .with_context(|| format!("invalid hook definition {}", path.display()))?;
        let name = hook.name.clone();
        manager
            .register_hook(hook)
            .with_context(|| format!("could not register hook `{}'", name))?;
        info!(hook = %name, "hook registered");
    }
    for path in packs {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read pack file {}", path.display()))?;
        let pack: PatchPack = serde_json::from_str(&content)
            .with_context(|| format!("invalid patch pack definition {}", path.display()))?;
        let name = pack.info.name.clone();
        manager
            .add_pack(pack)
            .with_context(|| format!("could not add patch pack `{}'", name))?;
        info!(pack = %name, "patch pack added");
    }
    Ok(())
}

/// Block until the last core goes away.
fn wait_for_cores(manager: &Manager) {
    while !manager.cores().connected_cores().is_empty() {
        std::thread::sleep(Duration::from_millis(200));
    }
    info!("all cores disconnected");
}
