//! `valet onboard`: seed the config directory and workspace files.

use std::path::Path;

use anyhow::{Context, Result};

use valet_config::Config;

const AGENTS_TEMPLATE: &str = "# Agent Instructions\n\n\
You are a personal assistant reachable over chat. Be concise, act on the\n\
user's behalf, and prefer doing over explaining.\n";

const SOUL_TEMPLATE: &str = "# Soul\n\n\
Friendly, direct, occasionally dry. You remember context across the\n\
conversation and admit when you don't know something.\n";

const HEARTBEAT_TEMPLATE: &str = "";

const MEMORY_TEMPLATE: &str = "# Memory\n";

pub fn run(cfg: &Config) -> Result<()> {
    let config_dir = valet_config::ensure_config_dir()?;
    let config_file = config_dir.join("config.toml");
    if !config_file.exists() {
        valet_config::save_config(cfg)?;
        println!("created {}", config_file.display());
    } else {
        println!("kept    {}", config_file.display());
    }

    let workspace = cfg.workspace_dir();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("create workspace {}", workspace.display()))?;
    std::fs::create_dir_all(workspace.join("skills")).context("create skills directory")?;

    seed(&workspace, "AGENTS.md", AGENTS_TEMPLATE)?;
    seed(&workspace, "SOUL.md", SOUL_TEMPLATE)?;
    seed(&workspace, "HEARTBEAT.md", HEARTBEAT_TEMPLATE)?;
    seed(&workspace, "MEMORY.md", MEMORY_TEMPLATE)?;

    println!("\nworkspace ready at {}", workspace.display());
    println!("next: set VALET_API_KEY (or ANTHROPIC_API_KEY) and run `valet gateway`");
    Ok(())
}

fn seed(workspace: &Path, name: &str, content: &str) -> Result<()> {
    let path = workspace.join(name);
    if path.exists() {
        println!("kept    {}", path.display());
        return Ok(());
    }
    std::fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
    println!("created {}", path.display());
    Ok(())
}
