//! `valet skills`: manage the workspace skills directory from built-in
//! templates.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Subcommand;

use valet_config::Config;

#[derive(Subcommand)]
pub enum SkillsCommand {
    /// List installed skills
    List,
    /// Install built-in skills (skip existing)
    Install { name: Option<String> },
    /// Update/reinstall skills (overwrite existing)
    Update { name: Option<String> },
    /// Uninstall a skill
    Uninstall { name: String },
    /// Verify skills integrity
    Verify,
}

/// Built-in skill templates shipped with the binary.
const BUILTIN_SKILLS: &[(&str, &str)] = &[
    (
        "daily-brief",
        "# daily-brief\n\nSummarize the user's day each morning: calendar, weather,\nand anything flagged in MEMORY.md. Schedule via `cron.add` with a\nsix-field expression like `0 0 8 * * *`.\n",
    ),
    (
        "notify",
        "# notify\n\nPush a message into a chat from a script, without an agent turn:\n\n```\nwscat -c ws://127.0.0.1:18790 \\\n  -x '{\"type\":\"req\",\"id\":\"1\",\"method\":\"notify.send\",\"params\":{\"chatId\":\"<id>\",\"message\":\"done\"}}'\n```\n",
    ),
];

pub fn run(cfg: &Config, command: SkillsCommand) -> Result<()> {
    let skills_dir = cfg.workspace_dir().join("skills");
    match command {
        SkillsCommand::List => list(&skills_dir),
        SkillsCommand::Install { name } => install(&skills_dir, name.as_deref(), false),
        SkillsCommand::Update { name } => install(&skills_dir, name.as_deref(), true),
        SkillsCommand::Uninstall { name } => uninstall(&skills_dir, &name),
        SkillsCommand::Verify => verify(&skills_dir),
    }
}

fn installed(skills_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(skills_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

fn list(skills_dir: &Path) -> Result<()> {
    let names = installed(skills_dir);
    if names.is_empty() {
        println!("no skills installed (try `valet skills install`)");
        return Ok(());
    }
    for name in names {
        let verified = skills_dir.join(&name).join("SKILL.md").exists();
        let marker = if verified { "" } else { "  (missing SKILL.md)" };
        println!("{name}{marker}");
    }
    Ok(())
}

fn install(skills_dir: &Path, only: Option<&str>, overwrite: bool) -> Result<()> {
    std::fs::create_dir_all(skills_dir).context("create skills directory")?;

    let mut matched = false;
    for (name, content) in BUILTIN_SKILLS {
        if only.is_some_and(|o| o != *name) {
            continue;
        }
        matched = true;
        let dir = skills_dir.join(name);
        let skill_file = dir.join("SKILL.md");
        if skill_file.exists() && !overwrite {
            println!("kept      {name}");
            continue;
        }
        std::fs::create_dir_all(&dir)?;
        std::fs::write(&skill_file, content)?;
        println!("installed {name}");
    }
    if !matched {
        bail!("unknown skill: {}", only.unwrap_or_default());
    }
    Ok(())
}

fn uninstall(skills_dir: &Path, name: &str) -> Result<()> {
    let dir = safe_skill_dir(skills_dir, name)?;
    if !dir.exists() {
        bail!("skill not installed: {name}");
    }
    std::fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
    println!("uninstalled {name}");
    Ok(())
}

fn verify(skills_dir: &Path) -> Result<()> {
    let names = installed(skills_dir);
    if names.is_empty() {
        println!("nothing to verify");
        return Ok(());
    }
    let mut broken = 0;
    for name in names {
        if skills_dir.join(&name).join("SKILL.md").exists() {
            println!("ok      {name}");
        } else {
            println!("broken  {name} (missing SKILL.md)");
            broken += 1;
        }
    }
    if broken > 0 {
        bail!("{broken} skill(s) failed verification");
    }
    Ok(())
}

/// Reject names that would escape the skills directory.
fn safe_skill_dir(skills_dir: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains('/') || name.contains("..") {
        bail!("invalid skill name: {name}");
    }
    Ok(skills_dir.join(name))
}
