//! `valet agent`: invoke the runtime without the gateway, single-shot or
//! REPL.

use std::io::{BufRead, Write};

use anyhow::Result;

use valet_agent::provider::ProviderRuntime;
use valet_agent::{AgentRequest, AgentRuntime};
use valet_config::Config;

const CLI_SESSION: &str = "cli";

pub async fn run(cfg: &Config, message: Option<String>) -> Result<()> {
    let system_prompt = read_system_prompt(cfg);
    let runtime = ProviderRuntime::new(
        cfg.provider.api_key.clone(),
        cfg.provider.base_url.as_deref(),
        cfg.agent.model.clone(),
        cfg.agent.max_tokens,
        system_prompt,
    )?;

    if let Some(message) = message {
        let response = runtime.run(AgentRequest::new(message, CLI_SESSION)).await?;
        println!("{}", response.output);
        return Ok(());
    }

    repl(&runtime).await
}

async fn repl(runtime: &ProviderRuntime) -> Result<()> {
    println!("valet agent REPL - /reset clears the session, /quit exits");
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    loop {
        print!("you> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" | "/exit" => break,
            "/reset" => {
                runtime.clear_session(CLI_SESSION).await?;
                println!("session cleared");
                continue;
            }
            _ => {}
        }
        match runtime.run(AgentRequest::new(line, CLI_SESSION)).await {
            Ok(response) => println!("{}", response.output),
            Err(e) => eprintln!("agent error: {e:#}"),
        }
    }
    Ok(())
}

fn read_system_prompt(cfg: &Config) -> String {
    let workspace = cfg.workspace_dir();
    let mut prompt = String::new();
    for file in ["AGENTS.md", "SOUL.md"] {
        if let Ok(data) = std::fs::read_to_string(workspace.join(file)) {
            prompt.push_str(&data);
            prompt.push_str("\n\n");
        }
    }
    prompt
}
