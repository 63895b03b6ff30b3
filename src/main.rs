// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use kuvert_config::{Config, TransportKind};
use kuvert_core::{Agent, AgentEvent, SessionStatus};
use kuvert_envelope::Decision;
use kuvert_mcp::{DirectTransport, ServerRegistry, SseTransport, StdioTransport, Transport};
use kuvert_model::DecisionClient;
use kuvert_tools::Dispatcher;

const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPT: i32 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = kuvert_config::load(cli.config.as_deref())?;
    if let Some(transport) = cli.transport {
        config.mcp.transport = transport;
    }
    if let Some(max_cycles) = cli.max_cycles {
        config.agent.max_cycles = max_cycles;
    }
    if cli.auto {
        config.agent.auto_approve = true;
    }
    // Flag overrides can invalidate a config that loaded fine.
    kuvert_config::ensure_runnable(&config)?;
    let config = Arc::new(config);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml::to_string(config.as_ref()).unwrap_or_default());
                return Ok(());
            }
            Commands::ListTools => {
                let dispatcher = build_dispatcher(&config, cli.servers.as_deref())?;
                for tool in dispatcher.catalog().await {
                    println!("{tool}");
                }
                return Ok(());
            }
        }
    }

    let mut agent = build_agent(&config, cli.servers.as_deref())?;

    // Progress events go to a printer task; the agent itself never prints.
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<AgentEvent>(64);
    agent.set_event_sink(event_tx);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    match &cli.goal {
        Some(goal) => {
            let code = run_once(&mut agent, goal).await;
            std::process::exit(code);
        }
        None => {
            let code = run_repl(&mut agent).await?;
            std::process::exit(code);
        }
    }
}

fn build_dispatcher(
    config: &Arc<Config>,
    servers: Option<&std::path::Path>,
) -> anyhow::Result<Dispatcher> {
    let transport: Arc<dyn Transport> = match config.mcp.transport {
        TransportKind::Builtin => return Ok(Dispatcher::builtin(&config.tools)),
        TransportKind::Stdio => Arc::new(StdioTransport::new(
            config.mcp.server_command.clone(),
            std::time::Duration::from_secs(config.tools.timeout_secs),
        )),
        TransportKind::Sse | TransportKind::Direct => {
            let registry_path = servers.map(std::path::Path::to_path_buf).or_else(|| {
                config.mcp.servers_file.as_ref().map(std::path::PathBuf::from)
            });
            let registry = ServerRegistry::discover(registry_path.as_deref())
                .context("no mcpServers.json found; configure mcp.servers_file or --servers")?;
            let entry = registry
                .resolve(None)
                .context("could not select an MCP server")?;
            let timeout = std::time::Duration::from_secs(config.tools.timeout_secs);
            if config.mcp.transport == TransportKind::Sse {
                Arc::new(SseTransport::new(entry.url.clone(), timeout)) as Arc<dyn Transport>
            } else {
                Arc::new(DirectTransport::new(entry.url.clone(), timeout)?) as Arc<dyn Transport>
            }
        }
    };
    Ok(Dispatcher::with_transport(transport, &config.tools))
}

fn build_agent(config: &Arc<Config>, servers: Option<&std::path::Path>) -> anyhow::Result<Agent> {
    let provider: Arc<dyn kuvert_model::ModelProvider> =
        Arc::from(kuvert_model::from_config(&config.model)?);
    let client = DecisionClient::new(provider, config.agent.max_retries)
        .with_temperature(config.model.temperature);
    let dispatcher = build_dispatcher(config, servers)?;
    Ok(Agent::new(client, dispatcher, Arc::clone(config)))
}

/// Headless one-shot run.  Returns the process exit code.
async fn run_once(agent: &mut Agent, goal: &str) -> i32 {
    let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(());
        }
    });

    let outcome = agent.run_with_cancel(goal, &mut cancel_rx).await;
    print_outcome(&outcome.final_envelope);

    if matches!(&outcome.final_envelope.decision, Decision::Error { error }
        if error.error_type == "cancelled")
    {
        return EXIT_INTERRUPT;
    }
    if agent.session().status == SessionStatus::Waiting {
        eprintln!("[kuvert] run is waiting for approval; re-run interactively to approve");
        return EXIT_FAILURE;
    }
    if outcome.success {
        0
    } else {
        EXIT_FAILURE
    }
}

async fn run_repl(agent: &mut Agent) -> anyhow::Result<i32> {
    println!("kuvert interactive session — /help for commands");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("kuvert> ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(EXIT_INTERRUPT);
            }
        };
        let Some(line) = line else {
            // stdin closed
            return Ok(0);
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => return Ok(0),
            "/help" => {
                println!(
                    "/help            show this help\n\
                     /plan            show the current plan\n\
                     /stats           show cycle/token/time usage\n\
                     /approve         approve the pending action and resume\n\
                     /deny            deny the pending action and resume\n\
                     /clear           reset the session\n\
                     /auto on|off     toggle auto-approval\n\
                     /quit            exit"
                );
            }
            "/plan" => match &agent.session().plan {
                Some(plan) => println!("{}", serde_json::to_string_pretty(plan)?),
                None => println!("(no plan recorded)"),
            },
            "/stats" => {
                let s = agent.session();
                println!(
                    "cycles: {}  tokens: {}  elapsed: {:.1}s  status: {:?}",
                    s.cycles_used,
                    s.tokens_used,
                    s.elapsed_seconds(),
                    s.status
                );
            }
            "/approve" => match agent.resume_with_approval(true).await {
                Some(outcome) => print_outcome(&outcome.final_envelope),
                None => println!("(nothing is waiting for approval)"),
            },
            "/deny" => match agent.resume_with_approval(false).await {
                Some(outcome) => print_outcome(&outcome.final_envelope),
                None => println!("(nothing is waiting for approval)"),
            },
            "/clear" => {
                agent.reset();
                println!("(session cleared)");
            }
            "/auto on" => {
                agent.set_auto_approve(true);
                println!("auto-approve: on");
            }
            "/auto off" => {
                agent.set_auto_approve(false);
                println!("auto-approve: off");
            }
            goal if goal.starts_with('/') => {
                println!("unknown command {goal:?}; /help lists the commands");
            }
            goal => {
                let outcome = agent.run(goal).await;
                print_outcome(&outcome.final_envelope);
            }
        }
    }
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::CycleStarted(n) => eprintln!("[cycle {n}]"),
        AgentEvent::Decision { state, rationale } => {
            let r = rationale.as_deref().unwrap_or("");
            eprintln!("  -> {state}: {r}");
        }
        AgentEvent::ToolFinished {
            tool,
            success,
            duration_ms,
        } => {
            let status = if *success { "OK" } else { "FAIL" };
            eprintln!("  <- {tool} {status} ({duration_ms}ms)");
        }
        AgentEvent::BatchFinished { count, all_success } => {
            let status = if *all_success { "ALL OK" } else { "PARTIAL" };
            eprintln!("  <- {count} tools {status}");
        }
        AgentEvent::ApprovalRequested { tool, reason } => {
            eprintln!("  !! approval required for {tool}: {reason}");
        }
        AgentEvent::InputRequested { prompt } => eprintln!("  ?? {prompt}"),
        AgentEvent::Waiting { event_type } => eprintln!("  .. waiting for {event_type}"),
        AgentEvent::Reply { .. } => {}
        AgentEvent::Error { message } => eprintln!("  !! {message}"),
    }
}

fn print_outcome(envelope: &kuvert_envelope::Envelope) {
    match &envelope.decision {
        Decision::Reply { conversation } => println!("{}", conversation.utterance),
        Decision::Finish { finish } => println!("{}", finish.summary),
        Decision::Clarify { clarify } => println!("[clarify] {}", clarify.question),
        Decision::Confirm { confirm } => {
            println!("[confirm] {} — /approve or /deny", confirm.action)
        }
        Decision::AskHuman { reason } => println!(
            "[input needed] {}",
            reason.as_deref().unwrap_or("operator input required")
        ),
        Decision::Wait { wait } => println!("[waiting] {}", wait.event_type),
        Decision::Error { error } => {
            eprintln!("[error:{}] {}", error.error_type, error.error_message)
        }
        other => println!("[{}]", other.state()),
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
