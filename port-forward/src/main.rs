//! Interactive REPL for the port-forward rule engine.
//!
//! Commands: `add`, `remove`, `enable`, `disable`, `list`, `start`, `stop`,
//! `save`, `load`, `help`, `quit`/`exit`. An invalid command's arguments
//! print a usage line and leave the rule table untouched.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use port_forward::ForwardManager;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "forward.conf";

#[derive(Parser, Debug)]
#[command(name = "port-forward", about = "TCP port-forwarding rule engine")]
struct Args {
    /// Config file to load at startup, if present.
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let manager = Arc::new(ForwardManager::new());

    if let Some(path) = &args.config_file {
        match manager.load_config(path).await {
            Ok(()) => println!("loaded rules from {}", path.display()),
            Err(e) => println!("failed to load {}: {e}", path.display()),
        }
    }

    println!("port-forward ready. type 'help' for commands.");
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut sigint = Box::pin(tokio::signal::ctrl_c());

    print!("> ");
    flush_stdout();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if !line.is_empty() && !handle_command(&manager, line).await {
                    break;
                }
                print!("> ");
                flush_stdout();
            }
            _ = &mut sigint => {
                println!("\nreceived ctrl-c, shutting down");
                manager.stop().await;
                break;
            }
        }
    }

    Ok(())
}

fn flush_stdout() {
    use std::io::Write;
    let _ = std::io::stdout().flush();
}

/// Dispatches one REPL command. Returns `false` to stop the REPL.
async fn handle_command(manager: &Arc<ForwardManager>, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("").to_ascii_lowercase();
    let rest: Vec<&str> = parts.collect();

    match command.as_str() {
        "add" => cmd_add(manager, &rest).await,
        "remove" => cmd_remove(manager, &rest).await,
        "enable" => cmd_toggle(manager, &rest, true).await,
        "disable" => cmd_toggle(manager, &rest, false).await,
        "list" => cmd_list(manager).await,
        "start" => cmd_start(manager).await,
        "stop" => cmd_stop(manager).await,
        "save" => cmd_save(manager, &rest).await,
        "load" => cmd_load(manager, &rest).await,
        "help" => print_help(),
        "quit" | "exit" => return false,
        other => println!("unknown command '{other}'. type 'help' for commands."),
    }
    true
}

async fn cmd_add(manager: &Arc<ForwardManager>, args: &[&str]) {
    if args.len() < 3 {
        println!("usage: add <listen_port> <target_host> <target_port> [description...]");
        return;
    }
    let (listen_port, target_port) = match (args[0].parse(), args[2].parse()) {
        (Ok(l), Ok(t)) => (l, t),
        _ => {
            println!("usage: add <listen_port> <target_host> <target_port> [description...]");
            return;
        }
    };
    let description = if args.len() > 3 {
        Some(args[3..].join(" "))
    } else {
        None
    };
    match manager
        .add_rule(listen_port, args[1].to_string(), target_port, description)
        .await
    {
        Ok(id) => println!("added rule {id}"),
        Err(e) => println!("error: {e}"),
    }
}

async fn cmd_remove(manager: &Arc<ForwardManager>, args: &[&str]) {
    let Some(id) = parse_id(args, "remove <id>") else {
        return;
    };
    match manager.remove_rule(id).await {
        Ok(()) => println!("removed rule {id}"),
        Err(e) => println!("error: {e}"),
    }
}

async fn cmd_toggle(manager: &Arc<ForwardManager>, args: &[&str], enable: bool) {
    let usage = if enable { "enable <id>" } else { "disable <id>" };
    let Some(id) = parse_id(args, usage) else {
        return;
    };
    let result = if enable {
        manager.enable_rule(id).await
    } else {
        manager.disable_rule(id).await
    };
    match result {
        Ok(()) => println!("rule {id} {}", if enable { "enabled" } else { "disabled" }),
        Err(e) => println!("error: {e}"),
    }
}

async fn cmd_list(manager: &Arc<ForwardManager>) {
    let rules = manager.list_rules().await;
    if rules.is_empty() {
        println!("no rules configured");
        return;
    }
    println!(
        "{:<4} {:<8} {:<10} {:<22} {:<8} {}",
        "ID", "LISTEN", "ACTIVE", "TARGET", "", "DESCRIPTION"
    );
    for rule in rules {
        println!(
            "{:<4} {:<8} {:<10} {:<22} {}",
            rule.id,
            rule.listen_port,
            if rule.active { "yes" } else { "no" },
            format!("{}:{}", rule.target_host, rule.target_port),
            rule.description,
        );
    }
}

async fn cmd_start(manager: &Arc<ForwardManager>) {
    match manager.start().await {
        Ok(()) => println!("engine started"),
        Err(e) => println!("error: {e}"),
    }
}

async fn cmd_stop(manager: &Arc<ForwardManager>) {
    manager.stop().await;
    println!("engine stopped");
}

async fn cmd_save(manager: &Arc<ForwardManager>, args: &[&str]) {
    let path = PathBuf::from(args.first().copied().unwrap_or(DEFAULT_CONFIG_FILE));
    match manager.save_config(&path).await {
        Ok(()) => println!("saved rules to {}", path.display()),
        Err(e) => println!("error: {e}"),
    }
}

async fn cmd_load(manager: &Arc<ForwardManager>, args: &[&str]) {
    let path = PathBuf::from(args.first().copied().unwrap_or(DEFAULT_CONFIG_FILE));
    match manager.load_config(&path).await {
        Ok(()) => println!("loaded rules from {}", path.display()),
        Err(e) => println!("error: {e}"),
    }
}

fn parse_id(args: &[&str], usage: &str) -> Option<u32> {
    match args.first().and_then(|s| s.parse().ok()) {
        Some(id) => Some(id),
        None => {
            println!("usage: {usage}");
            None
        }
    }
}

fn print_help() {
    println!("commands:");
    println!("  add <listen_port> <target_host> <target_port> [description...]");
    println!("  remove <id>");
    println!("  enable <id>");
    println!("  disable <id>");
    println!("  list");
    println!("  start");
    println!("  stop");
    println!("  save [file]");
    println!("  load [file]");
    println!("  help");
    println!("  quit | exit");
}
