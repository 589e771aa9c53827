mod config;
mod controller;
mod creds;
mod inventory;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use controller::{ConfigSource, Controller};
use nauto_devices::PushLevel;
use nauto_model::TransactionId;
use nauto_security::KeyringStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nauto", about = "Network configuration controller CLI")]
struct Cli {
    /// Device inventory file (ignored by `creds` subcommands)
    #[arg(long, global = true, default_value = "inventory.yaml")]
    inventory: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a NETCONF session to a device (connection-change{open})
    Connect {
        #[arg(long)]
        device: String,
    },
    /// Close a device's session (connection-change{close})
    Disconnect {
        #[arg(long)]
        device: String,
    },
    /// Disconnect then reconnect a device (connection-change{reconnect})
    Reconnect {
        #[arg(long)]
        device: String,
    },
    /// Sync a device's running configuration into a fresh candidate (config-pull)
    Pull {
        #[arg(long)]
        device: String,
        /// Discard the pulled config after diffing instead of keeping it as a candidate
        #[arg(long, default_value_t = false)]
        transient: bool,
    },
    /// Diff running candidates before an edit-config is ever sent (controller-commit)
    Commit {
        #[arg(long)]
        device: String,
        #[arg(long, default_value = "running")]
        source: String,
        #[arg(long, default_value = "none")]
        push: String,
        /// Push at level `none` anyway even if a pending diff exists
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value = "cli")]
        origin: String,
    },
    /// Render a text diff between two named configuration snapshots (datastore-diff)
    Diff {
        #[arg(long)]
        device: String,
        #[arg(long)]
        type1: String,
        #[arg(long)]
        type2: String,
    },
    /// Apply key=value substitutions to a device's candidate (device-template-apply)
    ApplyTemplate {
        #[arg(long)]
        device: String,
        #[arg(long)]
        template: String,
        #[arg(long = "var")]
        vars: Vec<String>,
    },
    /// Manage cross-device transactions directly
    Transactions(TransactionsCmd),
    /// Print every known device's connection state and the transaction ledger
    Status,
    /// Store or resolve device credentials via the OS keychain
    Creds(CredsCmd),
}

#[derive(Args)]
struct TransactionsCmd {
    #[command(subcommand)]
    action: TransactionsAction,
}

#[derive(Subcommand)]
enum TransactionsAction {
    /// transaction-new
    New {
        #[arg(long)]
        origin: String,
    },
    /// transaction-error
    Cancel {
        #[arg(long)]
        tid: u64,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Args)]
struct CredsCmd {
    #[command(subcommand)]
    action: CredsAction,
}

#[derive(Subcommand)]
enum CredsAction {
    Store {
        #[arg(long)]
        name: String,
        #[arg(long)]
        username: String,
        #[arg(
            long,
            help = "Provide the password directly (not recommended; use only in CI)",
            conflicts_with_all = ["password_stdin", "password_prompt"]
        )]
        password: Option<String>,
        #[arg(
            long = "password-stdin",
            default_value_t = false,
            help = "Read the password from STDIN (trailing newlines are trimmed)",
            conflicts_with = "password_prompt"
        )]
        password_stdin: bool,
        #[arg(
            long = "password-prompt",
            default_value_t = false,
            help = "Force an interactive password prompt even if STDIN is piped"
        )]
        password_prompt: bool,
    },
    Resolve {
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let store = KeyringStore::new("nauto");

    if let Commands::Creds(cmd) = cli.command {
        return match cmd.action {
            CredsAction::Store { name, username, password, password_stdin, password_prompt } => {
                creds::store(&store, name, username, password, password_stdin, password_prompt).await
            }
            CredsAction::Resolve { name } => creds::resolve(&store, name).await,
        };
    }

    let controller = Arc::new(Controller::new(store)?);
    let inventory = inventory::load(&cli.inventory)
        .with_context(|| format!("loading inventory from {:?}", cli.inventory))?;
    controller.load_inventory(inventory.devices).await?;

    match cli.command {
        Commands::Connect { device } => controller.connect(&device).await?,
        Commands::Disconnect { device } => controller.disconnect(&device).await?,
        Commands::Reconnect { device } => controller.reconnect(&device).await?,
        Commands::Pull { device, transient } => {
            let names = controller.pull(&device, transient).await?;
            println!("pulled: {}", names.join(", "));
        }
        Commands::Commit { device, source, push, force, origin } => {
            let source: ConfigSource = source.parse()?;
            let push = parse_push_level(&push)?;
            let outcome = controller.commit(&device, source, push, force, &origin).await?;
            println!(
                "tid={} state={:?} reason={}",
                outcome.tid,
                outcome.state,
                outcome.reason.as_deref().unwrap_or("-")
            );
        }
        Commands::Diff { device, type1, type2 } => {
            let rendered = controller.diff(&device, &type1, &type2).await?;
            print!("{rendered}");
        }
        Commands::ApplyTemplate { device, template, vars } => {
            let vars = parse_vars(&vars)?;
            let names = controller.apply_template(&device, &template, &vars).await?;
            println!("template '{template}' applied to: {}", names.join(", "));
        }
        Commands::Transactions(cmd) => match cmd.action {
            TransactionsAction::New { origin } => {
                let tid = controller.transaction_new(&origin).await;
                println!("tid={tid}");
            }
            TransactionsAction::Cancel { tid, reason } => {
                controller.transaction_cancel(TransactionId(tid), &reason).await?;
                println!("cancelled tid={tid}");
            }
        },
        Commands::Status => {
            let (devices, transactions) = controller.status().await?;
            for d in devices {
                println!("{:<24} {:<14} {}", d.name, d.conn_state, d.log_msg.as_deref().unwrap_or("-"));
            }
            for t in transactions {
                println!(
                    "tid={} origin={} state={} reason={}",
                    t.tid,
                    t.origin,
                    t.state,
                    t.reason.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Creds(_) => unreachable!("handled above"),
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();
}

fn parse_push_level(s: &str) -> Result<PushLevel> {
    match s {
        "none" => Ok(PushLevel::None),
        "validate" => Ok(PushLevel::Validate),
        "commit" => Ok(PushLevel::Commit),
        other => Err(anyhow!("unknown push level '{other}' (expected none|validate|commit)")),
    }
}

fn parse_vars(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("--var must be key=value, got '{kv}'"))
        })
        .collect()
}
