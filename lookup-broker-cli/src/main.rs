//! lookup-broker CLI
//!
//! Operator front end for the broker: stands in for the chat transport and
//! exposes every dispatcher and ledger operation as a subcommand.
//!
//! Usage:
//!   lookup-broker init
//!   lookup-broker onboard 1001 --name "Some One" --start 1000
//!   lookup-broker lookup number 9990001111 --caller 1001
//!   lookup-broker input "+91 99900 01111" --caller 1001
//!   lookup-broker credit add 1001 10
//!   lookup-broker code create --credits 5
//!   lookup-broker stats --json

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lookup_broker_core::ledger::ListedIdentifier;
use lookup_broker_core::{
    AccountId, BalanceMode, BalanceOutcome, BrokerConfig, Delivery, Dispatcher, HttpSourceAdapter,
    InsertOutcome, LookupKind, LookupOutcome, OnboardOutcome, RedeemOutcome, SqliteLedger,
};

const GENERATED_CODE_LEN: usize = 10;

#[derive(Parser)]
#[command(name = "lookup-broker")]
#[command(about = "Credit-gated lookup broker")]
struct Cli {
    /// Broker configuration file
    #[arg(long, global = true, env = "BROKER_CONFIG", default_value = "config/broker.yaml")]
    config: PathBuf,

    /// Overrides the configured database URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and schema
    Init,

    /// First contact for a caller (no-op for returning callers)
    Onboard {
        id: AccountId,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Start parameter; a numeric value names the referrer
        #[arg(long)]
        start: Option<String>,
    },

    /// Run a lookup of the given kind
    Lookup {
        kind: LookupKind,
        query: String,
        #[arg(long)]
        caller: AccountId,
        /// Context id (e.g. a group chat), checked against free contexts
        #[arg(long)]
        context: Option<i64>,
        /// Where attachments are written
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Classify free text and look it up
    Input {
        text: String,
        #[arg(long)]
        caller: AccountId,
        #[arg(long)]
        context: Option<i64>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Show a caller's balance
    Balance { id: AccountId },

    /// Adjust a balance
    Credit {
        #[command(subcommand)]
        action: CreditAction,
    },

    Ban { id: AccountId },
    Unban { id: AccountId },

    /// Manage protected identifiers
    Protect {
        #[command(subcommand)]
        action: ProtectAction,
    },

    /// Manage blacklisted identifiers
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },

    /// Manage redeem codes
    Code {
        #[command(subcommand)]
        action: CodeAction,
    },

    /// Redeem a code for a caller
    Redeem { id: AccountId, code: String },

    /// Aggregate ledger statistics
    Stats,

    /// List every account id
    Accounts,
}

#[derive(Subcommand)]
enum CreditAction {
    Add { id: AccountId, amount: i64 },
    Deduct { id: AccountId, amount: i64 },
    Set { id: AccountId, amount: i64 },
}

#[derive(Subcommand)]
enum ProtectAction {
    Add {
        identifier: String,
        /// Acting admin; defaults to the configured owner
        #[arg(long)]
        by: Option<AccountId>,
    },
    Remove {
        identifier: String,
    },
    List,
}

#[derive(Subcommand)]
enum BlacklistAction {
    Add {
        identifier: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        by: Option<AccountId>,
    },
    Remove {
        identifier: String,
    },
    List,
}

#[derive(Subcommand)]
enum CodeAction {
    /// Create a code; a random one is generated when omitted
    Create {
        code: Option<String>,
        #[arg(long)]
        credits: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lookup_broker_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let url = cli
        .database_url
        .clone()
        .unwrap_or_else(|| config.database.resolve_url());
    let ledger = SqliteLedger::connect(&url, config.database.max_connections)
        .await
        .with_context(|| format!("Failed to open ledger at {url}"))?;
    let ledger = Arc::new(ledger);

    let source = Arc::new(HttpSourceAdapter::from_config(&config));
    let dispatcher = Dispatcher::new(ledger.clone(), source, &config);

    let result = run(&cli, &dispatcher, &url).await;

    dispatcher.shutdown().await;
    ledger.close().await;
    result
}

fn load_config(path: &Path) -> Result<BrokerConfig> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(BrokerConfig::default());
    }
    BrokerConfig::from_file(path).with_context(|| format!("Failed to load {}", path.display()))
}

async fn run(cli: &Cli, dispatcher: &Dispatcher, url: &str) -> Result<()> {
    let admin = dispatcher.policy().owner_id.unwrap_or_default();

    match &cli.command {
        Command::Init => {
            println!("✅ Ledger ready at {url}");
        }

        Command::Onboard {
            id,
            username,
            name,
            start,
        } => {
            let outcome = dispatcher
                .onboard(*id, username.as_deref(), name.as_deref(), start.as_deref())
                .await?;
            if cli.json {
                return print_json(outcome.account());
            }
            match outcome {
                OnboardOutcome::Onboarded { account, referrer } => {
                    println!("✅ Onboarded {} with {} credits", account.id, account.balance);
                    match referrer {
                        Some(referrer) => println!("🎁 Referrer: {referrer}"),
                        None => println!("🎁 Referrer: Direct"),
                    }
                }
                OnboardOutcome::Returning(account) => {
                    println!("👋 Welcome back {} ({} credits)", account.id, account.balance);
                }
            }
        }

        Command::Lookup {
            kind,
            query,
            caller,
            context,
            out_dir,
        } => {
            let req = dispatcher.request_for(*caller, *kind, query.clone(), *context);
            let outcome = dispatcher.lookup(req).await?;
            print_outcome(cli, dispatcher, &outcome, out_dir)?;
        }

        Command::Input {
            text,
            caller,
            context,
            out_dir,
        } => match dispatcher.lookup_input(*caller, text, *context).await? {
            Some(outcome) => print_outcome(cli, dispatcher, &outcome, out_dir)?,
            None => println!("⚠️ Could not tell what kind of lookup that is."),
        },

        Command::Balance { id } => match dispatcher.balance(*id).await? {
            Some(balance) if cli.json => print_json(&serde_json::json!({ "id": id, "balance": balance }))?,
            Some(balance) => println!("💳 Credits: {balance}"),
            None => println!("❌ Unknown account {id}"),
        },

        Command::Credit { action } => {
            let (id, amount, mode) = match action {
                CreditAction::Add { id, amount } => (*id, *amount, BalanceMode::Add),
                CreditAction::Deduct { id, amount } => (*id, *amount, BalanceMode::Deduct),
                CreditAction::Set { id, amount } => (*id, *amount, BalanceMode::Set),
            };
            match dispatcher.adjust_balance(id, amount, mode).await? {
                BalanceOutcome::Applied(balance) => println!("✅ {id} now has {balance} credits"),
                BalanceOutcome::Insufficient => println!("❌ {id} has fewer than {amount} credits"),
                BalanceOutcome::UnknownAccount => println!("❌ Unknown account {id}"),
            }
        }

        Command::Ban { id } => report_found(dispatcher.set_banned(*id, true).await?, *id, "banned"),
        Command::Unban { id } => {
            report_found(dispatcher.set_banned(*id, false).await?, *id, "unbanned")
        }

        Command::Protect { action } => match action {
            ProtectAction::Add { identifier, by } => {
                let outcome = dispatcher.protect(identifier, by.unwrap_or(admin)).await?;
                report_insert(outcome, identifier, "protected");
            }
            ProtectAction::Remove { identifier } => {
                report_removed(dispatcher.unprotect(identifier).await?, identifier, "protected");
            }
            ProtectAction::List => print_listed(cli, "Protected", &dispatcher.protected().await?)?,
        },

        Command::Blacklist { action } => match action {
            BlacklistAction::Add {
                identifier,
                category,
                by,
            } => {
                let outcome = dispatcher
                    .blacklist(identifier, category.as_deref(), by.unwrap_or(admin))
                    .await?;
                report_insert(outcome, identifier, "blacklisted");
            }
            BlacklistAction::Remove { identifier } => {
                report_removed(dispatcher.unblacklist(identifier).await?, identifier, "blacklisted");
            }
            BlacklistAction::List => {
                print_listed(cli, "Blacklisted", &dispatcher.blacklisted().await?)?
            }
        },

        Command::Code {
            action: CodeAction::Create { code, credits },
        } => {
            let code = code.clone().unwrap_or_else(random_code);
            match dispatcher.create_code(&code, *credits).await? {
                InsertOutcome::Created => {
                    println!("✅ Redeem code created: {} ({credits} credits)", code.to_uppercase())
                }
                InsertOutcome::Duplicate => println!("❌ Code {} already exists", code.to_uppercase()),
            }
        }

        Command::Redeem { id, code } => match dispatcher.redeem(*id, code).await? {
            RedeemOutcome::Redeemed { credits, balance } => {
                println!("✅ Redeemed {credits} credits. Balance: {balance}")
            }
            RedeemOutcome::InvalidCode => println!("❌ Invalid code"),
            RedeemOutcome::AlreadyUsed => println!("❌ Code already used"),
        },

        Command::Stats => {
            let stats = dispatcher.stats().await?;
            if cli.json {
                return print_json(&stats);
            }
            println!("👥 Total users: {}", stats.total_accounts);
            println!("🟢 Active (24h): {}", stats.active_accounts);
            println!("🚫 Banned: {}", stats.banned_accounts);
            println!("🔍 Total searches: {}", stats.total_searches);
            println!("🤝 Total referrals: {}", stats.total_referrals);
            println!("💳 Outstanding credits: {}", stats.total_balance);
        }

        Command::Accounts => {
            let ids = dispatcher.account_ids().await?;
            if cli.json {
                return print_json(&ids);
            }
            for id in ids {
                println!("{id}");
            }
        }
    }
    Ok(())
}

fn print_outcome(
    cli: &Cli,
    dispatcher: &Dispatcher,
    outcome: &LookupOutcome,
    out_dir: &Path,
) -> Result<()> {
    match outcome {
        LookupOutcome::Denied(reason) => println!("❌ {}", reason.message()),
        LookupOutcome::FetchFailed(failure) => println!("❌ Error: {failure}"),
        LookupOutcome::Report(report) if cli.json => print_json(report)?,
        LookupOutcome::Report(report) => match dispatcher.deliver(report) {
            Delivery::Inline(text) => println!("{text}"),
            Delivery::Attachment { file_name, body } => {
                let path = out_dir.join(&file_name);
                std::fs::write(&path, body)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("📎 Result too long, saved to {}", path.display());
            }
        },
    }
    Ok(())
}

fn print_listed(cli: &Cli, heading: &str, listed: &[ListedIdentifier]) -> Result<()> {
    if cli.json {
        return print_json(&listed);
    }
    if listed.is_empty() {
        println!("No {} identifiers.", heading.to_lowercase());
        return Ok(());
    }
    println!("{heading}:");
    for entry in listed {
        match &entry.category {
            Some(category) => println!("• {} [{category}]", entry.identifier),
            None => println!("• {}", entry.identifier),
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_found(found: bool, id: AccountId, verb: &str) {
    if found {
        println!("✅ {id} {verb}");
    } else {
        println!("❌ Unknown account {id}");
    }
}

fn report_insert(outcome: InsertOutcome, identifier: &str, list: &str) {
    match outcome {
        InsertOutcome::Created => println!("✅ {identifier} is now {list}"),
        InsertOutcome::Duplicate => println!("ℹ️ {identifier} was already {list}"),
    }
}

fn report_removed(removed: bool, identifier: &str, list: &str) {
    if removed {
        println!("✅ {identifier} is no longer {list}");
    } else {
        println!("ℹ️ {identifier} was not {list}");
    }
}

fn random_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_CODE_LEN)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}
