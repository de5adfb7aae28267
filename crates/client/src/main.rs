//! ConnectSuite command-line client.
//!
//! Signs in over the auth socket, links messaging accounts by QR code and
//! sends bulk messages through the REST API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use connectsuite_client::logging::init_tracing;
use connectsuite_client::{
    AuthPoller, BulkDispatchScheduler, ClientConfig, ConnectionChannel, DelayRange, DispatchMode,
    DispatchOutcome, DispatchRequest, HandshakeOutcome, SessionStore, WhatsAppApi,
};
use connectsuite_shared::{Contact, LoginRequest, MessageLogQuery, RegisterRequest};

#[derive(Parser)]
#[command(name = "connectsuite", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and remember the session.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account. Does not sign in.
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Sign out and forget the stored session.
    Logout,
    /// Show who is signed in.
    Whoami,
    /// Link a messaging account by scanning a QR code.
    Link,
    /// List linked accounts.
    Accounts,
    /// Remove a linked account.
    Unlink { id: String },
    /// Send a message to many contacts.
    Send {
        /// Linked account to send from
        #[arg(long)]
        account: String,
        /// Template; `{name}` becomes each contact's name
        #[arg(long, default_value = "")]
        message: String,
        /// Recipient as PHONE or PHONE:NAME; repeatable
        #[arg(long = "to", value_name = "PHONE[:NAME]")]
        to: Vec<String>,
        /// JSON array of contacts ({phone, name?, message?})
        #[arg(long)]
        contacts: Option<PathBuf>,
        /// Send one by one now instead of scheduling a batch
        #[arg(long)]
        immediate: bool,
        #[arg(long, default_value_t = 5)]
        min_delay: u64,
        #[arg(long, default_value_t = 10)]
        max_delay: u64,
    },
    /// Show delivery logs.
    Logs {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        batch: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = ClientConfig::from_env();
    config.validate()?;

    let channel = Arc::new(
        ConnectionChannel::new(config.ws_url.clone())
            .with_reconnect_config(config.reconnect.clone())
            .with_default_timeout(config.request_timeout),
    );
    let store = SessionStore::new(channel.clone(), config.storage())
        .with_api_base_url(config.api_url.clone());

    let result = run(cli.command, &config, &store).await;
    channel.disconnect();
    result
}

async fn run(command: Command, config: &ClientConfig, store: &SessionStore) -> anyhow::Result<()> {
    match command {
        Command::Login { email, password } => {
            let session = store.login(&LoginRequest { email, password }).await?;
            println!("Signed in as {} <{}>", session.identity.display_name, session.identity.email);
        }
        Command::Register { name, email, password } => {
            store.register(&RegisterRequest { name, email, password }).await?;
            println!("Account created. Sign in with `connectsuite login`.");
        }
        Command::Logout => {
            store.logout().await;
            println!("Signed out");
        }
        Command::Whoami => match store.identity() {
            Some(identity) => println!("{} <{}> ({})", identity.display_name, identity.email, identity.id),
            None => println!("Not signed in"),
        },
        Command::Link => link(config, store).await?,
        Command::Accounts => {
            let list = store
                .authorized(|api| async move { WhatsAppApi::new(api).accounts().await })
                .await?;
            print_accounts(&list.accounts);
        }
        Command::Unlink { id } => {
            let removed = store
                .authorized(|api| async move { WhatsAppApi::new(api).delete_account(&id).await })
                .await?;
            println!("{} ({})", removed.message, removed.id);
        }
        Command::Send {
            account,
            message,
            to,
            contacts,
            immediate,
            min_delay,
            max_delay,
        } => {
            let mut recipients = match contacts {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str::<Vec<Contact>>(&raw)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => Vec::new(),
            };
            recipients.extend(to.iter().map(String::as_str).map(parse_contact));

            let mode = if immediate {
                DispatchMode::Immediate
            } else {
                DispatchMode::Scheduled(DelayRange::new(min_delay, max_delay)?)
            };
            let request = DispatchRequest {
                session_name: account,
                template: message,
                contacts: recipients,
                mode,
            };
            send(config, store, request).await?;
        }
        Command::Logs {
            status,
            batch,
            limit,
            offset,
        } => {
            let query = MessageLogQuery {
                status,
                limit,
                offset,
                ..batch.map(MessageLogQuery::for_batch).unwrap_or_default()
            };
            let page = store
                .authorized(|api| async move { WhatsAppApi::new(api).message_logs(&query).await })
                .await?;
            for log in &page.logs {
                println!(
                    "{:<10} {:<28} +{:>5}s  {}",
                    log.status,
                    log.recipient_phone.trim_end_matches("@s.whatsapp.net"),
                    log.delay_seconds,
                    log.error_message.as_deref().unwrap_or("")
                );
            }
            println!("{} of {} (offset {})", page.logs.len(), page.total, page.offset);
        }
    }
    Ok(())
}

async fn link(config: &ClientConfig, store: &SessionStore) -> anyhow::Result<()> {
    let interval = config.poll_interval;
    let outcome = store
        .authorized(|api| async move {
            let poller = AuthPoller::new(Arc::new(WhatsAppApi::new(api)), interval);
            let (qr, mut subscription) = poller.initiate().await?;
            println!("{}", qr.message);
            println!("{}", qr.qr_code);

            let outcome = tokio::select! {
                outcome = subscription.outcome() => outcome,
                _ = tokio::signal::ctrl_c() => {
                    poller.cancel(&qr.session_id);
                    HandshakeOutcome::Cancelled
                }
            };
            Ok(outcome)
        })
        .await?;

    match outcome {
        HandshakeOutcome::Linked { phone_number, name } => {
            println!(
                "Linked {} {}",
                phone_number.as_deref().unwrap_or("account"),
                name.map(|n| format!("({n})")).unwrap_or_default()
            );
            let list = store
                .authorized(|api| async move { WhatsAppApi::new(api).accounts().await })
                .await?;
            print_accounts(&list.accounts);
        }
        HandshakeOutcome::Failed { status, message } => bail!("linking {status:?}: {message}"),
        HandshakeOutcome::Cancelled => println!("Linking cancelled"),
    }
    Ok(())
}

async fn send(config: &ClientConfig, store: &SessionStore, request: DispatchRequest) -> anyhow::Result<()> {
    let pacing = config.send_pacing;
    let outcome = store
        .authorized(|api| async move {
            BulkDispatchScheduler::new(Arc::new(WhatsAppApi::new(api)), pacing)
                .dispatch(&request)
                .await
        })
        .await?;

    match outcome {
        DispatchOutcome::Scheduled(submitted) => {
            let span = submitted.batch.messages.last().map(|m| m.delay_seconds).unwrap_or(0);
            println!(
                "{} messages scheduled over {}s. Batch ID: {}",
                submitted.batch.messages.len(),
                span,
                submitted.remote_batch_id
            );
        }
        DispatchOutcome::Immediate(summary) => {
            for failed in summary.outcomes.iter().filter(|o| !o.is_success()) {
                println!("  failed {}: {}", failed.recipient, failed.error.as_deref().unwrap_or(""));
            }
            println!("{} sent, {} failed", summary.success_count, summary.fail_count);
        }
    }
    Ok(())
}

fn parse_contact(raw: &str) -> Contact {
    match raw.split_once(':') {
        Some((phone, name)) if !name.is_empty() => Contact::new(phone.trim()).with_name(name.trim()),
        _ => Contact::new(raw.trim().trim_end_matches(':')),
    }
}

fn print_accounts(accounts: &[connectsuite_shared::LinkedAccount]) {
    if accounts.is_empty() {
        println!("No linked accounts");
        return;
    }
    for account in accounts {
        println!(
            "{}  {:<16} {:<10} {}",
            account.id,
            account.phone_number,
            account.status,
            account.name.as_deref().unwrap_or("")
        );
    }
}
