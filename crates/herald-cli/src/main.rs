use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use herald_adapters::default_sources;
use herald_storage::ContestStore;
use herald_sync::{
    engine_from_config, http_from_config, run_cycle, run_scheduler, ChatChannel, DeliveryError,
    DiscordWebhook, HeraldConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "herald")]
#[command(about = "Competitive-programming contest notifier")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll on the configured cadence and deliver notifications until
    /// interrupted.
    Run,
    /// Run a single update + notify cycle and exit.
    Once {
        /// Print due notifications instead of sending them. Thresholds are
        /// still consumed.
        #[arg(long)]
        dry_run: bool,
    },
    /// Fetch upcoming contests from every source and print them; the store
    /// is untouched.
    Probe,
    /// List every stored contest with its notification flags.
    Dump,
}

struct StdoutChannel;

#[async_trait::async_trait]
impl ChatChannel for StdoutChannel {
    async fn send(&self, text: &str) -> Result<(), DeliveryError> {
        println!("{text}\n");
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn webhook_channel(config: &HeraldConfig) -> Result<Box<dyn ChatChannel>> {
    let url = config
        .webhook_url
        .clone()
        .context("HERALD_WEBHOOK_URL is not set")?;
    let http = http_from_config(config)?;
    Ok(Box::new(DiscordWebhook::new(
        http,
        url,
        config.mention.clone(),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = HeraldConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let engine = engine_from_config(&config);
            let http = http_from_config(&config)?;
            let channel = webhook_channel(&config)?;
            run_scheduler(&config, engine, http, channel).await?;
        }
        Commands::Once { dry_run } => {
            let engine = engine_from_config(&config);
            let http = http_from_config(&config)?;
            let channel: Box<dyn ChatChannel> = if dry_run {
                Box::new(StdoutChannel)
            } else {
                webhook_channel(&config)?
            };
            let outcome = run_cycle(
                &engine,
                &http,
                channel.as_ref(),
                Local::now().naive_local(),
            )
            .await?;
            println!(
                "cycle complete: run_id={} produced={} delivered={}",
                outcome.run_id, outcome.produced, outcome.delivered
            );
        }
        Commands::Probe => {
            let http = http_from_config(&config)?;
            let mut contests = Vec::new();
            for source in default_sources() {
                match source.upcoming_contests(&http).await {
                    Ok(mut found) => contests.append(&mut found),
                    Err(err) => eprintln!("{}: fetch failed: {err}", source.platform()),
                }
            }
            contests.sort_by_key(|contest| contest.start_time);
            for contest in contests {
                println!("{contest}\n");
            }
        }
        Commands::Dump => {
            let store = ContestStore::open(&config.store_path);
            let records = store.records().await?;
            for (uid, record) in records {
                println!("uid: {uid}");
                println!("{}", record.contest);
                println!("notified_today: {}", record.notified_today);
                println!("notified_1hr: {}", record.notified_1hr);
                println!("notified_15min: {}", record.notified_15min);
                println!();
            }
        }
    }

    Ok(())
}
