mod classifier;
mod codec;
mod journal;
mod notify;
mod pinyin;
mod server;
mod sweeper;
mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::classifier::{DomainClassifier, OfflineDomainSet};
use crate::journal::SqliteJournal;
use crate::notify::Notifier;
use crate::server::{DnsServer, ServerOptions};
use crate::sweeper::CacheSweeper;
use crate::upstream::create_resolver;

const DEFAULT_FILING_API_URL: &str = "https://apidatav2.chinaz.com/single/domain";
const DEFAULT_LIST_URL: &str =
    "https://raw.githubusercontent.com/felixonmars/dnsmasq-china-list/master/accelerated-domains.china.conf";

#[derive(Parser, Debug)]
#[command(author, version, about = "Split-horizon DNS forwarder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动转发服务 / run the forwarding server
    Start(StartArgs),
}

#[derive(Args, Debug)]
struct StartArgs {
    /// UDP listen port
    #[arg(short, long, default_value_t = 5353)]
    port: u16,
    /// 备案查询 API key；缺省时使用拼音启发式 / filing-lookup API key,
    /// falls back to the syllable heuristic when absent
    #[arg(long)]
    api_key: Option<String>,
    /// Filing-lookup endpoint
    #[arg(long, default_value = DEFAULT_FILING_API_URL)]
    filing_api_url: String,
    /// 国内上游（普通 DNS、tls:// 或 https://）/ domestic upstream
    #[arg(long, default_value = "120.53.53.53")]
    domestic: String,
    /// 海外上游 / overseas upstream
    #[arg(long, default_value = "1.1.1.1")]
    overseas: String,
    /// Data directory for the journal database and the offline domain list
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
    /// Offline domestic-domain list source, fetched once when missing
    #[arg(long, default_value = DEFAULT_LIST_URL)]
    list_url: String,
    /// 日志级别 (trace/debug/info/warn/error)
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Skip DoT certificate verification (testing only)
    #[arg(long, default_value_t = false)]
    dot_insecure: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start(args) => start(args).await,
    }
}

fn init_tracing(level: &str) {
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    init_tracing(&args.log_level);

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("create data directory {}", args.data_dir.display()))?;

    let journal = Arc::new(
        SqliteJournal::open(&args.data_dir.join("splitdns.db"))
            .await
            .context("open journal database")?,
    );

    let offline =
        OfflineDomainSet::ensure(&args.data_dir.join("domestic_domains.txt"), &args.list_url)
            .await
            .context("load domestic domain list")?;

    let classifier = Arc::new(DomainClassifier::new(
        offline,
        journal.clone(),
        args.api_key.clone(),
        args.filing_api_url.clone(),
    ));

    let shutdown = CancellationToken::new();
    let sweeper = CacheSweeper::new(journal.clone(), shutdown.clone()).spawn();

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", args.port)
        .parse()
        .context("parse bind address")?;
    let server = DnsServer::bind(ServerOptions {
        bind_addr,
        domestic: create_resolver(&args.domestic, args.dot_insecure),
        overseas: create_resolver(&args.overseas, args.dot_insecure),
        classifier,
        journal: journal.clone(),
        notifier: Notifier::default(),
        shutdown: shutdown.clone(),
    })
    .await?;

    info!(port = args.port, "dns forwarder started");

    // ctrl-c flips the token, the ingress loop drains and returns
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                signal_token.cancel();
            }
            Err(err) => {
                error!(error = %err, "failed to listen for shutdown signal");
            }
        }
    });

    server.run().await;

    if let Err(err) = sweeper.await {
        error!(error = %err, "cache sweeper task failed");
    }
    journal.close().await;
    info!("shutdown complete");

    Ok(())
}
