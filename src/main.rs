use anyhow::Result;
use clap::{Parser, Subcommand};
use idolgrab::browser::{new_browser_handle, BrowserSession};
use idolgrab::config::AppConfig;
use idolgrab::crawler::{download_single_post, BrowserGallery, Crawler};
use idolgrab::job::{CancellationToken, ConsoleSink};
use idolgrab::models::{CrawlTarget, JobResult, OutcomeStatus, PageRange};
use idolgrab::server;
use log::{info, warn, LevelFilter};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "idolgrab", about = "Gallery crawl-and-download engine")]
struct Cli {
    /// Log level: off, error, warn, info, debug or trace
    #[arg(short, long, default_value = "info")]
    log_level: LevelFilter,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        downloads_dir: Option<PathBuf>,
    },
    /// Crawl an idol's listing pages
    Idol {
        name: String,
        #[arg(long, default_value_t = 1)]
        start: u32,
        #[arg(long)]
        end: u32,
    },
    /// Crawl a creator's listing pages; walks until empty unless --end is given
    Creator {
        name: String,
        #[arg(long, default_value_t = 1)]
        start: u32,
        #[arg(long)]
        end: Option<u32>,
    },
    /// Download the images of a single post
    Post {
        url: String,
        #[arg(long, default_value = "single")]
        folder: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new().filter_level(cli.log_level).init();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Serve {
            host,
            port,
            downloads_dir,
        } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(dir) = downloads_dir {
                config.downloads_dir = dir;
            }
            server::serve(config).await
        }
        Command::Idol { name, start, end } => {
            run_crawl(config, CrawlTarget::idol(name, start, end)).await
        }
        Command::Creator { name, start, end } => {
            let range = match end {
                Some(end) => PageRange::Bounded { start, end },
                None => PageRange::UntilEmpty { start },
            };
            run_crawl(config, CrawlTarget::creator(name, range)).await
        }
        Command::Post { url, folder } => run_post(config, url, folder).await,
    }
}

/// Watch for Ctrl-C and flip the cancellation flag; the walk then stops at
/// the next page or image boundary.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current item then stopping");
            cancel.request();
        }
    });
}

async fn run_crawl(config: AppConfig, target: CrawlTarget) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let session = BrowserSession::launch(&config.browser, new_browser_handle()).await?;
    let gallery = BrowserGallery::new(&session, &config.download).await?;
    let sink = ConsoleSink;
    let crawler = Crawler::new(&gallery, &config.download, &config.site_base, &sink, &cancel);

    let dir = config.downloads_dir.join(&target.name);
    let mut result = JobResult::default();
    let walk = crawler.run(&target, &dir, &mut result).await;
    gallery.close().await;
    session.shutdown().await;

    match walk {
        Ok(()) => {
            info!(
                "Done: {} page(s), {} post(s), {} image(s), {} error(s)",
                result.pages_processed,
                result.posts_processed,
                result.images_downloaded,
                result.errors.len()
            );
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            warn!(
                "Cancelled with partial results: {} image(s) downloaded",
                result.images_downloaded
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_post(config: AppConfig, url: String, folder: String) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let session = BrowserSession::launch(&config.browser, new_browser_handle()).await?;
    let dir = config.downloads_dir.join(&folder);
    let sink = ConsoleSink;
    let outcome =
        download_single_post(&session, &config.download, &url, &dir, &cancel, &sink).await;
    session.shutdown().await;

    let outcomes = outcome?;
    let saved = outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::Saved)
        .count();
    info!("Done: {} of {} image(s) saved to {}", saved, outcomes.len(), dir.display());
    Ok(())
}
