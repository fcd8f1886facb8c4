mod report;
mod roster;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, io};

use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use termscout_crawler::{
    html, urls, Fetch, FetchResult, Fetcher, FileCheckpoint, NoSummarizer, Orchestrator, PageCache, ScanConfig,
    Source, StopSignal, Target, TermSearcher,
};
use tokio::runtime;
use url::Url;

use crate::report::{CsvReport, FileMode};

/// School website policy term scanner
#[derive(Debug, Parser)]
#[clap(version)]
pub struct Args {
    #[clap(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    #[clap(name = "scan")]
    Scan(ScanArgs),
    #[clap(name = "search")]
    Search(SearchArgs),
    #[clap(hide = true)]
    Completion,
}

/// Crawl every roster target and report policy term occurrences
#[derive(Debug, clap::Args)]
pub struct ScanArgs {
    /// Path to the roster csv (name, state, school_url, district_url)
    #[clap(parse(from_os_str), long, short)]
    pub roster: PathBuf,
    /// Path to the output csv report
    #[clap(parse(from_os_str), long, short)]
    pub output_file: PathBuf,
    /// Optional yaml configuration file
    #[clap(env = "TERMSCOUT_CONFIG", parse(from_os_str), long)]
    pub config: Option<PathBuf>,
    /// Override the checkpoint file
    #[clap(parse(from_os_str), long)]
    pub checkpoint_file: Option<PathBuf>,
    /// Override the page cache directory
    #[clap(parse(from_os_str), long)]
    pub cache_dir: Option<PathBuf>,
    /// Keep the page cache in memory only
    #[clap(long, conflicts_with = "cache-dir")]
    pub no_cache: bool,
    /// Scan every target again, even the ones already done
    #[clap(long)]
    pub no_resume: bool,
    /// Stop after this many targets
    #[clap(long)]
    pub max_targets: Option<usize>,
    /// Override the number of targets scanned concurrently
    #[clap(long)]
    pub num_workers: Option<usize>,
    /// Override the maximum link depth
    #[clap(long)]
    pub max_depth: Option<usize>,
    /// Override the maximum number of fetches per site
    #[clap(long)]
    pub max_pages: Option<usize>,
    /// Override the delay in seconds between requests to one domain
    #[clap(long)]
    pub domain_delay: Option<f32>,
    /// Override the user agent
    #[clap(long)]
    pub user_agent: Option<String>,
    /// Replace the searched terms, can be repeated
    #[clap(long = "term")]
    pub terms: Vec<String>,
    /// When quiet no logs are outputted
    #[clap(long, short)]
    pub quiet: bool,
}

impl TryFrom<&ScanArgs> for ScanConfig {
    type Error = anyhow::Error;

    fn try_from(args: &ScanArgs) -> Result<Self, Self::Error> {
        let mut conf = load_config(args.config.as_ref())?;
        if let Some(checkpoint_file) = &args.checkpoint_file {
            conf.run.checkpoint_file = checkpoint_file.clone();
        }
        if let Some(cache_dir) = &args.cache_dir {
            conf.run.cache_dir = Some(cache_dir.clone());
        }
        if args.no_cache {
            conf.run.cache_dir = None;
        }
        if args.no_resume {
            conf.run.resume = false;
        }
        if let Some(max_targets) = args.max_targets {
            conf.run.max_targets = Some(max_targets);
        }
        if let Some(num_workers) = args.num_workers {
            conf.crawler.num_workers = num_workers;
        }
        if let Some(max_depth) = args.max_depth {
            conf.crawler.max_depth = max_depth;
        }
        if let Some(max_pages) = args.max_pages {
            conf.crawler.max_pages_per_site = max_pages;
        }
        if let Some(domain_delay) = args.domain_delay {
            conf.crawler.domain_delay = domain_delay;
        }
        if let Some(user_agent) = &args.user_agent {
            conf.crawler.user_agent = user_agent.to_string();
        }
        if !args.terms.is_empty() {
            conf.search.terms = args.terms.clone();
        }
        Ok(conf)
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ScanConfig> {
    match path {
        Some(path) => Ok(serde_yaml::from_reader(fs_err::File::open(path)?)?),
        None => Ok(ScanConfig::default()),
    }
}

pub fn scan(args: ScanArgs) -> anyhow::Result<()> {
    let config: ScanConfig = (&args).try_into()?;
    let targets = roster::read_roster(&args.roster)?;
    log::info!("Loaded {} targets from {}", targets.len(), args.roster.display());

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run_scan(&targets, &config, &args.output_file))
}

async fn run_scan(targets: &[Target], config: &ScanConfig, output_file: &Path) -> anyhow::Result<()> {
    let cache = match &config.run.cache_dir {
        Some(dir) => PageCache::on_disk(dir)?,
        None => PageCache::in_memory(),
    };
    let fetcher = Fetcher::new(&config.crawler, Arc::new(cache))?;
    let checkpoint = FileCheckpoint::open(&config.run.checkpoint_file)?;
    let mode = if config.run.resume {
        FileMode::Append
    } else {
        FileMode::Create
    };
    let report = CsvReport::open(output_file, mode)?;

    let stop = StopSignal::new();
    let sigint = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Received SIGINT, stopping after in-flight targets");
            sigint.raise();
        }
    });

    let orchestrator = Orchestrator::new(&fetcher, &checkpoint, &NoSummarizer, &report, stop);
    let run = orchestrator.run(targets, config).await;
    report.finish();

    if run?.stopped {
        log::warn!("Run stopped, resume it with the same checkpoint file");
    }
    Ok(())
}

/// Search a single page and print each term's occurrences to stdout
#[derive(Debug, clap::Args)]
#[clap(group = clap::ArgGroup::new("page").required(true))]
pub struct SearchArgs {
    /// A local html page to search
    #[clap(group = "page", parse(from_os_str), long)]
    pub file: Option<PathBuf>,
    /// A distant html page to search
    #[clap(group = "page", long)]
    pub url: Option<String>,
    /// Optional yaml configuration file
    #[clap(env = "TERMSCOUT_CONFIG", parse(from_os_str), long)]
    pub config: Option<PathBuf>,
    /// Replace the searched terms, can be repeated
    #[clap(long = "term")]
    pub terms: Vec<String>,
}

pub fn search(args: SearchArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if !args.terms.is_empty() {
        config.search.terms = args.terms.clone();
    }
    let searcher = TermSearcher::new(&config.search)?;

    let (text, location) = if let Some(url) = &args.url {
        let url = urls::parse_seed(url)?;
        let rt = runtime::Builder::new_current_thread().enable_all().build()?;
        let text = rt.block_on(fetch_text(&config, &url))?;
        (text, urls::normalize(&url))
    } else if let Some(path) = &args.file {
        let page = fs_err::read_to_string(path)?;
        (html::extract_text(&page), path.display().to_string())
    } else {
        anyhow::bail!("Missing `url` or `file`");
    };

    let matches = searcher.search(&text, &location, Source::Primary);
    if matches.is_empty() {
        println!("No term found in {location}");
    }
    for m in matches {
        println!("{}: {}", m.term, m.occurrences);
        for snippet in m.snippets {
            println!("    ...{snippet}...");
        }
    }
    Ok(())
}

async fn fetch_text(config: &ScanConfig, url: &Url) -> anyhow::Result<String> {
    let fetcher = Fetcher::new(&config.crawler, Arc::new(PageCache::in_memory()))?;
    match fetcher.fetch(url).await {
        FetchResult::Ok(page) if page.is_html() => Ok(html::extract_text(&page.content)),
        FetchResult::Ok(page) => Ok(html::collapse_whitespace(&page.content)),
        other => anyhow::bail!("Couldn't fetch {url}: {other}"),
    }
}

fn init_logs(default: &str) {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", default);
    }
    env_logger::init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.cmd {
        SubCommand::Scan(args) => {
            if !args.quiet {
                init_logs("termscout_crawler=info,termscout=info");
            }
            scan(args)
        }
        SubCommand::Search(args) => {
            init_logs("termscout_crawler=warn,termscout=warn");
            search(args)
        }
        SubCommand::Completion => {
            generate(Shell::Bash, &mut Args::command(), "termscout", &mut io::stdout());
            Ok(())
        }
    }
}
