//! CLI command definitions for swe-curator.
//!
//! Every stage of the curation pipeline is a subcommand; `run` chains them.
//! Settings come from an optional YAML file, then `CURATOR_*` environment
//! variables, then command-line flags.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use crate::config::{parse_date, CurationConfig};
use crate::github::{CodeHost, CredentialPool, GitHubClient};
use crate::llm::{ChatCompletionsClient, LlmProvider};
use crate::swe::merger::TaskMerger;
use crate::swe::pipeline::refilter_scores;
use crate::swe::{Pipeline, ProgressCounters, ProgressMonitor, RunSummary, Shutdown, StagePaths};

/// How often progress counters are logged during long stages.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Curate SWE task instances from GitHub history.
#[derive(Parser, Debug)]
#[command(name = "swe-curator")]
#[command(about = "Mine GitHub repositories into issue-grounded SWE task instances")]
#[command(version)]
#[command(
    long_about = "swe-curator crawls GitHub for repositories of a language, filters them by activity, \
extracts one task per merged PR that resolves an issue, merges the per-repository shards and \
judges issue quality with an LLM.\n\nExample usage:\n  swe-curator --output-dir ./out run --language Python --min-stars 1000"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(short, long, global = true, env = "CURATOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding all stage outputs and checkpoints.
    #[arg(short, long, global = true, env = "CURATOR_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Print the run summary as JSON.
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover repositories through GitHub search.
    Crawl(CrawlArgs),

    /// Admit crawled repositories by PR/issue/fork counts and language share.
    Filter(FilterArgs),

    /// Extract task instances from admitted repositories.
    Extract(ExtractArgs),

    /// Merge per-repository task shards into one dataset.
    Merge(MergeArgs),

    /// Judge issue quality with an LLM and apply the score threshold.
    Score(ScoreArgs),

    /// Re-apply a score threshold to stored judgements without calling the judge.
    Refilter(RefilterArgs),

    /// Run every stage in order.
    Run(RunArgs),
}

/// GitHub access shared by the stages that talk to the API.
#[derive(Args, Debug, Clone, Default)]
pub struct GitHubArgs {
    /// File with one GitHub token per line.
    #[arg(long = "tokens-file")]
    pub credential_file: Option<PathBuf>,

    /// Maximum units processed concurrently.
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct CrawlArgs {
    #[command(flatten)]
    pub github: GitHubArgs,

    /// Repository language as GitHub names it (e.g. Python, "Jupyter Notebook").
    #[arg(long)]
    pub language: Option<String>,

    #[arg(long)]
    pub min_stars: Option<u32>,

    /// Upper star bound; open-ended when omitted.
    #[arg(long)]
    pub max_stars: Option<u32>,

    /// Add a single `owner/name` repository instead of searching.
    #[arg(long)]
    pub repo: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    #[command(flatten)]
    pub github: GitHubArgs,

    #[arg(long)]
    pub language: Option<String>,

    #[arg(long)]
    pub min_pr: Option<u64>,

    #[arg(long)]
    pub min_issues: Option<u64>,

    #[arg(long)]
    pub min_forks: Option<u64>,

    /// Minimum share of bytes in the target language (0.0-1.0).
    #[arg(long)]
    pub min_language_ratio: Option<f64>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ExtractArgs {
    #[command(flatten)]
    pub github: GitHubArgs,

    /// Ignore PRs created before this date (YYYY-MM-DD).
    #[arg(long)]
    pub cutoff_date: Option<String>,

    /// Keep tasks whose diff does not reach the base quality tier.
    #[arg(long)]
    pub allow_missing_tests: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct MergeArgs {
    /// Shard files or directories; defaults to the output directory's shards.
    pub inputs: Vec<PathBuf>,

    /// Merged dataset path; defaults to `tasks.jsonl` in the output directory.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

/// Judge endpoint settings.
#[derive(Args, Debug, Clone, Default)]
pub struct JudgeArgs {
    /// Judge API key (falls back to OPENAI_KEY).
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// OpenAI-compatible API base URL.
    #[arg(long)]
    pub api_base: Option<String>,

    /// Judge model.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Minimum accepted issue score (0-10).
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Include pre-fix issue discussion in the judge prompt.
    #[arg(long)]
    pub include_hints: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ScoreArgs {
    #[command(flatten)]
    pub judge: JudgeArgs,

    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Judge again the tasks a previous run left unscored.
    #[arg(long)]
    pub retry_unscored: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RefilterArgs {
    /// New minimum accepted issue score (0-10).
    #[arg(long)]
    pub threshold: f64,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[command(flatten)]
    pub github: GitHubArgs,

    #[command(flatten)]
    pub judge: JudgeArgs,

    #[arg(long)]
    pub language: Option<String>,

    #[arg(long)]
    pub min_stars: Option<u32>,

    #[arg(long)]
    pub max_stars: Option<u32>,

    /// Ignore PRs created before this date (YYYY-MM-DD).
    #[arg(long)]
    pub cutoff_date: Option<String>,

    /// Stop after merging; do not call the judge.
    #[arg(long)]
    pub skip_score: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(&cli)?;
    let start = Instant::now();

    let summary = match &cli.command {
        Commands::Merge(args) => run_merge_command(&config, args)?,
        Commands::Refilter(args) => run_refilter_command(&config, args)?,
        command => {
            apply_command_overrides(&mut config, command)?;
            config.validate()?;
            run_pipeline_command(config, command, start).await?
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }
    if summary.interrupted {
        info!("Interrupted; rerun the same command to resume");
    }
    Ok(())
}

/// File, then environment, then the global `--output-dir`.
fn load_config(cli: &Cli) -> anyhow::Result<CurationConfig> {
    let config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration file");
            CurationConfig::from_yaml_file(path)?
        }
        None => CurationConfig::new(),
    };
    let mut config = config.apply_env()?;
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    Ok(config)
}

fn apply_github_overrides(config: &mut CurationConfig, args: &GitHubArgs) {
    if let Some(path) = &args.credential_file {
        config.credential_file = path.clone();
    }
    if let Some(workers) = args.max_workers {
        config.max_workers = workers;
    }
}

fn apply_judge_overrides(config: &mut CurationConfig, args: &JudgeArgs) {
    if let Some(base) = &args.api_base {
        config.judge.api_base = base.clone();
    }
    if let Some(model) = &args.model {
        config.judge.model = model.clone();
    }
    if let Some(threshold) = args.threshold {
        config.score_threshold = threshold;
    }
    if args.include_hints {
        config.judge.include_hints = true;
    }
}

fn apply_command_overrides(config: &mut CurationConfig, command: &Commands) -> anyhow::Result<()> {
    match command {
        Commands::Crawl(args) => {
            apply_github_overrides(config, &args.github);
            if let Some(language) = &args.language {
                config.language = language.clone();
            }
            if let Some(min) = args.min_stars {
                config.min_stars = min;
            }
            if args.max_stars.is_some() {
                config.max_stars = args.max_stars;
            }
        }
        Commands::Filter(args) => {
            apply_github_overrides(config, &args.github);
            if let Some(language) = &args.language {
                config.language = language.clone();
            }
            if let Some(v) = args.min_pr {
                config.min_pr = v;
            }
            if let Some(v) = args.min_issues {
                config.min_issues = v;
            }
            if let Some(v) = args.min_forks {
                config.min_forks = v;
            }
            if let Some(v) = args.min_language_ratio {
                config.min_language_ratio = v;
            }
        }
        Commands::Extract(args) => {
            apply_github_overrides(config, &args.github);
            if let Some(date) = &args.cutoff_date {
                config.cutoff_date = Some(parse_date("cutoff_date", date)?);
            }
            if args.allow_missing_tests {
                config.require_test_patch = false;
            }
        }
        Commands::Score(args) => {
            apply_judge_overrides(config, &args.judge);
            if let Some(workers) = args.max_workers {
                config.max_workers = workers;
            }
        }
        Commands::Run(args) => {
            apply_github_overrides(config, &args.github);
            apply_judge_overrides(config, &args.judge);
            if let Some(language) = &args.language {
                config.language = language.clone();
            }
            if let Some(min) = args.min_stars {
                config.min_stars = min;
            }
            if args.max_stars.is_some() {
                config.max_stars = args.max_stars;
            }
            if let Some(date) = &args.cutoff_date {
                config.cutoff_date = Some(parse_date("cutoff_date", date)?);
            }
        }
        Commands::Merge(_) | Commands::Refilter(_) => {}
    }
    Ok(())
}

fn build_host(config: &CurationConfig) -> anyhow::Result<Arc<dyn CodeHost>> {
    let pool = CredentialPool::from_file(&config.credential_file).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load GitHub tokens from {}: {}",
            config.credential_file.display(),
            e
        )
    })?;
    info!(tokens = pool.len(), "Loaded GitHub credentials");
    Ok(Arc::new(GitHubClient::new(pool, config.fetch.clone())))
}

fn build_judge(config: &CurationConfig, args: &JudgeArgs) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let api_key = args
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_KEY").ok())
        .ok_or_else(|| {
            anyhow::anyhow!("No judge API key. Provide --api-key or set OPENAI_API_KEY/OPENAI_KEY.")
        })?;
    let client = ChatCompletionsClient::new(
        config.judge.api_base.clone(),
        api_key,
        config.judge.model.clone(),
    )?;
    info!(
        api_base = %client.api_base(),
        model = %client.default_model(),
        api_key = %client.api_key_masked(),
        "Using judge"
    );
    Ok(Arc::new(client))
}

/// Whether `command` reads from GitHub. Scoring works from local files only.
fn needs_host(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Crawl(_) | Commands::Filter(_) | Commands::Extract(_) | Commands::Run(_)
    )
}

async fn run_pipeline_command(
    config: CurationConfig,
    command: &Commands,
    start: Instant,
) -> anyhow::Result<RunSummary> {
    let host = if needs_host(command) {
        Some(build_host(&config)?)
    } else {
        None
    };
    let judge = match command {
        Commands::Score(args) => Some(build_judge(&config, &args.judge)?),
        Commands::Run(args) if !args.skip_score => Some(build_judge(&config, &args.judge)?),
        _ => None,
    };

    let shutdown = Shutdown::new();
    let ctrl_c = shutdown.listen_for_ctrl_c();

    let pipeline = match host {
        Some(host) => Pipeline::new(host, config),
        None => Pipeline::offline(config),
    };
    let mut pipeline = pipeline.with_shutdown(shutdown);
    if let Some(judge) = judge {
        pipeline = pipeline.with_judge(judge);
    }
    let monitor = ProgressMonitor::start(pipeline.counters().clone(), PROGRESS_INTERVAL);

    let result = match command {
        Commands::Crawl(args) => match &args.repo {
            Some(repo) => pipeline.crawl_single(repo).await,
            None => pipeline.crawl().await,
        },
        Commands::Filter(_) => pipeline.filter().await,
        Commands::Extract(_) => pipeline.extract().await,
        Commands::Score(args) => pipeline.score(args.retry_unscored).await,
        Commands::Run(_) => pipeline.run_all().await,
        Commands::Merge(_) | Commands::Refilter(_) => Ok(()),
    };

    monitor.stop().await;
    ctrl_c.abort();
    result?;
    Ok(pipeline.summary(start))
}

fn run_merge_command(config: &CurationConfig, args: &MergeArgs) -> anyhow::Result<RunSummary> {
    let start = Instant::now();
    let paths = StagePaths::new(config.output_dir.clone());
    let inputs = if args.inputs.is_empty() {
        vec![paths.task_shards()]
    } else {
        args.inputs.clone()
    };
    let output = args.output.clone().unwrap_or_else(|| paths.tasks());

    let counters = ProgressCounters::new();
    let report = TaskMerger::new(inputs, output).run()?;
    for duplicate in &report.duplicates {
        counters.record_skip(
            "merge",
            &duplicate.instance_id,
            format!("duplicate in {}", duplicate.shard.display()),
        );
    }
    for line in &report.malformed {
        warn!(shard = %line.shard.display(), line = line.line, "Malformed shard line");
    }
    ProgressCounters::add(&counters.merged, report.tasks.len());
    Ok(counters.summary(start, false))
}

fn run_refilter_command(config: &CurationConfig, args: &RefilterArgs) -> anyhow::Result<RunSummary> {
    let start = Instant::now();
    let paths = StagePaths::new(config.output_dir.clone());
    let counters = ProgressCounters::new();
    let accepted = refilter_scores(&paths, args.threshold)?;
    ProgressCounters::add(&counters.accepted, accepted);
    Ok(counters.summary(start, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_crawl_args_parse() {
        let cli = Cli::try_parse_from([
            "swe-curator",
            "--output-dir",
            "/tmp/out",
            "crawl",
            "--language",
            "Python",
            "--min-stars",
            "1000",
            "--tokens-file",
            "tokens.txt",
            "-w",
            "8",
        ])
        .expect("should parse");

        assert_eq!(cli.output_dir, Some(PathBuf::from("/tmp/out")));
        match cli.command {
            Commands::Crawl(args) => {
                assert_eq!(args.language.as_deref(), Some("Python"));
                assert_eq!(args.min_stars, Some(1000));
                assert_eq!(args.max_stars, None);
                assert_eq!(args.github.max_workers, Some(8));
                assert_eq!(args.github.credential_file, Some(PathBuf::from("tokens.txt")));
            }
            other => panic!("Expected Crawl command, got {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["swe-curator", "merge", "--json", "-l", "debug"])
            .expect("should parse");
        assert!(cli.json);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Merge(_)));
    }

    #[test]
    fn test_refilter_requires_threshold() {
        assert!(Cli::try_parse_from(["swe-curator", "refilter"]).is_err());
        let cli = Cli::try_parse_from(["swe-curator", "refilter", "--threshold", "6.5"])
            .expect("should parse");
        match cli.command {
            Commands::Refilter(args) => assert_eq!(args.threshold, 6.5),
            other => panic!("Expected Refilter command, got {:?}", other),
        }
    }

    #[test]
    fn test_score_flags() {
        let cli = Cli::try_parse_from([
            "swe-curator",
            "score",
            "--retry-unscored",
            "--threshold",
            "6",
            "-m",
            "judge-model",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Score(args) => {
                assert!(args.retry_unscored);
                assert_eq!(args.judge.threshold, Some(6.0));
                assert_eq!(args.judge.model.as_deref(), Some("judge-model"));
            }
            other => panic!("Expected Score command, got {:?}", other),
        }
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let mut config = CurationConfig::new();
        let command = Commands::Run(RunArgs {
            language: Some("Rust".to_string()),
            min_stars: Some(500),
            max_stars: Some(900),
            cutoff_date: Some("2023-06-01".to_string()),
            judge: JudgeArgs {
                threshold: Some(7.0),
                ..Default::default()
            },
            ..Default::default()
        });
        apply_command_overrides(&mut config, &command).unwrap();

        assert_eq!(config.language, "Rust");
        assert_eq!(config.min_stars, 500);
        assert_eq!(config.max_stars, Some(900));
        assert_eq!(config.score_threshold, 7.0);
        assert!(config.cutoff_date.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_only_github_stages_need_tokens() {
        let parse = |args: &[&str]| Cli::try_parse_from(args).expect("should parse").command;
        assert!(!needs_host(&parse(&["swe-curator", "score"])));
        assert!(needs_host(&parse(&["swe-curator", "extract"])));
        assert!(needs_host(&parse(&["swe-curator", "run", "--skip-score"])));
        assert!(needs_host(&parse(&["swe-curator", "crawl", "--repo", "o/r"])));
    }

    #[test]
    fn test_bad_cutoff_date_is_rejected() {
        let mut config = CurationConfig::new();
        let command = Commands::Extract(ExtractArgs {
            cutoff_date: Some("yesterday".to_string()),
            ..Default::default()
        });
        assert!(apply_command_overrides(&mut config, &command).is_err());
    }
}
