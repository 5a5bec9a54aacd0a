use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use runweb_api::ResponseCache;
use runweb_core::collectors::{RecordHistoryCollector, RelatedGamesCollector, collect_games_metadata};
use runweb_core::config::{DEFAULT_CONFIG_PATH, Settings, expand_path};
use runweb_core::crawl::{AbortPolicy, Checkpoint, CrawlDriver, CrawlReport, EntityCollector};
use runweb_core::graph::{AggregateOptions, EdgeList, GameFilter, aggregate_dir};
use runweb_core::model::Game;
use runweb_core::preferences::{
    corpus_users, fetch_profiles, user_preferences, write_user_preferences, write_user_run_counts,
};
use runweb_core::resolver::{GameListing, Resolver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info};

pub fn print_banner() {
    println!(
        "{} {}",
        "runweb".bright_cyan().bold(),
        format!("v{} · speedrun network crawler", env!("CARGO_PKG_VERSION")).dimmed()
    );
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

/// Install the fmt subscriber. `-q` keeps only warnings, each `-v` raises
/// the level one step from info.
pub fn init_tracing(quiet: bool, verbosity: u8) {
    let level = match (quiet, verbosity) {
        (true, _) => Level::WARN,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

/// Settings from an explicit `--config` file, or the default location when
/// it exists, or built-in defaults.
pub fn load_settings(config: Option<&PathBuf>) -> Result<Settings> {
    match config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => {
            let default_path = expand_path(DEFAULT_CONFIG_PATH);
            Settings::load_or_default(&default_path)
                .with_context(|| format!("Failed to load config {}", default_path.display()))
        }
    }
}

/// Explicit `--entity-index`/`--sub-index` win over the state file; a
/// missing state file means a fresh start.
pub fn resolve_checkpoint(
    entity_index: Option<usize>,
    sub_index: Option<usize>,
    state_file: Option<&Path>,
) -> Result<Checkpoint> {
    if entity_index.is_some() || sub_index.is_some() {
        return Ok(Checkpoint::new(
            entity_index.unwrap_or(0),
            sub_index.unwrap_or(0),
        ));
    }
    match state_file {
        Some(path) if path.exists() => Checkpoint::load(path)
            .with_context(|| format!("Failed to read state file {}", path.display())),
        _ => Ok(Checkpoint::default()),
    }
}

/// Fold CLI overrides shared by every network subcommand into `settings`.
pub fn apply_overrides(settings: &mut Settings, args: &ArgMatches) {
    if let Some(cache) = args.try_get_one::<String>("cache").ok().flatten() {
        settings.cache_path = cache.clone();
    }
    if let Some(output_dir) = args.try_get_one::<String>("output-dir").ok().flatten() {
        settings.output_dir = output_dir.clone();
    }
    if let Some(max_retries) = args.try_get_one::<u32>("max-retries").ok().flatten() {
        settings.max_retries = Some(*max_retries);
    }
}

fn build_resolver(settings: &Settings, args: &ArgMatches) -> Result<Resolver> {
    let no_cache = args.try_get_one::<bool>("no-cache").ok().flatten().copied().unwrap_or(false);
    let cache = if no_cache {
        None
    } else {
        let path = settings.cache_file();
        let cache = ResponseCache::open(&path)
            .with_context(|| format!("Failed to open response cache {}", path.display()))?;
        info!(path = %path.display(), "response cache ready");
        Some(Arc::new(cache))
    };

    let client = settings.client(cache)?;
    Ok(Resolver::new(client).with_deny_list(settings.deny_list()))
}

fn entity_progress_bar(len: usize, start: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.set_position(start as u64);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

async fn run_collector<C: EntityCollector>(
    driver: CrawlDriver,
    resolver: &Resolver,
    collector: &C,
    workers: usize,
    show_progress: bool,
) -> Result<CrawlReport> {
    let entities: Vec<Game> = driver.load_entities(resolver).await?;

    let pb = show_progress.then(|| {
        let start = driver.start().entity_index.min(entities.len());
        entity_progress_bar(entities.len(), start)
    });
    let driver = match &pb {
        Some(pb) => {
            let pb = pb.clone();
            driver.with_progress_callback(Arc::new(move |checkpoint: Checkpoint, game: &Game| {
                pb.set_position(checkpoint.entity_index as u64);
                pb.set_message(game.name().to_string());
            }))
        }
        None => driver,
    };

    let report = if workers > 1 {
        driver
            .run_entities_concurrent(resolver, collector, &entities, workers)
            .await?
    } else {
        driver.run_entities(resolver, collector, &entities).await?
    };

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    Ok(report)
}

fn print_crawl_summary(report: &CrawlReport) {
    print_divider();
    println!("{}", "  CRAWL SUMMARY".bright_white().bold());
    print_divider();
    println!("{} Entities: {}", "→".blue(), report.total.to_string().bright_white());
    println!("{} Processed: {}", "✓".green().bold(), report.processed);
    println!("{} Rows written: {}", "✓".green().bold(), report.rows_written);
    if !report.skipped.is_empty() {
        println!("{} Skipped: {}", "⚠".yellow(), report.skipped.len());
    }
    for aborted in &report.aborted {
        println!(
            "{} Aborted {} at {}: {}",
            "✗".red().bold(),
            aborted.game_id.bright_white(),
            aborted.checkpoint,
            aborted.reason
        );
    }
    if let Some(at) = report.halted_at {
        println!();
        println!(
            "{} Halted. Resume with {} (use {} to skip the failing item)",
            "⚠".yellow().bold(),
            format!("--entity-index {} --sub-index {}", at.entity_index, at.sub_index).bright_white(),
            format!("--sub-index {}", at.sub_index + 1).bright_white()
        );
    }
}

pub async fn handle_crawl(args: &ArgMatches, settings: &Settings, quiet: bool) -> Result<()> {
    let mut settings = settings.clone();
    apply_overrides(&mut settings, args);

    let kind = args
        .get_one::<String>("KIND")
        .map(String::as_str)
        .unwrap_or("related");
    let workers = args.get_one::<usize>("workers").copied().unwrap_or(1);
    let state_file = args.get_one::<PathBuf>("state-file");
    let checkpoint = resolve_checkpoint(
        args.get_one::<usize>("entity-index").copied(),
        args.get_one::<usize>("sub-index").copied(),
        state_file.map(PathBuf::as_path),
    )?;
    let policy = if args.get_flag("skip-failed") {
        AbortPolicy::SkipEntity
    } else {
        AbortPolicy::Halt
    };
    let listing = if args.get_flag("detailed") {
        GameListing::Detailed
    } else {
        GameListing::Bulk
    };

    let output_dir = settings.output_path();
    let resolver = build_resolver(&settings, args)?;
    let driver = CrawlDriver::new(&output_dir)
        .with_checkpoint(checkpoint)
        .with_abort_policy(policy)
        .with_listing(listing);

    if !quiet {
        println!("{} Collector: {}", "→".blue(), kind.bright_white());
        println!("{} Output: {}", "→".blue(), output_dir.display().to_string().bright_white());
        println!("{} Starting at: {}", "→".blue(), checkpoint);
        println!("{} Workers: {}\n", "→".blue(), workers);
    }

    let report = match kind {
        "related" => run_collector(driver, &resolver, &RelatedGamesCollector, workers, !quiet).await?,
        "history" => {
            let end_date: NaiveDate = match args.get_one::<String>("end-date") {
                Some(value) => Settings::parse_date(value)?,
                None => settings.final_date,
            };
            let collector = RecordHistoryCollector::new(end_date);
            run_collector(driver, &resolver, &collector, workers, !quiet).await?
        }
        other => bail!("Unknown crawl kind: {}", other),
    };

    if let Some(path) = state_file {
        report
            .resume_checkpoint()
            .save(path)
            .with_context(|| format!("Failed to write state file {}", path.display()))?;
        info!(path = %path.display(), checkpoint = %report.resume_checkpoint(), "state saved");
    }

    print_crawl_summary(&report);
    Ok(())
}

pub async fn handle_metadata(args: &ArgMatches, settings: &Settings) -> Result<()> {
    let mut settings = settings.clone();
    apply_overrides(&mut settings, args);

    let output = args
        .get_one::<PathBuf>("output")
        .cloned()
        .context("--output is required")?;
    let resolver = build_resolver(&settings, args)?;

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Listing every game...");
    let count = collect_games_metadata(&resolver, &output).await;
    spinner.finish_and_clear();
    let count = count?;

    println!(
        "{} Wrote metadata for {} games to {}",
        "✓".green().bold(),
        count,
        output.display().to_string().bright_white()
    );
    Ok(())
}

fn load_filter(args: &ArgMatches, settings: &Settings) -> Result<Option<GameFilter>> {
    let Some(path) = args.get_one::<PathBuf>("filter-metadata") else {
        return Ok(None);
    };
    let filter = GameFilter::from_metadata(path, settings.final_date, &settings.deny_list())
        .with_context(|| format!("Failed to read games metadata {}", path.display()))?;
    println!(
        "{} Filter admits {} games released before {}",
        "→".blue(),
        filter.len(),
        settings.final_date
    );
    Ok(Some(filter))
}

fn aggregate_options(args: &ArgMatches) -> AggregateOptions {
    let mut opts = AggregateOptions::default();
    if let Some(fraction) = args.get_one::<f64>("fraction") {
        opts.fraction = *fraction;
    }
    if let Some(suffix) = args.get_one::<String>("suffix") {
        opts.suffix = suffix.clone();
    }
    opts
}

fn input_dir(args: &ArgMatches, settings: &Settings) -> PathBuf {
    args.get_one::<String>("input")
        .map(|dir| expand_path(dir))
        .unwrap_or_else(|| settings.output_path())
}

pub fn handle_aggregate(args: &ArgMatches, settings: &Settings) -> Result<()> {
    let input = input_dir(args, settings);
    let output = args
        .get_one::<PathBuf>("output")
        .cloned()
        .context("--output is required")?;
    let opts = aggregate_options(args);
    let filter = load_filter(args, settings)?;

    let aggregation = aggregate_dir(&input, &opts)
        .with_context(|| format!("Failed to aggregate {}", input.display()))?;
    let edges = match &filter {
        Some(filter) => aggregation.edges.filtered(filter),
        None => aggregation.edges,
    };
    edges.write_csv(&output)?;

    let stats = &aggregation.stats;
    print_divider();
    println!("{}", "  AGGREGATION SUMMARY".bright_white().bold());
    print_divider();
    println!("{} Files read: {}", "→".blue(), stats.files_scanned);
    println!("{} Rows read: {}", "→".blue(), stats.rows_read);
    println!("{} Self links dropped: {}", "→".blue(), stats.self_loops);
    if stats.skipped_rows > 0 {
        println!("{} Malformed rows skipped: {}", "⚠".yellow(), stats.skipped_rows);
    }
    println!(
        "{} {} edges (total weight {}) written to {}",
        "✓".green().bold(),
        edges.len(),
        edges.total_weight(),
        output.display().to_string().bright_white()
    );
    Ok(())
}

pub async fn handle_preferences(args: &ArgMatches, settings: &Settings) -> Result<()> {
    let mut settings = settings.clone();
    apply_overrides(&mut settings, args);

    let input = input_dir(args, &settings);
    let output = args
        .get_one::<PathBuf>("output")
        .cloned()
        .context("--output is required")?;
    let opts = aggregate_options(args);
    let filter = load_filter(args, &settings)?;

    let prefs = user_preferences(&input, &opts, filter.as_ref())?;

    let profiles = if args.get_flag("with-profiles") {
        let resolver = build_resolver(&settings, args)?;
        let spinner = ProgressBar::new_spinner();
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_message(format!("Looking up {} users...", prefs.len()));
        let profiles = fetch_profiles(&resolver, &prefs).await;
        spinner.finish_and_clear();
        Some(profiles?)
    } else {
        None
    };

    write_user_preferences(&output, &prefs, profiles.as_ref())?;
    println!(
        "{} Preferences for {} users written to {}",
        "✓".green().bold(),
        prefs.len(),
        output.display().to_string().bright_white()
    );
    Ok(())
}

pub async fn handle_user_runs(args: &ArgMatches, settings: &Settings) -> Result<()> {
    let mut settings = settings.clone();
    apply_overrides(&mut settings, args);

    let input = input_dir(args, &settings);
    let output = args
        .get_one::<PathBuf>("output")
        .cloned()
        .context("--output is required")?;
    let start_index = args.get_one::<usize>("start-index").copied().unwrap_or(0);
    let opts = aggregate_options(args);

    let users = corpus_users(&input, &opts)
        .with_context(|| format!("Failed to read users from {}", input.display()))?;
    let resolver = build_resolver(&settings, args)?;
    println!(
        "{} {} users, starting at {}",
        "→".blue(),
        users.len(),
        start_index.to_string().bright_white()
    );

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Counting verified runs...");
    let report = write_user_run_counts(&resolver, &output, &users, start_index, settings.final_date).await;
    spinner.finish_and_clear();
    let report = report?;

    println!(
        "{} Run counts for {} users written to {}",
        "✓".green().bold(),
        report.written,
        output.display().to_string().bright_white()
    );
    if report.unresolved > 0 {
        println!("{} {} users unknown upstream, written as Null", "⚠".yellow(), report.unresolved);
    }
    if let Some(index) = report.halted_at {
        println!(
            "{} Halted. Resume with {}",
            "⚠".yellow().bold(),
            format!("--start-index {}", index).bright_white()
        );
    }
    Ok(())
}

pub fn handle_filter(args: &ArgMatches, settings: &Settings) -> Result<()> {
    let edges_path = args
        .get_one::<PathBuf>("edges")
        .context("--edges is required")?;
    let output = args
        .get_one::<PathBuf>("output")
        .context("--output is required")?;
    let Some(filter) = load_filter(args, settings)? else {
        bail!("--filter-metadata is required");
    };

    let edges = EdgeList::read_csv(edges_path, Some(&filter))
        .with_context(|| format!("Failed to read edge list {}", edges_path.display()))?;
    edges.write_csv(output)?;

    println!(
        "{} Kept {} edges, written to {}",
        "✓".green().bold(),
        edges.len(),
        output.display().to_string().bright_white()
    );
    Ok(())
}
