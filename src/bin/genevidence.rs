use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use genevidence::cache::{CacheService, CacheSettings};
use genevidence::config::{ConfigLoader, ResolvedConfig};
use genevidence::domain::{GeneId, IngestionMode, SourceName};
use genevidence::error::IngestError;
use genevidence::gene::{GeneNormalizer, GeneRegistry, GeneResolver, HgncClient, NomenclatureAuthority};
use genevidence::http::FetchClient;
use genevidence::manager::{ConfiguredAdapters, IngestionManager, StartOutcome};
use genevidence::output::{
    CacheClearResult, JsonOutput, OutputMode, StatusReport, TextOutput, TopGenesResult,
};
use genevidence::processor::StreamingProcessor;
use genevidence::progress::TracingReporter;
use genevidence::scoring::ScoringEngine;
use genevidence::store::{EvidenceRepository, Store};

#[derive(Parser)]
#[command(name = "genevidence")]
#[command(about = "Incremental gene-evidence ingestion and percentile scoring")]
#[command(version)]
struct Cli {
    /// Path to genevidence.json (defaults to the working directory).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Ingest evidence from one source")]
    Ingest(IngestArgs),
    #[command(about = "Show the top-ranked genes of a source")]
    Score(ScoreArgs),
    #[command(about = "Show per-source scores for one gene")]
    Gene(GeneArgs),
    #[command(about = "Show checkpoint state of every configured source")]
    Status,
    #[command(about = "Inspect or clear the cache")]
    Cache(CacheArgs),
}

#[derive(Args)]
struct IngestArgs {
    source: String,

    #[arg(long, value_enum, default_value_t = IngestionMode::Smart)]
    mode: IngestionMode,

    /// Stop after this many pages; the run can be resumed later.
    #[arg(long)]
    max_pages: Option<u32>,
}

#[derive(Args)]
struct ScoreArgs {
    source: String,

    #[arg(long, default_value_t = 20)]
    top: usize,
}

#[derive(Args)]
struct GeneArgs {
    /// Approved symbol, alias or HGNC identifier.
    gene: String,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "Remove every entry of a namespace")]
    Clear { namespace: String },
    #[command(about = "Remove expired entries from disk")]
    Purge,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::InvalidGeneSymbol(_)
        | IngestError::InvalidSource(_)
        | IngestError::UnknownSource(_)
        | IngestError::MissingConfig
        | IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_)
        | IngestError::Normalization { .. } => 2,
        error if error.is_upstream() => 3,
        _ => 1,
    }
}

/// Process-wide services, built once and shared by reference.
struct Services {
    config: ResolvedConfig,
    store: Arc<Store>,
    cache: Arc<CacheService>,
    client: Arc<FetchClient>,
    registry: Arc<GeneRegistry>,
    scoring: Arc<ScoringEngine>,
}

impl Services {
    fn build(config: ResolvedConfig) -> Result<Self, IngestError> {
        let mut store = Store::new()?;
        if let Some(data_dir) = &config.data_dir {
            store = Store::new_with_paths(data_dir.clone(), store.cache_root().to_owned());
        }
        store.ensure_data_root()?;
        store.ensure_cache_root()?;
        let store = Arc::new(store);

        let cache_root = config
            .cache
            .root
            .clone()
            .unwrap_or_else(|| store.cache_root().to_owned());
        let cache = Arc::new(CacheService::new(CacheSettings {
            root: cache_root,
            tier1_capacity: config.cache.tier1_capacity,
            default_ttl: config.cache.default_ttl,
            namespace_ttls: config.cache.namespace_ttls.clone(),
        })?);
        let client = Arc::new(FetchClient::with_reqwest(
            Some(cache.clone()),
            config.http.clone(),
        )?);
        let registry = Arc::new(GeneRegistry::open(&store)?);
        let scoring = Arc::new(ScoringEngine::new(
            store.clone(),
            Some(cache.clone()),
            config.scoring.clone(),
        ));
        Ok(Self {
            config,
            store,
            cache,
            client,
            registry,
            scoring,
        })
    }

    fn resolver(&self) -> Arc<GeneResolver> {
        let authority: Arc<dyn NomenclatureAuthority> =
            Arc::new(HgncClient::new(self.client.clone(), Some(self.cache.clone())));
        Arc::new(GeneResolver::new(self.registry.clone(), Some(authority)))
    }

    fn manager(&self) -> IngestionManager {
        let processor = StreamingProcessor::new(
            self.store.clone(),
            self.resolver(),
            Arc::new(TracingReporter),
            self.config.processor.clone(),
        )
        .with_scoring(self.scoring.clone())
        .with_cache(self.cache.clone());
        let factory = ConfiguredAdapters::new(
            self.config.sources.clone(),
            self.client.clone(),
            self.registry.clone(),
        );
        IngestionManager::new(Arc::new(processor), Arc::new(factory), self.store.clone())
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let mut config = ConfigLoader::resolve_or_default(cli.config.as_deref())?;
    if let Commands::Ingest(args) = &cli.command {
        if args.max_pages.is_some() {
            config.processor.max_pages = args.max_pages;
        }
    }
    let services = Services::build(config)?;

    match cli.command {
        Commands::Ingest(args) => run_ingest(&services, args, output_mode),
        Commands::Score(args) => run_score(&services, args, output_mode),
        Commands::Gene(args) => run_gene(&services, args, output_mode),
        Commands::Status => run_status(&services, output_mode),
        Commands::Cache(args) => run_cache(&services, args, output_mode),
    }
}

fn run_ingest(services: &Services, args: IngestArgs, output_mode: OutputMode) -> miette::Result<()> {
    let source: SourceName = args.source.parse()?;
    services.config.source(&source)?;

    let manager = services.manager();
    if manager.start(&source, args.mode)? == StartOutcome::AlreadyRunning {
        return Err(miette::Report::msg(format!("{source} is already running")));
    }
    let summary = manager
        .wait(&source)
        .ok_or_else(|| miette::Report::msg(format!("no run recorded for {source}")))??;

    match output_mode {
        OutputMode::Json => JsonOutput::print_summary(&summary).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_summary(&summary).into_diagnostic()?,
    }
    Ok(())
}

fn run_score(services: &Services, args: ScoreArgs, output_mode: OutputMode) -> miette::Result<()> {
    let source: SourceName = args.source.parse()?;
    let genes = services.scoring.top_genes(&source, args.top)?;
    let result = TopGenesResult {
        source: source.to_string(),
        genes,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_top_genes(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_top_genes(&result).into_diagnostic()?,
    }
    Ok(())
}

fn run_gene(services: &Services, args: GeneArgs, output_mode: OutputMode) -> miette::Result<()> {
    let gene_id: GeneId = match args.gene.parse::<GeneId>() {
        Ok(id) => id,
        Err(_) => {
            let resolver = services.resolver();
            let gene = resolver.normalize(&args.gene)?;
            resolver.persist()?;
            gene.id
        }
    };
    let summary = services.scoring.gene_summary(&gene_id)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_gene(&summary).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_gene(&summary).into_diagnostic()?,
    }
    Ok(())
}

fn run_status(services: &Services, output_mode: OutputMode) -> miette::Result<()> {
    let manager = services.manager();
    let mut sources = Vec::new();
    let mut staged = 0;
    for settings in &services.config.sources {
        sources.push(manager.status(&settings.name)?);
        staged += services.store.list_staged(&settings.name)?.len();
    }
    let report = StatusReport {
        sources,
        genes: services.registry.len(),
        staged,
        cache: services.cache.stats(),
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_status(&report).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_status(&report).into_diagnostic()?,
    }
    Ok(())
}

fn run_cache(services: &Services, args: CacheArgs, output_mode: OutputMode) -> miette::Result<()> {
    let result = match args.command {
        CacheCommand::Clear { namespace } => {
            let removed = services.cache.invalidate_namespace(&namespace)?;
            CacheClearResult { namespace, removed }
        }
        CacheCommand::Purge => CacheClearResult {
            namespace: "*".to_string(),
            removed: services.cache.purge_expired()?,
        },
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_cache_clear(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_cache_clear(&result).into_diagnostic()?,
    }
    Ok(())
}
