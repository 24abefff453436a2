use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use wavefetch::app::{App, ProgressSink};
use wavefetch::chunk::ChunkSpec;
use wavefetch::config::{ConfigLoader, ResolvedJob};
use wavefetch::domain::{
    IsolationMode, RectangularDomain, SelectionKey, TimeInterval, parse_instant,
};
use wavefetch::error::WavefetchError;
use wavefetch::fdsn::{Credentials, FdsnClientFactory};
use wavefetch::output::{JsonOutput, TextProgress};
use wavefetch::restrictions::DownloadRestrictions;
use wavefetch::sink::AsciiArtifactWriter;

#[derive(Parser)]
#[command(name = "wavefetch")]
#[command(about = "Concurrent bulk downloader for station time-series data")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download one selection, window split into chunks")]
    Fetch(JobArgs),
    #[command(about = "Expand a wildcarded selection and download every station")]
    Bulk(JobArgs),
    #[command(about = "Print the chunk plan without fetching")]
    Plan(JobArgs),
}

#[derive(Args, Clone)]
struct JobArgs {
    /// Job file (wavefetch.json); flags override its worker settings.
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    base_url: Option<String>,

    #[arg(long)]
    network: Option<String>,

    #[arg(long)]
    station: Option<String>,

    #[arg(long, default_value = "*")]
    location: String,

    #[arg(long, default_value = "*")]
    channel: String,

    /// Window start, e.g. 2019-04-23T00:00:00
    #[arg(long)]
    start: Option<String>,

    /// Southern bound of the station search rectangle, decimal degrees
    #[arg(long)]
    min_latitude: Option<f64>,

    #[arg(long)]
    max_latitude: Option<f64>,

    #[arg(long)]
    min_longitude: Option<f64>,

    #[arg(long)]
    max_longitude: Option<f64>,

    /// Window end (exclusive)
    #[arg(long)]
    end: Option<String>,

    #[arg(long)]
    chunk_length_sec: Option<u64>,

    #[arg(long, default_value_t = 0)]
    overlap_sec: u64,

    /// Trace grouping template, defaults to {network}.{station}.{channel}
    #[arg(long)]
    group_by: Option<String>,

    /// Waveform storage: template, directory, or sds:ROOT
    #[arg(long)]
    storage: Option<String>,

    /// Station metadata storage template (bulk mode)
    #[arg(long)]
    metadata_storage: Option<String>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, value_enum)]
    mode: Option<IsolationMode>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<WavefetchError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &WavefetchError) -> u8 {
    match error {
        WavefetchError::InvalidChunkLength
        | WavefetchError::NonAdvancingChunk { .. }
        | WavefetchError::InvalidTimeWindow { .. }
        | WavefetchError::InvalidTimestamp(_)
        | WavefetchError::InvalidSelection(_)
        | WavefetchError::InvalidDomain(_)
        | WavefetchError::InvalidConcurrency
        | WavefetchError::IncompatibleStorageGranularity(_)
        | WavefetchError::MissingConfig
        | WavefetchError::ConfigRead(_)
        | WavefetchError::ConfigParse(_) => 2,
        WavefetchError::StationHttp(_)
        | WavefetchError::StationStatus { .. }
        | WavefetchError::WaveformHttp(_)
        | WavefetchError::WaveformStatus { .. }
        | WavefetchError::NoDataAvailable(_)
        | WavefetchError::PayloadParse(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let progress: Box<dyn ProgressSink> = if cli.non_interactive {
        Box::new(JsonOutput)
    } else {
        Box::new(TextProgress)
    };

    match cli.command {
        Commands::Fetch(args) => {
            let job = resolve_job(&args)?;
            let (app, restrictions) = build_app(&job)?;
            let report = app
                .download_chunked(&restrictions, job.preprocess.as_ref(), progress.as_ref())
                .into_diagnostic()?;
            JsonOutput::print_report(&report).into_diagnostic()?;
            Ok(())
        }
        Commands::Bulk(args) => {
            let job = resolve_job(&args)?;
            let (app, restrictions) = build_app(&job)?;
            let report = app
                .download_by_station(&restrictions, job.preprocess.as_ref(), progress.as_ref())
                .into_diagnostic()?;
            JsonOutput::print_bulk(&report).into_diagnostic()?;
            Ok(())
        }
        Commands::Plan(args) => {
            let job = resolve_job(&args)?;
            let (app, restrictions) = build_app(&job)?;
            let plan = app.plan(&restrictions).into_diagnostic()?;
            JsonOutput::print_plan(&plan).into_diagnostic()?;
            Ok(())
        }
    }
}

fn build_app(
    job: &ResolvedJob,
) -> miette::Result<(App<FdsnClientFactory, AsciiArtifactWriter>, DownloadRestrictions)> {
    let factory = FdsnClientFactory::new(&job.base_url, job.credentials.clone());
    let app = App::new(
        factory,
        AsciiArtifactWriter,
        &job.storage,
        job.metadata_storage.clone(),
        job.workers,
        job.mode,
    )
    .into_diagnostic()?;
    Ok((app, job.restrictions.clone()))
}

fn resolve_job(args: &JobArgs) -> miette::Result<ResolvedJob> {
    if let Some(path) = &args.config {
        let mut job = ConfigLoader::resolve(Some(path)).into_diagnostic()?;
        if let Some(workers) = args.workers {
            job.workers = workers;
        }
        if let Some(mode) = args.mode {
            job.mode = mode;
        }
        return Ok(job);
    }

    let base_url = required(&args.base_url, "--base-url")?;
    let network = required(&args.network, "--network")?;
    let station = required(&args.station, "--station")?;
    let start = required(&args.start, "--start")?;
    let end = required(&args.end, "--end")?;
    let storage = required(&args.storage, "--storage")?;

    let selection =
        SelectionKey::new(&network, &station, &args.location, &args.channel).into_diagnostic()?;
    let window = TimeInterval::new(
        parse_instant(&start).into_diagnostic()?,
        parse_instant(&end).into_diagnostic()?,
    )
    .into_diagnostic()?;
    let domain = match (
        args.min_latitude,
        args.max_latitude,
        args.min_longitude,
        args.max_longitude,
    ) {
        (Some(min_lat), Some(max_lat), Some(min_lon), Some(max_lon)) => {
            Some(RectangularDomain::new(min_lat, max_lat, min_lon, max_lon).into_diagnostic()?)
        }
        (None, None, None, None) => None,
        _ => {
            return Err(miette::Report::msg(
                "all four of --min-latitude, --max-latitude, --min-longitude and --max-longitude must be given together",
            ));
        }
    };

    let restrictions = DownloadRestrictions::new(
        selection,
        window,
        ChunkSpec::new(args.chunk_length_sec, args.overlap_sec),
        args.group_by.clone(),
    )
    .with_domain(domain);

    let credentials = match (&args.user, &args.password) {
        (Some(user), Some(password)) => Some(Credentials {
            user: user.clone(),
            password: password.clone(),
        }),
        (None, None) => None,
        _ => {
            return Err(miette::Report::msg(
                "--user and --password must be given together",
            ));
        }
    };

    Ok(ResolvedJob {
        schema_version: 1,
        base_url,
        credentials,
        restrictions,
        storage,
        metadata_storage: args.metadata_storage.clone(),
        workers: args.workers.unwrap_or(1),
        mode: args.mode.unwrap_or(IsolationMode::Cooperative),
        preprocess: None,
    })
}

fn required(value: &Option<String>, flag: &str) -> miette::Result<String> {
    value
        .clone()
        .ok_or_else(|| miette::Report::msg(format!("{flag} is required without --config")))
}
