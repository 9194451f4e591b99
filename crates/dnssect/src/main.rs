use clap::Parser;
use std::env;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufRead, BufReader};
use tracing_subscriber::EnvFilter;

use dns_types::protocol::types::DomainName;
use dnssec_timing::axfr::{self, TransferError};
use dnssec_timing::config::{
    parse_resolvers, parse_server, Config, ConfigError, Transport, DEFAULT_MEASURE_CONCURRENCY,
    DEFAULT_PORT, DEFAULT_ZONE_CONCURRENCY,
};
use dnssec_timing::nameserver::NetworkExchange;
use dnssec_timing::pipeline::{self, PipelineError};
use dnssec_timing::report::{self, ReportError, ReportType};
use dnssec_timing::store::{Store, StoreError};

mod settings;

use settings::Settings;

// the doc comments for these structs turn into the CLI help text
#[derive(Parser)]
/// DNSSEC signature timing
///
/// Measures the validity windows of the signatures over the SOA, NS,
/// DNSKEY, and DS records of a list of domains, or of every domain
/// delegated from a zone, and reports on the stored measurements.
struct Args {
    /// Log more, can be given up to five times.  RUST_LOG overrides this
    #[clap(short, long, action(clap::ArgAction::Count), global = true)]
    verbose: u8,

    /// Path to a settings file [default: ~/.dnssect.yaml, then ./.dnssect.yaml]
    #[clap(long, value_parser, env = "DNSSECT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Measure every domain in a list
    Measure {
        #[clap(flatten)]
        query: QueryArgs,

        /// File of domain names, one per line [default: standard input]
        #[clap(value_parser)]
        file: Option<PathBuf>,
    },

    /// Transfer a zone and measure every domain delegated from it
    Zone {
        #[clap(flatten)]
        query: QueryArgs,

        /// Server to transfer the zone from [default: from the settings file]
        #[clap(long, value_parser)]
        server: Option<String>,

        /// Port of the server, if not given with it
        #[clap(long, default_value_t = DEFAULT_PORT, value_parser)]
        port: u16,

        /// Stop after this many domains, 0 for no limit
        #[clap(short, long, default_value_t = 0, value_parser)]
        max_domains: usize,

        /// Zone to transfer, "root" for the root zone
        #[clap(value_parser)]
        zone: String,
    },

    #[clap(flatten)]
    Report(ReportCommand),
}

#[derive(clap::Subcommand)]
enum ReportCommand {
    /// Print the SOA expire value of every measured domain
    Expire {
        #[clap(flatten)]
        store: StoreArgs,
    },

    /// Print signature lifetime and SOA expire of one domain
    Lifetime {
        /// Domain to report on
        #[clap(short, long, value_parser)]
        tld: DomainName,

        #[clap(flatten)]
        report: ReportArgs,
    },

    /// Count signatures by time remaining until expiry
    Remaining {
        #[clap(flatten)]
        report: ReportArgs,
    },

    /// Count ccTLDs and gTLDs with signatures expiring before their SOA expire
    Failed {
        #[clap(flatten)]
        report: ReportArgs,
    },

    /// Count ccTLDs and gTLDs by signature lifetime against RFC 6781 advice
    Rfc6781 {
        #[clap(flatten)]
        report: ReportArgs,
    },
}

#[derive(clap::Args)]
struct QueryArgs {
    /// Number of domains to query at once
    #[clap(short = 'c', long, value_parser)]
    concurrent: Option<usize>,

    /// Recursive resolver to query, can be given more than once
    #[clap(short = 'r', long = "resolver", value_parser)]
    resolvers: Vec<String>,

    /// Attempts per query before giving up on it
    #[clap(long, value_parser)]
    max_attempts: Option<usize>,

    /// Seconds to wait for each network operation
    #[clap(long, value_parser)]
    timeout: Option<u64>,

    /// "tcp" or "udp" (falling back to TCP for truncated responses)
    #[clap(long, value_parser)]
    transport: Option<Transport>,

    #[clap(flatten)]
    store: StoreArgs,
}

#[derive(clap::Args)]
struct StoreArgs {
    /// Database URL, like sqlite://timing.db?mode=rwc
    #[clap(long, value_parser)]
    database: Option<String>,
}

#[derive(clap::Args)]
struct ReportArgs {
    /// Record type to report on: NS or DNSKEY
    #[clap(short, long, default_value = "NS", value_parser)]
    rr: ReportType,

    #[clap(flatten)]
    store: StoreArgs,
}

fn begin_logging(verbose: u8) {
    let log_format = env::var("RUST_LOG_FORMAT").unwrap_or_default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(verbose)));

    let logger = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);

    if log_format.split(',').any(|option| option == "json") {
        logger.json().init();
    } else {
        logger.init();
    }
}

fn default_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 | 1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

/// Build the query settings: flags, then the settings file and
/// environment, then the defaults.
fn build_config(
    settings: &Settings,
    query: &QueryArgs,
    default_concurrency: usize,
) -> Result<Config, ConfigError> {
    let resolvers = if query.resolvers.is_empty() {
        settings.resolvers.to_vec()
    } else {
        query.resolvers.clone()
    };

    let mut config = Config::new(
        parse_resolvers(&resolvers)?,
        query
            .concurrent
            .or(settings.concurrent)
            .unwrap_or(default_concurrency),
    )?;

    if let Some(timeout) = query.timeout.or(settings.timeout) {
        config = config.with_timeout(Duration::from_secs(timeout))?;
    }
    if let Some(max_attempts) = query.max_attempts.or(settings.max_attempts) {
        config = config.with_max_attempts(max_attempts)?;
    }
    match (query.transport, &settings.transport) {
        (Some(transport), _) => config = config.with_transport(transport),
        (None, Some(transport)) => config = config.with_transport(transport.parse()?),
        (None, None) => (),
    }

    Ok(config)
}

async fn open_store(settings: &Settings, args: &StoreArgs) -> Result<Store, Error> {
    let Some(url) = args.database.as_ref().or(settings.database.as_ref()) else {
        return Err(Error::NoDatabase);
    };
    Ok(Store::open(url).await?)
}

/// The zone name as given on the command line, with "root" meaning
/// the root zone.
fn zone_apex(zone: &str) -> Option<DomainName> {
    if zone.eq_ignore_ascii_case("root") {
        Some(DomainName::root_domain())
    } else {
        DomainName::from_dotted_string(zone)
    }
}

async fn run_measure(settings: &Settings, query: QueryArgs, file: Option<PathBuf>) -> Result<(), Error> {
    let config = build_config(settings, &query, DEFAULT_MEASURE_CONCURRENCY)?;

    let domain_list: Box<dyn AsyncBufRead + Unpin + Send> = match file {
        Some(path) => match tokio::fs::File::open(&path).await {
            Ok(file) => Box::new(BufReader::new(file)),
            Err(error) => return Err(Error::DomainList { path, error }),
        },
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let store = open_store(settings, &query.store).await?;
    let summary = pipeline::measure(&config, NetworkExchange::new(&config), domain_list, &store).await;
    store.close().await;

    let summary = summary?;
    tracing::info!(
        facts = summary.facts,
        new_content = summary.new_content,
        unsigned = summary.unsigned,
        "measurement complete"
    );
    Ok(())
}

async fn run_zone(
    settings: &Settings,
    query: QueryArgs,
    server: Option<String>,
    port: u16,
    max_domains: usize,
    zone: String,
) -> Result<(), Error> {
    let config = build_config(settings, &query, DEFAULT_ZONE_CONCURRENCY)?;

    let Some(apex) = zone_apex(&zone) else {
        return Err(Error::BadZone(zone));
    };
    let Some(server) = server.as_deref().or_else(|| settings.zone_server(&zone)) else {
        return Err(Error::NoZoneServer(zone));
    };
    let server = parse_server(server, port)?;

    let store = open_store(settings, &query.store).await?;
    let zone_records = axfr::transfer(&apex, server, config.timeout).await?;
    let report = pipeline::crawl(
        &config,
        NetworkExchange::new(&config),
        apex,
        zone_records,
        max_domains,
        &store,
    )
    .await;
    store.close().await;

    let report = report?;
    for (domain, records) in &report.discovered {
        println!(";; {domain}");
        for rr in records {
            println!("{rr}");
        }
    }
    tracing::info!(
        domains = report.discovered.len(),
        facts = report.summary.facts,
        unsigned = report.summary.unsigned,
        "zone crawl complete"
    );
    Ok(())
}

fn print_rows<T: fmt::Display>(rows: &[T]) {
    for row in rows {
        println!("{row}");
    }
}

async fn run_report(settings: &Settings, command: ReportCommand) -> Result<(), Error> {
    match command {
        ReportCommand::Expire { store } => {
            let store = open_store(settings, &store).await?;
            print_rows(&report::expire(&store).await?);
        }
        ReportCommand::Lifetime { tld, report: args } => {
            let store = open_store(settings, &args.store).await?;
            print_rows(&report::lifetime(&store, &tld, args.rr).await?);
        }
        ReportCommand::Remaining { report: args } => {
            let store = open_store(settings, &args.store).await?;
            print_rows(&report::remaining(&store, args.rr).await?);
        }
        ReportCommand::Failed { report: args } => {
            let store = open_store(settings, &args.store).await?;
            print_rows(&report::failed(&store, args.rr).await?);
        }
        ReportCommand::Rfc6781 { report: args } => {
            let store = open_store(settings, &args.store).await?;
            print_rows(&report::rfc6781(&store, args.rr).await?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging(args.verbose);

    let settings = match Settings::new(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            tracing::error!(%error, "could not load settings");
            process::exit(1);
        }
    };

    let result = match args.command {
        Command::Measure { query, file } => run_measure(&settings, query, file).await,
        Command::Zone {
            query,
            server,
            port,
            max_domains,
            zone,
        } => run_zone(&settings, query, server, port, max_domains, zone).await,
        Command::Report(command) => run_report(&settings, command).await,
    };

    if let Err(error) = result {
        tracing::error!(%error, "fatal");
        process::exit(error.exit_code());
    }
}

#[derive(Debug)]
enum Error {
    Config(ConfigError),
    NoDatabase,
    BadZone(String),
    NoZoneServer(String),
    DomainList { path: PathBuf, error: io::Error },
    Store(StoreError),
    Transfer(TransferError),
    Pipeline(PipelineError),
    Report(ReportError),
}

impl Error {
    fn exit_code(&self) -> i32 {
        match self {
            Error::DomainList { .. } => 5,
            _ => 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(error) => write!(f, "{error}"),
            Error::NoDatabase => write!(f, "no database given"),
            Error::BadZone(zone) => write!(f, "'{zone}' is not a zone name"),
            Error::NoZoneServer(zone) => write!(f, "no server given for zone '{zone}'"),
            Error::DomainList { path, error } => {
                write!(f, "could not open domain list {}: {error}", path.display())
            }
            Error::Store(error) => write!(f, "{error}"),
            Error::Transfer(error) => write!(f, "zone transfer failed: {error}"),
            Error::Pipeline(error) => write!(f, "{error}"),
            Error::Report(error) => write!(f, "{error}"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Error::Store(error)
    }
}

impl From<TransferError> for Error {
    fn from(error: TransferError) -> Self {
        Error::Transfer(error)
    }
}

impl From<PipelineError> for Error {
    fn from(error: PipelineError) -> Self {
        Error::Pipeline(error)
    }
}

impl From<ReportError> for Error {
    fn from(error: ReportError) -> Self {
        Error::Report(error)
    }
}
