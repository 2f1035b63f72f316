use anyhow::Context;
use clap::Parser;
use generator::profile::BeaconConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use trackcore::source::serial::DEFAULT_BAUD;
use trackcore::source::DEFAULT_LINE_CAP;
use trackcore::LocationTable;
use workflow::config::CollectorConfig;
use workflow::runner::Runner;

mod generator;
mod gui_bridge;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Multi-receiver beacon collector and position estimator")]
struct Args {
    /// Log every accepted reading
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
    /// Serial baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
    /// Only accept this device id (repeatable)
    #[arg(short, long = "filter")]
    filter: Vec<String>,
    /// Serial device to read (repeatable); ports take anchor roles in order
    #[arg(short, long = "port")]
    port: Vec<String>,
    /// TCP port to accept receivers on (repeatable)
    #[arg(short, long = "network")]
    network: Vec<u16>,
    /// Anchor distance
    #[arg(short, long, default_value_t = 10.0)]
    distance: f64,
    /// Lines per source before it stops; 0 reads forever
    #[arg(short, long, default_value_t = DEFAULT_LINE_CAP)]
    counter: u64,
    /// Write the raw-reading archive here on exit
    #[arg(short, long)]
    json: Option<PathBuf>,
    /// Peer collector to fetch archives from (repeatable)
    #[arg(short, long = "remote")]
    remote: Vec<String>,
    /// Archive path on the peer collectors
    #[arg(short, long)]
    location: Option<String>,
    /// Load the collector config from YAML instead of flags
    #[arg(long)]
    config: Option<PathBuf>,
    /// Pin a source to an anchor role, `<source>=<role>` (repeatable)
    #[arg(long = "anchor")]
    anchor: Vec<String>,
    /// Readings per complete group; defaults to the number of anchors
    #[arg(long)]
    receivers: Option<usize>,
    /// Write the location table here on exit
    #[arg(long)]
    locations: Option<PathBuf>,
    /// Drop incomplete groups older than this; 0 keeps them
    #[arg(long, default_value_t = 0)]
    expire_secs: u64,
    /// Serve /locations, /archive and /status on this address
    #[arg(long, num_args = 0..=1, default_missing_value = "127.0.0.1:9000")]
    http: Option<SocketAddr>,
    /// Replay N synthetic beacon events instead of reading receivers
    #[arg(long)]
    simulate: Option<usize>,
    /// Seed for --simulate
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl Args {
    fn to_config(&self) -> CollectorConfig {
        CollectorConfig {
            verbose: self.verbose,
            baud: self.baud,
            filters: self.filter.clone(),
            ports: self.port.clone(),
            network: self.network.clone(),
            distance: self.distance,
            counter: self.counter,
            json: self.json.clone(),
            locations: self.locations.clone(),
            remotes: self.remote.clone(),
            location: self.location.clone(),
            anchors: self.anchor.clone(),
            receivers: self.receivers,
            expire_secs: self.expire_secs,
            http: self.http,
            ..Default::default()
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn print_locations(locations: &LocationTable) {
    for location in locations.iter() {
        println!(
            "{} -> x {:.3}, y {:.3} ({} observations)",
            location.device_id, location.x, location.y, location.observation_count
        );
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let config = if let Some(path) = &args.config {
        CollectorConfig::load(path)?
    } else {
        args.to_config()
    };
    init_logging(args.verbose || config.verbose);

    let runtime = TokioBuilder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating collector runtime")?;
    let runner = Runner::new(config.clone());

    if let Some(events) = args.simulate {
        let beacons = BeaconConfig {
            events,
            distance: config.distance,
            seed: args.seed,
            ..Default::default()
        };
        let summary = runtime.block_on(runner.simulate(&beacons))?;
        for device in &summary.devices {
            println!(
                "{} placed at x {:.3}, y {:.3}",
                device.device_id, device.position.x, device.position.y
            );
        }
        print_locations(&summary.snapshot.locations);
        return Ok(ExitCode::SUCCESS);
    }

    let summary = runtime.block_on(async {
        let shutdown = CancellationToken::new();
        let on_signal = shutdown.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Interrupted, stopping sources");
                    on_signal.cancel();
                }
                Err(err) => log::warn!("Ctrl+C handler unavailable: {}", err),
            }
        });
        runner.execute(shutdown).await
    })?;

    print_locations(&summary.snapshot.locations);
    let counters = summary.snapshot.metrics;
    println!(
        "lines {} accepted {} filtered {} rejected {} completed {} estimated {} expired {} flushed {}",
        counters.lines,
        counters.accepted,
        counters.filtered,
        counters.rejected,
        counters.completed,
        counters.estimated,
        counters.expired,
        summary.snapshot.flushed_groups
    );

    let failures = summary.open_failures();
    if failures > 0 {
        log::error!("{} source(s) could not be opened", failures);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
