use clap::{crate_version, Parser};

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use dcnet::config::DcNetConfig;
use dcnet::control::control_slot;
use dcnet::event::TracingSink;
use dcnet::round::{RoundCoordinator, RoundOutcome};
use dcnet::scheduler::{ElementScheduler, ServerScheduler};
use dcnet::transport::Topology;
use dcnet::util;

#[derive(Debug, Parser)]
#[command(name = "dcnet")]
#[command(version = crate_version!())]
#[command(
    about = "DCNET - anonymous broadcast over a dining-cryptographers network",
    long_about = "Clients hand their elements to a set of servers such that no coalition short of every server can tell who sent what. Each round, every client masks its slots with keystreams shared with every server; the servers combine all ciphertexts and their own pads so that only the plaintext of slots used by a single client survives. Start every server first (ids 0..servers), then the clients (ids 0..clients). All participants must share the same configuration file."
)]
enum CliArgument {
    /// Run one round as a client, sending the elements of an input file.
    Client {
        /// Client id, from 0.
        #[clap(long, short)]
        id: usize,

        /// Number of servers in the deployment.
        #[clap(long, short)]
        servers: usize,

        /// Elements to send, one per line.
        #[clap(long)]
        input: PathBuf,

        /// Where to write the revealed round output.
        #[clap(long, short)]
        output: Option<PathBuf>,

        /// Write this client's slot assignment here.
        #[clap(long)]
        dump_slots: Option<PathBuf>,

        /// List unassigned slots in the slot dump too.
        #[clap(long)]
        verbose: bool,

        /// Cap on the slots each element is assigned to; 0 means no cap.
        #[clap(long)]
        slots_per_element: Option<usize>,
    },
    /// Run one round as a server.
    Server {
        /// Server id, from 0.
        #[clap(long, short)]
        id: usize,

        /// Number of clients in the whole deployment.
        #[clap(long, short)]
        clients: usize,

        /// Number of servers in the deployment.
        #[clap(long, short)]
        servers: usize,

        /// Where to write the revealed round output.
        #[clap(long, short)]
        output: Option<PathBuf>,

        /// Write the round statistics as JSON here.
        #[clap(long)]
        stats_json: Option<PathBuf>,
    },
    /// Generate synthetic client inputs `<dir>/<client>.csv`.
    GenInput {
        /// Number of clients.
        #[clap(long, short)]
        clients: usize,

        /// Values are drawn from 0..limit.
        #[clap(long, short, default_value_t = 1000)]
        limit: usize,

        /// Output directory.
        #[clap(long, short, default_value = "input")]
        dir: PathBuf,
    },
    /// Write the default configuration file.
    InitConfig {
        /// Destination of the file.
        #[clap(long, short, default_value = "dcnet.toml")]
        path: PathBuf,
    },
}

#[derive(Parser, Debug)]
#[clap(name = "dcnet")]
struct Opt {
    /// TOML configuration file. `DCNET_` environment variables override it.
    #[clap(long, short)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[clap(subcommand)]
    argument: CliArgument,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let opt = Opt::parse();

    match opt.argument {
        CliArgument::Client {
            id,
            servers,
            input,
            output,
            dump_slots,
            verbose,
            slots_per_element,
        } => {
            let config = DcNetConfig::load(opt.config.as_deref())?;
            let outcome = run_client(
                &config,
                id,
                servers,
                &input,
                dump_slots.as_deref(),
                verbose,
                slots_per_element,
            )
            .await?;
            report(&outcome, output.as_deref(), None)?;
        }

        CliArgument::Server {
            id,
            clients,
            servers,
            output,
            stats_json,
        } => {
            let config = DcNetConfig::load(opt.config.as_deref())?;
            let outcome = run_server(&config, id, clients, servers).await?;
            report(&outcome, output.as_deref(), stats_json.as_deref())?;
        }

        CliArgument::GenInput { clients, limit, dir } => {
            let files = util::gen_input(clients, limit, &dir)?;
            println!("✅ Wrote {} input files to {:?}", files.len(), dir);
        }

        CliArgument::InitConfig { path } => {
            DcNetConfig::write_default(&path)?;
            println!("✅ Wrote default configuration to {:?}", path);
        }
    }

    Ok(())
}

async fn run_client(
    config: &DcNetConfig,
    id: usize,
    servers: usize,
    input: &Path,
    dump_slots: Option<&Path>,
    verbose: bool,
    slots_per_element: Option<usize>,
) -> Result<RoundOutcome, Box<dyn Error>> {
    let mut scheduler = ElementScheduler::new(
        config.slot.estimated_elements_per_round,
        config.slot.fpr,
        config.slot.length,
    );

    let elements = util::read_elements(input)?;
    let rejected = elements.iter().filter(|e| !scheduler.add(e)).count();
    if rejected > 0 {
        warn!("⚠️ {} elements do not fit a slot and were skipped", rejected);
    }

    let limit = slots_per_element.or(config.slot.slots_per_element);
    if scheduler.finalize(limit) {
        warn!(
            "⚠️ {} elements could not be scheduled",
            scheduler.failures().len()
        );
    }
    debug!(
        "scheduled {} elements into {} slot assignments",
        scheduler.element_count(),
        scheduler.filled_count()
    );

    if let Some(path) = dump_slots {
        util::write_slot_dump(path, &scheduler, verbose)?;
    }

    let mut strategy = control_slot(
        config.slot.control,
        &scheduler,
        config.slot.attempts_per_slot,
        StdRng::from_entropy(),
    )?;
    let mut coordinator = RoundCoordinator::client(config, id, servers, TracingSink)?;

    let topology = Topology::from_config(config);
    let mut stream = topology.connect_client(id, servers).await?;
    let outcome = coordinator.run_client(strategy.as_mut(), &mut stream).await?;
    Ok(outcome)
}

async fn run_server(
    config: &DcNetConfig,
    id: usize,
    clients: usize,
    servers: usize,
) -> Result<RoundOutcome, Box<dyn Error>> {
    let mut coordinator = RoundCoordinator::server(config, id, clients, TracingSink)?;

    let topology = Topology::from_config(config);
    let listeners = topology.bind_server(id).await?;
    let mut links = topology
        .connect_server(&listeners, id, servers, clients)
        .await?;
    info!(
        "🔗 server {} connected to {} peers and {} clients",
        id,
        links.peers.len(),
        links.clients.len()
    );

    let scheduler =
        ServerScheduler::for_round(config.slot.estimated_elements_per_round, config.slot.fpr);
    let mut strategy = control_slot(
        config.slot.control,
        &scheduler,
        config.slot.attempts_per_slot,
        StdRng::from_entropy(),
    )?;
    let outcome = coordinator
        .run_server(strategy.as_mut(), &mut links.clients, &mut links.peers)
        .await?;
    Ok(outcome)
}

fn report(
    outcome: &RoundOutcome,
    output: Option<&Path>,
    stats_json: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    println!("✅ Round complete: {}", outcome.statistics);

    if let Some(path) = output {
        util::write_outputs(path, &outcome.outputs)?;
        println!("📝 Wrote {} revealed elements to {:?}", outcome.statistics.filled, path);
    }

    if let Some(path) = stats_json {
        fs::write(path, serde_json::to_string_pretty(&outcome.statistics)?)?;
    }
    Ok(())
}
