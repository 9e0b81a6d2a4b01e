use std::{
    error::Error,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use kusp::{
    KuspConfig, LennardJones,
    config::{DEFAULT_CONFIG_PATH, ModelConfig, timeout_from_millis},
    potential::{HELIUM_EPSILON, HELIUM_SIGMA},
    protocol::{ModelServer, ServerOptions},
    species::SpeciesTable,
};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about = "Serve a Lennard-Jones model over the KUSP protocol", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on, 0 picks a free one
    #[arg(long, default_value_t = 12345)]
    port: u16,
    /// Number of clients served concurrently
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Receive timeout per connection, 0 disables it
    #[arg(long, default_value_t = 15_000)]
    recv_timeout_ms: u64,
    /// Send timeout per connection, 0 disables it
    #[arg(long, default_value_t = 15_000)]
    send_timeout_ms: u64,
    /// Largest particle count accepted in one request
    #[arg(long, default_value_t = 1_000_000)]
    max_atoms: usize,
    /// Well depth
    #[arg(long, default_value_t = HELIUM_EPSILON)]
    epsilon: f64,
    /// Zero-crossing distance
    #[arg(long, default_value_t = HELIUM_SIGMA)]
    sigma: f64,
    /// Supported species, in code order
    #[arg(long, value_delimiter = ',', default_value = "He")]
    species: Vec<String>,
    /// Influence distance published to clients
    #[arg(long, default_value_t = 2.6)]
    influence_distance: f64,
    /// Where to write the client configuration
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let species = SpeciesTable::new(cli.species.iter().cloned())?;
    let potential = LennardJones::new(cli.epsilon, cli.sigma, species.len());

    let options = ServerOptions {
        workers: cli.workers,
        recv_timeout: timeout_from_millis(cli.recv_timeout_ms),
        send_timeout: timeout_from_millis(cli.send_timeout_ms),
        max_atoms: cli.max_atoms,
    };
    let server = ModelServer::bind((cli.host.as_str(), cli.port), Arc::new(potential), options)?;
    let addr = server.local_addr()?;

    let mut config = KuspConfig::for_server(
        cli.host.clone(),
        addr.port(),
        ModelConfig {
            species: species.symbols().to_vec(),
            influence_distance: cli.influence_distance,
        },
    );
    config.server.timeout_send_ms = cli.send_timeout_ms;
    config.server.timeout_recv_ms = cli.recv_timeout_ms;
    config.write(&cli.config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("interrupt received");
        flag.store(true, Ordering::SeqCst);
    })?;

    server.listen_until(shutdown)?;
    Ok(())
}
