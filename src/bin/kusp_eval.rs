use std::{error::Error, path::PathBuf};

use clap::Parser;
use kusp::{KuspConfig, RemoteModel, xyz::load_xyz};

#[derive(Debug, Parser)]
#[command(version, about = "Evaluate an .xyz file against a KUSP model server", long_about = None)]
struct Cli {
    /// Client configuration, defaults to $KUSP_CONFIG or ./kusp_config.yaml
    #[arg(long)]
    config: Option<PathBuf>,
    /// Particles to evaluate
    xyz: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = KuspConfig::load_default(cli.config.as_deref())?;
    let model = RemoteModel::from_config(&config)?;

    let particles = load_xyz(&cli.xyz)?;
    let contributing = vec![1; particles.len()];
    let eval = model.compute_symbols(&particles.symbols, &particles.coordinates, &contributing)?;
    model.close();

    println!("energy: {}", eval.energy);
    for (symbol, force) in particles.symbols.iter().zip(eval.forces.chunks_exact(3)) {
        println!("{symbol} {} {} {}", force[0], force[1], force[2]);
    }

    Ok(())
}
