use clap::Parser;
use training::experiment::{run_erm, ErmRunArgs};

fn main() -> anyhow::Result<()> {
    let args = ErmRunArgs::parse();
    run_erm(args)
}
