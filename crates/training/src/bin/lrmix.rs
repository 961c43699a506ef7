use clap::Parser;
use training::experiment::{run_lrmix, LrmixArgs};

fn main() -> anyhow::Result<()> {
    let args = LrmixArgs::parse();
    run_lrmix(args)
}
