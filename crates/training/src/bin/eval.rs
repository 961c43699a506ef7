use clap::Parser;
use training::experiment::{run_eval, EvalArgs};

fn main() -> anyhow::Result<()> {
    let args = EvalArgs::parse();
    run_eval(args)
}
