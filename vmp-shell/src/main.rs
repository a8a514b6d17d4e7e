use anyhow::Result;
use clap::Parser;
use tracing_subscriber::filter::EnvFilter;

use vmp_shell::{Args, run};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run(args, &mut std::io::stdout().lock())
}
