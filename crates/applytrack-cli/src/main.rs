use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = applytrack_cli::Cli::parse();
    applytrack_cli::run_cli(cli)
}
