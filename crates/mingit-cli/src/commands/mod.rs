pub mod multi_pack_index;
pub mod sparse_checkout;

use clap::Subcommand;

use crate::Cli;

#[derive(Subcommand)]
pub enum Command {
    /// Manage sparse-checkout patterns and configuration
    SparseCheckout(sparse_checkout::SparseCheckoutArgs),
    /// Write or verify a multi-pack index
    MultiPackIndex(multi_pack_index::MultiPackIndexArgs),
}

pub fn run(cli: &Cli) -> anyhow::Result<i32> {
    match &cli.command {
        Command::SparseCheckout(args) => sparse_checkout::run(args, cli),
        Command::MultiPackIndex(args) => multi_pack_index::run(args, cli),
    }
}
