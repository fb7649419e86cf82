use std::process;

use clap::Parser;
use colored::Colorize;

use gatecheck::bench::alloc::CountingAllocator;
use gatecheck::cli::Cli;
use gatecheck::handlers::CommandStatus;

// Counting wrapper around the system allocator so `bench --memory` can
// read allocation totals for the measured phase.
#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

fn main() {
    gatecheck::bench::alloc::mark_installed();

    let cli = Cli::parse();
    cli.init_logging();
    let verbose = cli.verbose;

    match gatecheck::run_command(cli.command, cli.json) {
        Ok(CommandStatus::Success) => {}
        Ok(CommandStatus::Failure) => process::exit(1),
        Err(e) => {
            eprintln!("{} {e}", "error:".red());
            if verbose > 0 {
                eprintln!("{e:#?}");
            }
            process::exit(1);
        }
    }
}
