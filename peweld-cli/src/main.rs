mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })
    .expect("failed to set Ctrl+C handler");

    let cli = Cli::parse();

    // Show peweld info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("peweld", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    let result = match &cli.command {
        Command::Embed { host, paths, flags } => {
            commands::embed::run(host, paths, flags, &cli.global)
        }
        Command::Info { path } => commands::info::run(path, &cli.global),
        Command::Imports { path } => commands::imports::run(path, &cli.global),
        Command::Exports { path } => commands::exports::run(path, &cli.global),
    };

    if let Err(error) = result {
        eprintln!("error: {error:#}");
        let code = error
            .downcast_ref::<peweld::Error>()
            .map_or(1, peweld::Error::exit_code);
        std::process::exit(code);
    }
}
