mod backend;
mod cli;
mod listener;
mod paths;
mod run;

use anyhow::Result;
use cli::Command;

fn main() -> Result<()> {
    let cli = cli::parse();
    if let Some(Command::CheckConfig { file }) = &cli.command {
        return run::check_config(file, &cli.overrides);
    }

    let config = run::resolve(&cli.overrides)?;
    run::initialise_tracing(&config.log_filter);

    match cli.command {
        Some(Command::Caps(args)) => run::print_caps(&config, args.json),
        _ => run::serve(&config),
    }
}
