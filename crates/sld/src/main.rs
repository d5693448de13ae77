//! sld CLI - static ELF32 loader

mod cli;

use std::ffi::OsString;
use std::process;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing::error;
use tracing_subscriber::EnvFilter;

use cli::{Cli, EXIT_FAILURE};
use sld::{Loader, NativeTransfer, Reporter};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) if e.kind() == ErrorKind::MissingRequiredArgument => {
            println!("{}", Cli::command().render_usage());
            process::exit(EXIT_FAILURE);
        }
        Err(e) => {
            let _ = e.print();
            process::exit(EXIT_FAILURE);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_directive())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let env: Vec<OsString> = std::env::vars_os()
        .map(|(key, value)| {
            let mut var = key;
            var.push("=");
            var.push(value);
            var
        })
        .collect();
    let silent = cli.silent;
    let (path, args) = cli.into_image();
    let loader = Loader::new(path, args).with_env(env);
    let mut transfer = NativeTransfer::default();

    let result = if silent {
        loader.run(&mut Reporter::silent(), &mut transfer)
    } else {
        loader.run(&mut Reporter::stdout(), &mut transfer)
    };

    match result {
        Ok(never) => match never {},
        Err(e) => {
            error!(path = %loader.path().display(), stage = %e.stage(), "{e}");
            process::exit(EXIT_FAILURE);
        }
    }
}
