//! pictor CLI entry point

// The panic hook reports on stderr directly since tracing may be unusable there
#![allow(clippy::print_stderr)]

use pictor_cli::cli::{self, Cli, render_error};
use pictor_cli::commands::{self, Command, Context};
use pictor_cli::tracing::{TracingConfig, TracingFormat, init_tracing};
use pictor_cli::{CliError, EXIT_OK, exit_code_for};
use std::io::Write;

fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=pictor=debug for more information.");
    }));

    let cli = cli::parse();
    let json = cli.json;
    let exit_code = match run(cli) {
        Ok(()) => EXIT_OK,
        Err(err) => {
            let code = exit_code_for(&err);
            render_error(err, json);
            code
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<(), CliError> {
    init_tracing(TracingConfig {
        format: if cli.json {
            TracingFormat::Json
        } else {
            TracingFormat::Compact
        },
        level: cli.level.into(),
        filter: None,
    })
    .map_err(|e| CliError::Tracing {
        message: e.to_string(),
    })?;

    let context = Context {
        config: cli.config,
        dir: cli.dir,
        json: cli.json,
    };
    let command = Command::from(cli.command);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    commands::execute(command, &context, &mut out)?;
    out.flush().map_err(CliError::output)
}
