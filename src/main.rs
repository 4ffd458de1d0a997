use std::path::PathBuf;
use std::process::ExitCode;

use log::error;

const HELP: &str = "\
sedged - a relay-aware DHCPv6 server

USAGE:
  sedged [OPTIONS] <config>

ARGS:
  <config>            configuration file (JSON)

OPTIONS:
  -v, --verbose       log more (repeat for debug output)
  -h, --help          show this help
";

struct Args {
    config: PathBuf,
    verbosity: u8,
}

fn parse_args() -> Result<Args, pico_args::Error> {
    let mut args = pico_args::Arguments::from_env();

    if args.contains(["-h", "--help"]) {
        print!("{}", HELP);
        std::process::exit(0);
    }

    let mut verbosity = 0u8;
    while args.contains(["-v", "--verbose"]) {
        verbosity += 1;
    }

    let config = args.free_from_str()?;

    let remaining = args.finish();
    if !remaining.is_empty() {
        return Err(pico_args::Error::ArgumentParsingFailed {
            cause: format!("unexpected arguments: {:?}", remaining),
        });
    }

    Ok(Args { config, verbosity })
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            eprint!("{}", HELP);
            return ExitCode::FAILURE;
        }
    };

    let default_level = match args.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match sedge::server::run(&args.config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
