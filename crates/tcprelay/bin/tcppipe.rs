//! Concurrent byte-stream relay: accepts clients for ever and runs a
//! capped number of full-duplex sessions between two endpoints.

use anyhow::Result;
use std::io;
use std::process;
use tcprelay::cli::{self, PipeOptions};
use tcprelay::session::{RelayConfig, Supervisor, SupervisorError};

fn main() {
    env_logger::init();

    let options = match cli::parse_pipe(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("{}", cli::pipe_usage());
            process::exit(1);
        }
    };

    if let Err(err) = run(&options) {
        eprintln!("{err:#}");
        process::exit(exit_code(&err));
    }
}

fn run(options: &PipeOptions) -> Result<()> {
    let config = RelayConfig::new(options.max_sessions, options.max_dials, options.io_timeout);
    let supervisor = Supervisor::new(config);
    supervisor.run(&options.first, &options.second)?;
    Ok(())
}

/// 0 on clean termination, 1 on configuration problems, the errno for I/O
/// subsystem failures.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(sup_err) = cause.downcast_ref::<SupervisorError>() {
            return sup_err.raw_os_error().unwrap_or(1);
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if let Some(code) = io_err.raw_os_error() {
                return code;
            }
        }
    }
    1
}
