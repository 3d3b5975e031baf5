//! Famstore client side executable.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use tokio::runtime::Builder;

use famstore::{logger_init, pf_error, ControlClient, FamstoreError};

mod repl;

use crate::repl::{ClientRepl, ReplCommand};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Leader's control address.
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], 6666)))]
    leader: SocketAddr,

    /// Single command to run instead of the interactive loop, e.g.
    /// 'set 100 hello'.
    #[arg(short, long)]
    command: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(FamstoreError)` on any error.
    fn sanitize(&self) -> Result<(), FamstoreError> {
        if self.leader.port() <= 1024 {
            Err(FamstoreError::msg(format!(
                "invalid leader port {}",
                self.leader.port()
            )))
        } else if self.threads < 1 {
            Err(FamstoreError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of Famstore client.
fn client_main() -> Result<(), FamstoreError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // parse the one-shot command early so typos fail before connecting
    let oneshot = match &args.command {
        Some(cmd) => match ClientRepl::parse_input(cmd)? {
            ReplCommand::Normal(line) => Some(line),
            _ => {
                return Err(FamstoreError::msg(format!(
                    "'{}' is not a set/get command",
                    cmd
                )))
            }
        },
        None => None,
    };

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let client = ControlClient::connect(args.leader).await?;
        let mut repl = ClientRepl::new(client);

        match oneshot {
            Some(line) => repl.eval_line(&line).await,
            None => repl.run().await,
        }
    })
}

/// Main function of Famstore client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    #[test]
    fn sanitize_valid() -> Result<(), FamstoreError> {
        let args = CliArgs {
            leader: "127.0.0.1:6666".parse()?,
            command: None,
            threads: 2,
        };
        assert_eq!(args.sanitize(), Ok(()));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_leader_port() -> Result<(), FamstoreError> {
        let args = CliArgs {
            leader: "127.0.0.1:80".parse()?,
            command: Some("get 1".into()),
            threads: 2,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), FamstoreError> {
        let args = CliArgs {
            leader: "127.0.0.1:6666".parse()?,
            command: None,
            threads: 0,
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }
}
