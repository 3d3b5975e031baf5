//! Famstore family member node executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use famstore::{
    logger_init, pf_error, pf_info, tcp_bind, tcp_bind_first_free,
    FamilyNode, FamstoreError, NodeInfo,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP shared by all family members.
    #[arg(long, default_value_t = Ipv4Addr::LOCALHOST)]
    host: Ipv4Addr,

    /// Well-known base port. The member bound to it is the leader.
    #[arg(short, long, default_value_t = 5555)]
    base_port: u16,

    /// Leader's client-facing control port.
    /// This port must be available when the leader launches.
    #[arg(short, long, default_value_t = 6666)]
    control_port: u16,

    /// Number of ports at and above the base port to try binding.
    #[arg(short = 'n', long, default_value_t = 16)]
    max_nodes: u16,

    /// Node configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(FamstoreError)` on any error.
    fn sanitize(&self) -> Result<(), FamstoreError> {
        if self.base_port <= 1024 {
            Err(FamstoreError::msg(format!(
                "invalid base_port {}",
                self.base_port
            )))
        } else if self.control_port <= 1024 {
            Err(FamstoreError::msg(format!(
                "invalid control_port {}",
                self.control_port
            )))
        } else if self.max_nodes == 0
            || self.base_port.checked_add(self.max_nodes).is_none()
        {
            Err(FamstoreError::msg(format!(
                "invalid max_nodes {}",
                self.max_nodes
            )))
        } else if self.control_port >= self.base_port
            && self.control_port - self.base_port < self.max_nodes
        {
            Err(FamstoreError::msg(format!(
                "control_port {} inside peer port range",
                self.control_port
            )))
        } else if self.threads < 2 {
            Err(FamstoreError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of a Famstore node.
fn node_main() -> Result<(), FamstoreError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let config_str = args.config.replace('+', "\n");

    let base_addr = SocketAddr::new(args.host.into(), args.base_port);
    let control_addr = SocketAddr::new(args.host.into(), args.control_port);

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-node")
            .build()?;

        // enter tokio runtime, claim my port, set up the node, and wait
        // for termination
        runtime.block_on(async move {
            let (peer_listener, port) =
                tcp_bind_first_free(base_addr, args.max_nodes).await?;
            let me = NodeInfo::new(args.host.to_string(), port);
            pf_info!(me; "bound peer port {}", port);

            let control_listener = if port == args.base_port {
                Some(tcp_bind(control_addr).await?)
            } else {
                None
            };

            let mut node = FamilyNode::new_and_setup(
                me,
                peer_listener,
                control_listener,
                args.base_port,
                Some(&config_str),
            )
            .await?;

            node.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), FamstoreError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a Famstore node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = node_main() {
        pf_error!("node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn valid_args() -> CliArgs {
        CliArgs {
            host: Ipv4Addr::LOCALHOST,
            base_port: 5555,
            control_port: 6666,
            max_nodes: 16,
            config: String::new(),
            threads: 2,
        }
    }

    #[test]
    fn sanitize_valid() {
        assert_eq!(valid_args().sanitize(), Ok(()));
    }

    #[test]
    fn sanitize_invalid_base_port() {
        let args = CliArgs {
            base_port: 1023,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_control_port() {
        let args = CliArgs {
            control_port: 80,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_control_port_in_peer_range() {
        let args = CliArgs {
            control_port: 5560,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
        let args = CliArgs {
            control_port: 5571,
            ..valid_args()
        };
        assert_eq!(args.sanitize(), Ok(()));
    }

    #[test]
    fn sanitize_invalid_max_nodes() {
        let args = CliArgs {
            max_nodes: 0,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
        let args = CliArgs {
            base_port: 65530,
            max_nodes: 16,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let args = CliArgs {
            threads: 1,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }
}
