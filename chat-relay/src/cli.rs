use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::RelayConfig;

const MIN_SEND_TIMEOUT_MS: u64 = 10;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, fanning every chat message out to all clients.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = "0.0.0.0:5000")]
    pub listen: SocketAddr,

    /// Messages buffered per client before slow consumers start dropping.
    #[arg(long, env = "CHAT_RELAY_QUEUE_CAPACITY", default_value_t = RelayConfig::DEFAULT_OUTBOUND_CAPACITY)]
    pub queue_capacity: usize,

    /// How long a single delivery may wait on a slow client, in milliseconds.
    #[arg(
        long,
        env = "CHAT_RELAY_SEND_TIMEOUT_MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(MIN_SEND_TIMEOUT_MS..)
    )]
    pub send_timeout_ms: u64,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            outbound_capacity: self.queue_capacity.max(1),
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name attached to every message you send.
    #[arg(long)]
    pub name: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_bind_all_interfaces_on_5000() {
        let cli = Cli::try_parse_from(["chat-relay", "server"]).expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.listen, "0.0.0.0:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(args.relay_config(), RelayConfig::default());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cli = Cli::try_parse_from(["chat-relay", "server", "--queue-capacity", "0"])
            .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.relay_config().outbound_capacity, 1);
    }

    #[test]
    fn send_timeout_below_minimum_is_rejected() {
        let rejected = Cli::try_parse_from(["chat-relay", "server", "--send-timeout-ms", "0"]);
        assert!(rejected.is_err());

        let cli = Cli::try_parse_from(["chat-relay", "server", "--send-timeout-ms", "10"])
            .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.relay_config().send_timeout, Duration::from_millis(10));
    }
}
