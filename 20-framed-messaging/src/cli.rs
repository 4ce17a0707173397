use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay server.
    Server(ServerArgs),
    /// Connect to a relay server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:60005")]
    pub listen: String,

    /// Refuse new clients once this many are connected.
    #[arg(long)]
    pub max_clients: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Host name or address of the relay server.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port of the relay server.
    #[arg(long, default_value_t = crate::config::DEFAULT_PORT)]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn server_defaults() {
        let cli = Cli::parse_from(["framed_messaging", "server"]);
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.listen, "127.0.0.1:60005");
        assert_eq!(args.max_clients, None);
    }

    #[test]
    fn client_flags() {
        let cli = Cli::parse_from(["framed_messaging", "client", "--host", "::1", "--port", "7000"]);
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.host, "::1");
        assert_eq!(args.port, 7000);
    }
}
