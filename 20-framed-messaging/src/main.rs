use std::io::{self, BufRead};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use tracing::info;

use framed_messaging::{
    Client, Server, ServerConfig,
    chat::{ChatClient, ChatEvent, ConsoleCommand, RelayServer, TextMessage},
    cli::{Cli, ClientArgs, Command, ServerArgs},
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args),
        Command::Client(args) => run_client(args),
    }
}

fn run_server(args: ServerArgs) -> Result<()> {
    let (events_tx, events_rx) = unbounded();
    let handler = RelayServer::new(args.max_clients).with_events(events_tx);
    let mut server = Server::bind(ServerConfig::new(args.listen.as_str()), handler)
        .with_context(|| format!("failed to bind {}", args.listen))?;
    server.start().context("failed to start server")?;
    info!(addr = %server.local_addr(), "relay server running");

    loop {
        if !server.process_message() {
            thread::sleep(POLL_INTERVAL);
        }
        for event in events_rx.try_iter() {
            print_event(&event);
        }
    }
}

fn run_client(args: ClientArgs) -> Result<()> {
    let (events_tx, events_rx) = unbounded();
    let mut client = Client::new(ChatClient::new(events_tx));
    client
        .connect(&args.host, args.port)
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    let lines = spawn_stdin_reader()?;

    while client.is_connected() {
        while client.process_message() {}
        for event in events_rx.try_iter() {
            print_event(&event);
            if matches!(event, ChatEvent::Refused(_)) {
                client.disconnect();
            }
        }

        match lines.recv_timeout(POLL_INTERVAL) {
            Ok(line) => match ConsoleCommand::parse(&line) {
                Some(ConsoleCommand::Exit) => client.disconnect(),
                Some(ConsoleCommand::Say(recipient, text)) => {
                    client.send(TextMessage::new(client.id(), recipient, text).encode()?);
                }
                None => {}
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => client.disconnect(),
        }
    }

    // A refusal usually arrives together with the loss of the connection.
    while client.process_message() {}
    for event in events_rx.try_iter() {
        print_event(&event);
    }
    Ok(())
}

fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("failed to spawn stdin reader")?;
    Ok(rx)
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::Joined(id) => println!("*** client {id} joined"),
        ChatEvent::Left(id) => println!("*** client {id} left"),
        ChatEvent::Accepted(id) => println!("*** connected as client {id}"),
        ChatEvent::Refused(reason) => println!("*** server refused connection: {reason}"),
        ChatEvent::Text(text) => println!("[{}] {}", text.sender, text.text),
        ChatEvent::Lost => println!("*** lost connection with server"),
    }
}
