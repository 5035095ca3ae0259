use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use maclease::{
    Action, Client, ClientConfig, Error, Packet, Result, Server, ServerConfig,
};

#[derive(Parser)]
#[command(name = "maclease")]
#[command(author, version, about = "A MAC address block leasing tool", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the client configuration, creating a default file if needed.
    ShowClientConfig {
        #[arg(short, long, default_value = "client.json")]
        config: PathBuf,
    },
    /// Print the server configuration, creating a default file if needed.
    ShowServerConfig {
        #[arg(short, long, default_value = "server.json")]
        config: PathBuf,
    },
    /// Decode and check a protocol frame given as hex bytes.
    Decode { hex: String },
    /// Run a client and a server against each other in memory and print
    /// the exchanged frames.
    Simulate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Commands::ShowClientConfig { config } => {
            let config = ClientConfig::load_or_create(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ShowServerConfig { config } => {
            let config = ServerConfig::load_or_create(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Decode { hex } => {
            let bytes = parse_hex(&hex)?;
            let packet = Packet::parse(&bytes)?;
            println!("{packet:#?}");
            match packet.validate() {
                Ok(()) => println!("frame is legal"),
                Err(error) => println!("frame is illegal: {error}"),
            }
            Ok(())
        }
        Commands::Simulate => simulate(),
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if digits.len() % 2 != 0 {
        return Err(Error::InvalidPacket("odd number of hex digits".to_string()));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| Error::InvalidPacket("invalid hex digit".to_string()))
        })
        .collect()
}

/// Drives one client against one server without a network, printing each
/// frame as it would appear on the wire.
fn simulate() -> Result<()> {
    let server_config = ServerConfig {
        interface: "sim0".to_string(),
        src_addr: 0x0202_0000_0001,
        unicast_set: maclease::AddrInterval::from_count(0x0a00_0000_0000, 256),
        max_unicast: 16,
        max_default: 16,
        ..Default::default()
    };
    server_config.validate()?;
    let client_config = ClientConfig {
        interface: "sim0".to_string(),
        ..Default::default()
    };
    client_config.validate()?;

    let mut server = Server::new(server_config);
    let mut client = Client::new(client_config);
    server.start();

    let mut frames: Vec<Packet> = collect_frames(client.start());
    for round in 0..8 {
        let mut next = Vec::new();
        for frame in frames {
            println!(
                ">> {:?} from {:012x} to {:012x}",
                frame.msg_type, frame.src, frame.dest
            );
            for action in server.handle_frame(&frame.encode()) {
                if let Action::Send(reply) = action {
                    println!(
                        "<< {:?} from {:012x} to {:012x} ({:?})",
                        reply.msg_type, reply.src, reply.dest, reply.status
                    );
                    next.extend(collect_frames(client.handle_frame(&reply.encode())));
                }
            }
        }
        client.advance(1.0);
        next.extend(collect_frames(client.poll()));
        frames = next;
        if client.is_bound() {
            info!(round, "client bound");
            break;
        }
    }

    match client.assigned_set() {
        Some(set) => println!("leased {set}"),
        None => println!("negotiation did not finish"),
    }
    for frame in collect_frames(client.stop()) {
        println!(
            ">> {:?} from {:012x} to {:012x}",
            frame.msg_type, frame.src, frame.dest
        );
        server.handle_frame(&frame.encode());
    }
    Ok(())
}

fn collect_frames(actions: Vec<Action>) -> Vec<Packet> {
    actions
        .into_iter()
        .filter_map(|action| match action {
            Action::Send(pkt) => Some(pkt),
            _ => None,
        })
        .collect()
}
