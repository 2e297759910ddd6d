//! Join a Thread network through a KBI module and exchange a UDP echo
//! payload with a peer, grounded on `examples/client-server.c`.

use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use kbi::{Channel, Command, CommandFunction, OutboundDatagram, Session};
use tracing::{error, info};

const SERVER_UDP_PORT: u16 = 7485;
const ECHO_PAYLOAD: &str = "Hello, world!";
const SESSION_DURATION_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Role {
    Client,
    Server,
}

/// Join a KiNOS Thread network and run a UDP echo client or server.
#[derive(Debug, Parser)]
struct Args {
    /// Serial device the module is attached to.
    #[arg(long)]
    port: String,

    /// Which side of the echo exchange to run.
    #[arg(long, value_enum)]
    role: Role,

    /// Thread channel, 11..=26.
    #[arg(long, default_value_t = 15)]
    channel: u8,

    /// PAN ID, as a 4-digit hex string.
    #[arg(long, default_value = "1234")]
    pan_id: String,

    /// Human-readable network name.
    #[arg(long, default_value = "KBI Network")]
    network_name: String,

    /// Mesh-local prefix, as an IPv6 literal.
    #[arg(long)]
    mesh_local_prefix: String,

    /// Master key, as a 32-digit hex string.
    #[arg(long)]
    master_key: String,

    /// Extended PAN ID, as a 16-digit hex string.
    #[arg(long)]
    extended_pan_id: String,

    /// Out-of-band commissioning credential.
    #[arg(long, default_value = "KIRALE")]
    commissioning_credential: String,

    /// Server's IPv6 address, required when `--role client`. The reference
    /// driver derives this from the mesh-local prefix plus the parent's
    /// RLOC16; this driver takes it directly since the host CLI has no way
    /// to know which node is acting as the leader ahead of time.
    #[arg(long, required_if_eq("role", "client"))]
    peer: Option<String>,
}

fn hex_decode(s: &str) -> Result<Vec<u8>, kbi::Error> {
    if s.len() % 2 != 0 {
        return Err(kbi::Error::RequestFailed);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| kbi::Error::RequestFailed))
        .collect()
}

fn join_network(session: &mut Session<kbi::SerialTransport>, args: &Args) -> Result<(), kbi::Error> {
    session.cmd(CommandFunction::Write, Command::Clear, &[])?;
    session.wait_for(Command::Status, &[0x00, 0x00], Duration::from_secs(5))?;

    session.cmd(CommandFunction::Write, Command::OobCommissioningMode, &[0x01])?;

    let channel = Channel::new(args.channel).ok_or(kbi::Error::RequestFailed)?;
    session.cmd(CommandFunction::Write, Command::Channel, &[channel.get()])?;
    session.cmd(CommandFunction::Write, Command::PanId, &hex_decode(&args.pan_id)?)?;
    session.cmd(CommandFunction::Write, Command::NetworkName, args.network_name.as_bytes())?;

    let prefix: Ipv6Addr = args.mesh_local_prefix.parse().map_err(|_| kbi::Error::RequestFailed)?;
    session.cmd(CommandFunction::Write, Command::MeshLocalPrefix, &prefix.octets())?;
    session.cmd(CommandFunction::Write, Command::MasterKey, &hex_decode(&args.master_key)?)?;
    session.cmd(CommandFunction::Write, Command::ExtendedPanId, &hex_decode(&args.extended_pan_id)?)?;
    session.cmd(
        CommandFunction::Write,
        Command::CommissioningCredential,
        args.commissioning_credential.as_bytes(),
    )?;

    session.cmd(CommandFunction::Write, Command::IfUp, &[])?;
    session.wait_for(Command::Status, &[0x05], Duration::from_secs(20))?;
    Ok(())
}

fn run_server(session: &mut Session<kbi::SerialTransport>) -> Result<(), kbi::Error> {
    session.socket_bind(
        SERVER_UDP_PORT,
        Box::new(|_loc_port, peer_port, peer_addr, payload| {
            info!(peer_addr, peer_port, len = payload.len(), "echoing datagram");
            Some(OutboundDatagram {
                loc_port: SERVER_UDP_PORT,
                peer_port,
                peer_name: peer_addr.to_string(),
                payload: payload.to_vec(),
            })
        }),
    )?;

    let deadline = Instant::now() + Duration::from_secs(SESSION_DURATION_SECS);
    while Instant::now() < deadline {
        session.notification_pump()?;
    }
    Ok(())
}

fn run_client(session: &mut Session<kbi::SerialTransport>, peer_name: &str) -> Result<(), kbi::Error> {
    let loc_port = session.socket_connect(
        0,
        SERVER_UDP_PORT,
        peer_name,
        Box::new(|_loc_port, peer_port, peer_addr, payload| {
            info!(peer_addr, peer_port, len = payload.len(), "received reply");
            None
        }),
    )?;

    let deadline = Instant::now() + Duration::from_secs(SESSION_DURATION_SECS);
    while Instant::now() < deadline {
        session.socket_send(loc_port, SERVER_UDP_PORT, None, ECHO_PAYLOAD.as_bytes())?;
        std::thread::sleep(Duration::from_secs(1));
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut session = match Session::init(&args.port) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open KBI device");
            std::process::exit(1);
        }
    };

    if let Err(e) = join_network(&mut session, &args) {
        error!(error = %e, "failed to join the Thread network");
        std::process::exit(1);
    }

    let result = match args.role {
        Role::Server => run_server(&mut session),
        Role::Client => {
            let peer = args.peer.as_deref().expect("clap enforces --peer for --role client");
            run_client(&mut session, peer)
        }
    };

    if let Err(e) = result {
        error!(error = %e, "echo session failed");
        std::process::exit(1);
    }
}
