use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use log::{error, info, LevelFilter};
use openmanet::ptt::{PttConfig, PttKey, DEFAULT_MULTICAST_GROUP, DEFAULT_MULTICAST_PORT};
use openmanet::workers::Intervals;
use openmanet::{Config, Node, DEFAULT_BAT_HOSTS_PATH, DEFAULT_MESH_INTERFACE};
use std::net::Ipv4Addr;
use tokio::signal::{self, unix::SignalKind};

#[derive(Parser)]
#[command(version, about = "Control plane daemon for OpenMANET mesh nodes")]
struct Cli {
    /// Enable debug logging. Does nothing if `--silent` is set.
    #[arg(short = 'd', long = "debug", default_value_t = false)]
    debug: bool,

    /// Disable all logs except error logs.
    #[arg(long = "silent", default_value_t = false)]
    silent: bool,

    /// List the kernel input devices usable as a PTT button and exit.
    #[arg(long = "list-input-devices", default_value_t = false)]
    list_input_devices: bool,

    #[clap(flatten)]
    node_args: NodeArguments,
}

#[derive(Debug, Args)]
struct NodeArguments {
    /// Name of the mesh bridge interface.
    #[arg(short = 'i', long = "interface", default_value = DEFAULT_MESH_INTERFACE)]
    interface: String,

    /// Path of the Alfred daemon socket.
    #[arg(long = "alfred-socket", default_value = openmanet::alfred::DEFAULT_SOCKET_PATH)]
    alfred_socket: PathBuf,

    /// Path of the batman-adv hosts file, cleared at startup.
    #[arg(long = "bat-hosts", default_value = DEFAULT_BAT_HOSTS_PATH)]
    bat_hosts: PathBuf,

    /// Root directory of the UCI configuration tree.
    #[arg(long = "uci-tree", default_value = openmanet::uci::DEFAULT_TREE_PATH)]
    uci_tree: PathBuf,

    /// Disable the gateway record workers.
    #[arg(long = "no-gateway-records", default_value_t = false)]
    no_gateway_records: bool,

    /// Disable the node presence workers.
    #[arg(long = "no-node-records", default_value_t = false)]
    no_node_records: bool,

    /// Disable the address reservation workers.
    #[arg(long = "no-address-reservation", default_value_t = false)]
    no_address_reservation: bool,

    /// Gateway record send interval in seconds.
    #[arg(long = "gateway-send-interval", default_value_t = 60)]
    gateway_send_interval: u64,

    /// Gateway record receive interval in seconds.
    #[arg(long = "gateway-recv-interval", default_value_t = 10)]
    gateway_recv_interval: u64,

    /// Node record send interval in seconds.
    #[arg(long = "node-send-interval", default_value_t = 60)]
    node_send_interval: u64,

    /// Node record receive interval in seconds.
    #[arg(long = "node-recv-interval", default_value_t = 60)]
    node_recv_interval: u64,

    /// Address reservation send interval in seconds.
    #[arg(long = "reservation-send-interval", default_value_t = 4)]
    reservation_send_interval: u64,

    /// Address reservation receive interval in seconds.
    #[arg(long = "reservation-recv-interval", default_value_t = 10)]
    reservation_recv_interval: u64,

    /// Enable the push-to-talk voice pipeline.
    #[arg(long = "ptt", default_value_t = false)]
    ptt: bool,

    /// Multicast group voice frames are sent to.
    #[arg(long = "ptt-multicast-group", default_value_t = DEFAULT_MULTICAST_GROUP)]
    ptt_multicast_group: Ipv4Addr,

    /// Multicast port for voice frames.
    #[arg(long = "ptt-multicast-port", default_value_t = DEFAULT_MULTICAST_PORT)]
    ptt_multicast_port: u16,

    /// HID key code arming the transmitter, or "any".
    #[arg(long = "ptt-key", default_value = "any")]
    ptt_key: PttKey,

    /// Play our own transmissions back locally.
    #[arg(long = "ptt-loopback", default_value_t = false)]
    ptt_loopback: bool,

    /// Name of the HID button device.
    #[arg(long = "ptt-device", default_value = "AIOC AIOC")]
    ptt_device: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    pretty_env_logger::formatted_timed_builder()
        .filter_module(
            "openmanet",
            if cli.silent {
                LevelFilter::Error
            } else if cli.debug {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            },
        )
        .init();

    if cli.list_input_devices {
        for (path, name) in openmanet::ptt::list_input_devices() {
            println!("{}\t{name}", path.display());
        }
        return Ok(());
    }

    let ptt = cli.node_args.ptt.then(|| PttConfig {
        iface: cli.node_args.interface.clone(),
        group: cli.node_args.ptt_multicast_group,
        port: cli.node_args.ptt_multicast_port,
        key: cli.node_args.ptt_key,
        loopback: cli.node_args.ptt_loopback,
        device: cli.node_args.ptt_device.clone(),
    });

    let config = Config {
        iface: cli.node_args.interface,
        alfred_socket: cli.node_args.alfred_socket,
        bat_hosts_path: cli.node_args.bat_hosts,
        uci_tree_path: cli.node_args.uci_tree,
        gateway_records: !cli.node_args.no_gateway_records,
        node_records: !cli.node_args.no_node_records,
        reservation_records: !cli.node_args.no_address_reservation,
        intervals: Intervals {
            gateway_send: Duration::from_secs(cli.node_args.gateway_send_interval),
            gateway_recv: Duration::from_secs(cli.node_args.gateway_recv_interval),
            node_send: Duration::from_secs(cli.node_args.node_send_interval),
            node_recv: Duration::from_secs(cli.node_args.node_recv_interval),
            reservation_send: Duration::from_secs(cli.node_args.reservation_send_interval),
            reservation_recv: Duration::from_secs(cli.node_args.reservation_recv_interval),
        },
        ptt,
    };

    let node = match Node::new(config).await {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to start node: {e}");
            return Err(e.into());
        }
    };

    let mut sigint =
        signal::unix::signal(SignalKind::interrupt()).expect("Can install SIGINT handler");
    let mut sigterm =
        signal::unix::signal(SignalKind::terminate()).expect("Can install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => { }
        _ = sigterm.recv() => { }
    }

    info!("Shutting down");
    node.stop().await;

    Ok(())
}
