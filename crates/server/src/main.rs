use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use lanmesh::{Config, Transport};

#[derive(Parser)]
#[command(name = "lanmesh-server")]
#[command(about = "LAN mesh session server")]
struct Args {
    /// Server name broadcast to lobby browsers.
    #[arg(short, long, default_value = "lanmesh")]
    name: String,

    /// First of five consecutive UDP ports (mesh, server node, client
    /// node, beacon, listener).
    #[arg(short, long, default_value_t = 30000)]
    port_base: u16,

    #[arg(short, long, default_value_t = 16, value_parser = clap::value_parser!(u16).range(1..=255))]
    max_nodes: u16,

    #[arg(short, long, default_value_t = 30)]
    tick_rate: u32,

    /// Seconds of silence before a node slot is reclaimed.
    #[arg(long, default_value_t = 10.0)]
    timeout: f32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Config {
        mesh_port: args.port_base,
        server_port: args.port_base + 1,
        client_port: args.port_base + 2,
        beacon_port: args.port_base + 3,
        listener_port: args.port_base + 4,
        max_nodes: args.max_nodes as usize,
        timeout: args.timeout,
        ..Config::default()
    };

    let mut transport = Transport::with_config(config);
    transport.start_server(&args.name)?;
    log::info!(
        "server '{}' up: mesh on port {}, {} slots",
        args.name,
        args.port_base,
        args.max_nodes
    );

    let tick = Duration::from_secs_f32(1.0 / args.tick_rate.max(1) as f32);
    let mut last_tick = Instant::now();
    let mut connected = vec![false; transport.max_nodes()];

    loop {
        let now = Instant::now();
        let dt = (now - last_tick).as_secs_f32();
        last_tick = now;

        transport.update(dt);

        for node_id in 0..connected.len() {
            let is_connected = transport.is_node_connected(node_id);
            if is_connected != connected[node_id] {
                connected[node_id] = is_connected;
                if is_connected {
                    log::info!(
                        "node {} joined from {}",
                        node_id,
                        transport
                            .node_address(node_id)
                            .map_or_else(|| "unknown".to_owned(), |a| a.to_string())
                    );
                } else {
                    log::info!("node {} left", node_id);
                }
            }
        }

        // Echo every payload back to its sender.
        while let Some((node_id, payload)) = transport.receive_packet() {
            log::debug!("echoing {} bytes to node {}", payload.len(), node_id);
            transport.send_packet(node_id, &payload);
        }

        let elapsed = last_tick.elapsed();
        if elapsed < tick {
            thread::sleep(tick - elapsed);
        }
    }
}
