use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;

use lanmesh::{Config, Transport};

#[derive(Parser)]
#[command(name = "lanmesh-client")]
#[command(about = "LAN mesh session client")]
struct Args {
    /// Server to join: a dotted address (optionally with a port) or an
    /// advertised server name. Ignored with --lobby.
    #[arg(default_value = "127.0.0.1")]
    server: String,

    /// Browse advertised servers instead of connecting.
    #[arg(long)]
    lobby: bool,

    /// First of five consecutive UDP ports, matching the server's.
    #[arg(short, long, default_value_t = 30000)]
    port_base: u16,

    /// Seconds between outgoing test payloads.
    #[arg(short, long, default_value_t = 1.0)]
    interval: f32,

    /// Seconds to browse the lobby before exiting.
    #[arg(long, default_value_t = 10.0)]
    browse_time: f32,
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
        ..Config::default()
    };
    let mut transport = Transport::with_config(config);

    if args.lobby {
        return browse_lobby(&mut transport, args.browse_time);
    }

    transport.connect_client(&args.server)?;
    log::info!("connecting to '{}'", args.server);

    let mut last_tick = Instant::now();
    let mut send_accumulator = 0.0;
    let mut counter: u32 = 0;
    let mut was_connected = false;

    loop {
        let now = Instant::now();
        let dt = (now - last_tick).as_secs_f32();
        last_tick = now;

        transport.update(dt);

        if transport.connect_failed() {
            bail!("could not connect to '{}'", args.server);
        }

        if transport.is_connected() {
            if !was_connected {
                was_connected = true;
                log::info!(
                    "joined as node {} of {}",
                    transport.local_node_id().unwrap_or(0),
                    transport.max_nodes()
                );
            }

            send_accumulator += dt;
            if send_accumulator >= args.interval {
                send_accumulator -= args.interval;
                counter += 1;
                let payload = format!("hello {}", counter);
                // Node 0 is always the server itself.
                transport.send_packet(0, payload.as_bytes());
            }

            while let Some((node_id, payload)) = transport.receive_packet() {
                println!(
                    "node {}: {}",
                    node_id,
                    String::from_utf8_lossy(&payload)
                );
            }
        } else if was_connected {
            bail!("connection to '{}' lost", args.server);
        }

        thread::sleep(Duration::from_millis(10));
    }
}

fn browse_lobby(transport: &mut Transport, browse_time: f32) -> Result<()> {
    transport.enter_lobby()?;
    log::info!("browsing for {:.0} seconds", browse_time);

    let mut last_tick = Instant::now();
    let mut elapsed = 0.0;
    let mut shown = 0;

    while elapsed < browse_time {
        let now = Instant::now();
        let dt = (now - last_tick).as_secs_f32();
        last_tick = now;
        elapsed += dt;

        transport.update(dt);

        let count = transport.lobby_entry_count();
        if count != shown {
            shown = count;
            println!("--- {} server(s) ---", count);
            for index in 0..count {
                if let Some(entry) = transport.lobby_entry(index) {
                    println!("  {}  {}", entry.name, entry.address);
                }
            }
        }

        thread::sleep(Duration::from_millis(50));
    }

    transport.leave_lobby();
    Ok(())
}
