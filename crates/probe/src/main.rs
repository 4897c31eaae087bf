use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use tether::{
    EntityPose, InterpolationEngine, InterpolatorConfig, Packet, PacketPayload, ServerDescriptor,
    SessionConfig, SessionEvent, SessionManager, kind,
};

#[derive(Parser)]
#[command(name = "tether-probe")]
#[command(about = "Headless session probe for tether servers")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    #[arg(short, long, default_value_t = 4201)]
    port: u16,

    #[arg(long, default_value_t = 0)]
    account_id: u32,

    #[arg(long, default_value = "")]
    token: String,

    #[arg(long, default_value_t = 30, help = "Seconds to stay connected")]
    duration: u64,

    #[arg(long, default_value_t = 20, help = "Expected server updates per second")]
    update_rate: u32,

    #[arg(long, help = "Disable interpolation and snap to raw samples")]
    realtime: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let session = Arc::new(SessionManager::new(SessionConfig::default()));
    let interpolation = Arc::new(Mutex::new(InterpolationEngine::new(InterpolatorConfig {
        realtime: args.realtime,
        expected_delta: 1.0 / args.update_rate.max(1) as f32,
        ..Default::default()
    })));

    let engine = Arc::clone(&interpolation);
    session.add_listener(kind::ENTITY_UPDATE, move |packet| {
        let PacketPayload::EntityUpdate {
            server_time,
            entities,
        } = &packet.payload
        else {
            return;
        };
        let mut engine = engine.lock().unwrap();
        for entry in entities {
            engine.update_entity(
                entry.entity_id,
                EntityPose::from_wire(&entry.state),
                *server_time,
            );
        }
    });

    session.add_listener(kind::CHAT_MESSAGE, |packet| {
        if let PacketPayload::ChatMessage { sender_id, message } = &packet.payload {
            log::info!("[chat] {sender_id}: {message}");
        }
    });

    let descriptor = ServerDescriptor {
        name: format!("{}:{}", args.address, args.port),
        address: args.address.clone(),
        port: args.port,
    };
    session.connect_safe(&descriptor);

    let start = Instant::now();
    let frame = Duration::from_millis(16);
    let mut login_sent = false;
    let mut last_frame = Instant::now();

    while start.elapsed() < Duration::from_secs(args.duration) {
        session.process_incoming();

        let dt = last_frame.elapsed().as_secs_f32();
        last_frame = Instant::now();
        interpolation.lock().unwrap().tick(dt);

        for event in session.drain_events() {
            match event {
                SessionEvent::Connected { addr } => log::info!("transport up to {addr}"),
                SessionEvent::Established => {
                    log::info!("session established");
                    if !login_sent {
                        login_sent = true;
                        let _ = session.send(Packet::new(PacketPayload::Login {
                            account_id: args.account_id,
                            token: args.token.clone(),
                        }));
                    }
                }
                SessionEvent::Authenticated => log::info!("authenticated, ready to rock"),
                SessionEvent::Disconnected { reason } => {
                    log::warn!("session {}", reason.as_str());
                    return Ok(());
                }
                SessionEvent::ConnectionFailed { server, error } => {
                    log::error!("connection to {} failed: {error}", server.name);
                    return Ok(());
                }
                SessionEvent::SessionError { error } => {
                    log::error!("session error: {error}");
                    return Ok(());
                }
                SessionEvent::ServerPong {
                    addr, player_count, ..
                } => {
                    log::info!("{addr} is alive with {player_count} players");
                }
            }
        }

        if !session.connected() && login_sent {
            break;
        }

        thread::sleep(frame);
    }

    let stats = session.stats();
    log::info!(
        "probe done: {} packets out, {} packets in, tracking {} entities",
        stats.packets_sent,
        stats.packets_received,
        interpolation.lock().unwrap().len()
    );

    session.disconnect(false);
    Ok(())
}
