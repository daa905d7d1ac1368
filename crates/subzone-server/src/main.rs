// main.rs — zone server startup and socket loop

use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use subzone_common::conf::ConfDocument;
use subzone_server::chat;
use subzone_server::net::{PacketSink, UdpSink};
use subzone_server::sv_main::{ServerContext, ServerOpts};

/// Socket read timeout; also the main loop frame pace.
const FRAME_TIMEOUT: Duration = Duration::from_millis(10);

fn load_conf_or_default(dir: &std::path::Path, name: &str) -> ConfDocument {
    let path = dir.join(name);
    match ConfDocument::load(&path) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(file = name, error = %e, "conf missing, using defaults");
            ConfDocument::new()
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let data_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    tracing::info!(dir = %data_dir.display(), "starting zone server");

    let global_cfg = load_conf_or_default(&data_dir, "global.conf");
    let passwd_cfg = load_conf_or_default(&data_dir, "passwd.conf");
    let staff_cfg = load_conf_or_default(&data_dir, "staff.conf");
    let groupdef_cfg = load_conf_or_default(&data_dir, "groupdef.conf");

    let game_port = global_cfg.get_int("Net", "Port", 5000);
    let chat_port = global_cfg.get_int("Chat", "Port", game_port + 2);

    // a dead listen socket is the one failure worth dying for
    let socket = match UdpSocket::bind(("0.0.0.0", game_port as u16)) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(port = game_port, error = %e, "cannot bind game socket");
            std::process::exit(1);
        }
    };
    if let Err(e) = socket.set_read_timeout(Some(FRAME_TIMEOUT)) {
        tracing::error!(error = %e, "cannot set socket timeout");
        std::process::exit(1);
    }
    let send_socket = match socket.try_clone() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "cannot clone game socket");
            std::process::exit(1);
        }
    };
    let sink = Arc::new(UdpSink::new(send_socket));

    let mut ctx = ServerContext::new(ServerOpts {
        global_cfg,
        passwd_cfg,
        staff_cfg,
        groupdef_cfg,
        data_dir,
        net: sink as Arc<dyn PacketSink>,
    });

    match std::net::TcpListener::bind(("0.0.0.0", chat_port as u16)) {
        Ok(listener) => {
            let spawned = chat::spawn_chat_reactor(
                listener,
                ctx.chat.shared.clone(),
                ctx.work_tx.clone(),
                ctx.chat.message_delay_ms,
            );
            match spawned {
                Ok(_) => tracing::info!(port = chat_port, "chat listener up"),
                Err(e) => tracing::warn!(error = %e, "chat reactor failed to start"),
            }
        }
        Err(e) => tracing::warn!(port = chat_port, error = %e, "cannot bind chat listener"),
    }

    tracing::info!(port = game_port, "listening");
    let mut buf = [0u8; 2048];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                ctx.handle_packet(from, &buf[..len]);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::warn!(error = %e, "socket recv failed");
            }
        }
        ctx.run_frame();
    }
}
