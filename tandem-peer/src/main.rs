//! Tandem peer: a line-oriented collaborative editor over WebSocket links.
//!
//! Start a host, copy the printed share link to another machine and start a
//! second peer with `--join <link>`. Every line typed on stdin is appended to
//! the shared document; lines starting with `:` are commands.

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use tandem_collab::{
    parse_join_link, JoinLink, LocalStore, MemoryStore, RocksStore, SessionConfig, SessionEvent,
    SessionHandle, StoreConfig, WsConfig, WsTransport,
};
use tandem_core::Origin;

#[derive(Parser, Debug)]
#[command(name = "tandem-peer")]
#[command(about = "Peer-to-peer collaborative text editing")]
#[command(version)]
struct Args {
    /// Address the WebSocket listener binds to
    #[arg(short, long, default_value = "127.0.0.1:0")]
    listen: String,

    /// Host name other peers should dial, if not the bound IP
    #[arg(long, value_name = "HOST")]
    advertise: Option<String>,

    /// Share link to join
    #[arg(short, long, value_name = "URL")]
    join: Option<String>,

    /// Base URL share links are built on
    #[arg(long, default_value = "http://localhost:5173/")]
    base_url: String,

    /// Directory for persisted session state (memory only if omitted)
    #[arg(short, long, value_name = "PATH")]
    store: Option<PathBuf>,
}

const HELP: &str = "\
commands:
  :set <text>      replace the whole document
  :undo / :redo    step through your own edits
  :share           print a share link for this room
  :connect <peer>  dial a peer directly
  :join <room>     switch rooms
  :new             leave all peers and start a fresh room
  :status          show room, peers and save state
  :quit            save and exit
anything else is appended as a line";

fn start<S: LocalStore + 'static>(args: &Args, store: S, join: JoinLink) -> SessionHandle {
    let transport = WsTransport::new(WsConfig {
        bind_addr: args.listen.clone(),
        advertise_host: args.advertise.clone(),
    });
    let config = SessionConfig {
        base_url: args.base_url.clone(),
        ..SessionConfig::default()
    };
    SessionHandle::spawn(config, transport, store, join)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let join = args
        .join
        .as_deref()
        .map(parse_join_link)
        .unwrap_or_else(JoinLink::host);

    let mut session = match &args.store {
        Some(path) => match RocksStore::open(StoreConfig::at(path)) {
            Ok(store) => start(&args, store, join),
            Err(e) => {
                warn!("Storage unavailable, continuing in memory: {e}");
                start(&args, MemoryStore::unavailable(), join)
            }
        },
        None => start(&args, MemoryStore::new(), join),
    };
    let mut events = session
        .take_event_rx()
        .ok_or("session event stream already taken")?;

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_line(&session, &line).await? {
                    break;
                }
            }
            Some(event) = events.recv() => print_event(&session, event),
        }
    }

    session.shutdown().await?;
    info!("Session closed");
    Ok(())
}

/// Execute one input line. Returns `false` when the user asked to quit.
async fn run_line(session: &SessionHandle, line: &str) -> Result<bool, Box<dyn Error>> {
    let (command, rest) = match line.strip_prefix(':') {
        Some(command) => command.split_once(' ').unwrap_or((command, "")),
        None => {
            let mut content = session.content();
            content.push_str(line);
            content.push('\n');
            session.set_content(content).await?;
            return Ok(true);
        }
    };

    match command {
        "set" => session.set_content(rest.replace("\\n", "\n")).await?,
        "undo" => {
            if !session.undo().await? {
                println!("nothing to undo");
            }
        }
        "redo" => {
            if !session.redo().await? {
                println!("nothing to redo");
            }
        }
        "share" => {
            let info = session.share_session().await?;
            match info.share_url {
                Some(url) => println!("share: {url}"),
                None => println!("not registered yet, room {}", info.room_id),
            }
        }
        "connect" if !rest.is_empty() => match session.connect_to_peer(rest.trim()).await {
            Ok(true) => println!("dialing {}", rest.trim()),
            Ok(false) => println!("already linked to {}", rest.trim()),
            Err(e) => println!("cannot dial: {e}"),
        },
        "join" if !rest.is_empty() => {
            session.join_session(rest.trim()).await?;
            println!("room {}", session.room_id());
        }
        "new" => {
            let info = session.new_session().await?;
            println!("new room {}", info.room_id);
            if let Some(url) = info.share_url {
                println!("share: {url}");
            }
        }
        "status" => {
            let status = session.status();
            let peer = status
                .local_peer_id
                .map(|p| p.to_string())
                .unwrap_or_default();
            println!("peer:  {peer}");
            println!("room:  {}", status.room_id);
            println!("peers: {:?}", status.peers);
            println!("save:  {:?}", status.save_status);
            println!("---\n{}---", status.content);
        }
        "quit" | "q" => return Ok(false),
        _ => println!("{HELP}"),
    }
    Ok(true)
}

fn print_event(session: &SessionHandle, event: SessionEvent) {
    match event {
        SessionEvent::Registered(id) => {
            println!("listening as {id}");
            // Status is published after the event, so the link may lag.
            match session.share_url() {
                Some(url) => println!("share: {url}"),
                None => println!("type :share for a link"),
            }
        }
        SessionEvent::PeerConnected(peer) => println!("+ {peer}"),
        SessionEvent::PeerDisconnected(peer) => println!("- {peer}"),
        SessionEvent::ContentChanged(change) if change.origin == Origin::Remote => {
            println!("---\n{}---", change.text);
        }
        SessionEvent::ContentChanged(_) => {}
    }
}
