//! Minimal demo client/server over the in-process loopback transport,
//! echoing the spirit of the original sample clients
//! (`hello_test`/`hello_test_bidi`/`hello_test_oneway`) without
//! reintroducing benchmark or statistics scope.

use std::sync::Arc;

use clap::Parser;
use portalrpc::logging::ColorizedFormatter;
use portalrpc::{
    Client, CoreConfig, CoreRuntime, Message, NewSessionDecision, Server, SessionEvent,
    SessionOps,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

/// Portal RPC echo demo — drives the session/connection core over the
/// in-process loopback transport.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Listener URI to bind, e.g. `loopback://echo-server`.
    #[arg(long, conflicts_with = "connect")]
    listen: Option<String>,

    /// Server URI to dial, e.g. `loopback://echo-server`.
    #[arg(long, conflicts_with = "listen")]
    connect: Option<String>,

    /// Request header bytes (client mode only).
    #[arg(long, default_value = "hello")]
    header: String,

    /// Request data bytes (client mode only).
    #[arg(long, default_value = "world")]
    data: String,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to a JSON file overriding the default process config (queue
    /// depth, poll timeout, slab tuning); omit to use built-in defaults.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<CoreConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(CoreConfig::default()),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let stdout_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .event_format(ColorizedFormatter)
        .with_filter(level);
    tracing_subscriber::registry().with(stdout_log).init();
}

/// Server-side callback set: echoes every request back verbatim.
struct EchoServerOps {
    runtime: Arc<CoreRuntime>,
}

impl SessionOps for EchoServerOps {
    fn on_session_event(&self, session_id: u32, event: &SessionEvent) {
        info!(session_id, ?event, "server session event");
    }

    fn on_new_session(
        &self,
        session_id: u32,
        uri: &str,
        _user_context: &[u8],
    ) -> NewSessionDecision {
        info!(session_id, uri, "accepting new session");
        NewSessionDecision::Accept {
            portals: Vec::new(),
            user_context: Vec::new(),
        }
    }

    fn on_msg(&self, session_id: u32, msg: &Message) {
        info!(
            session_id,
            serial = msg.serial_num,
            header = %String::from_utf8_lossy(&msg.header),
            "echoing request"
        );
        if let Some(session) = self.runtime.sessions.lookup(session_id) {
            session.reply(msg.serial_num, msg.header.clone(), msg.data.clone());
        }
    }
}

/// Client-side callback set: forwards delivered responses onto a channel
/// the main task is waiting on.
struct EchoClientOps {
    responses: mpsc::UnboundedSender<Message>,
}

impl SessionOps for EchoClientOps {
    fn on_session_event(&self, session_id: u32, event: &SessionEvent) {
        info!(session_id, ?event, "client session event");
    }

    fn on_msg(&self, _session_id: u32, msg: &Message) {
        let _ = self.responses.send(msg.clone());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_deref())?;
    let runtime = CoreRuntime::init(config);

    if let Some(uri) = args.listen {
        run_server(runtime, &uri).await
    } else if let Some(uri) = args.connect {
        run_client(runtime, &uri, args.header.into_bytes(), args.data.into_bytes()).await
    } else {
        anyhow::bail!("specify either --listen <uri> or --connect <uri>");
    }
}

async fn run_server(runtime: Arc<CoreRuntime>, uri: &str) -> anyhow::Result<()> {
    info!(uri, "binding listener");
    let ops = Arc::new(EchoServerOps {
        runtime: runtime.clone(),
    });
    let _handle = Server::bind(runtime.clone(), uri, ops);
    // The demo keeps the process alive and relies on the accept loop
    // (spawned inside `bind`) to service connections; Ctrl-C exits.
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn run_client(
    runtime: Arc<CoreRuntime>,
    uri: &str,
    header: Vec<u8>,
    data: Vec<u8>,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ops = Arc::new(EchoClientOps { responses: tx });
    let (_session, conn) = Client::open(runtime, uri, ops, Vec::new()).await?;

    let request = Message::new_request(header, data);
    let serial = conn.send_request(request).await?;
    info!(serial, "sent request");

    match rx.recv().await {
        Some(rsp) => {
            info!(
                serial = rsp.serial_num,
                header = %String::from_utf8_lossy(&rsp.header),
                data = %String::from_utf8_lossy(&rsp.data),
                "received response"
            );
        }
        None => warn!("connection closed before a response arrived"),
    }
    Ok(())
}
