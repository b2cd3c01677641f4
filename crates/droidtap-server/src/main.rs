use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use droidtap_core::config::{logs_dir, DroidtapConfig};
use droidtap_core::tunnel::{TunnelContext, TunnelServer};

#[derive(Parser)]
#[command(name = "droidtap-server")]
#[command(about = "WebSocket tunnel relaying operator input to Android devices")]
struct Args {
    /// Address to listen on (defaults to the configured listen_addr)
    #[arg(short, long, env = "DROIDTAP_LISTEN")]
    listen: Option<String>,

    /// Path to the adb executable
    #[arg(long, env = "DROIDTAP_ADB")]
    adb: Option<std::path::PathBuf>,

    /// Bytes of client input buffered per session while the device connects
    #[arg(long)]
    max_pending_bytes: Option<usize>,

    /// Frames of client input buffered per session while the device connects
    #[arg(long)]
    max_pending_frames: Option<usize>,
}

impl Args {
    /// Applies command-line overrides on top of the persisted config.
    fn apply(self, mut config: DroidtapConfig) -> DroidtapConfig {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(adb) = self.adb {
            config.adb_path = adb;
        }
        if let Some(bytes) = self.max_pending_bytes {
            config.max_pending_bytes = bytes;
        }
        if let Some(frames) = self.max_pending_frames {
            config.max_pending_frames = frames;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().apply(DroidtapConfig::load());

    // Setup logging
    let file_appender = tracing_appender::rolling::never(logs_dir(), "droidtap-server.log");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(file_appender)
        .with_ansi(false)
        .init();

    info!(listen = %config.listen_addr, adb = %config.adb_path.display(), "Starting droidtap-server");

    let listen_addr = config.listen_addr.clone();
    let server = TunnelServer::bind(listen_addr.as_str(), TunnelContext::adb(config)).await?;
    info!(addr = %server.local_addr()?, "Listening");

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut serve = tokio::spawn(server.run(shutdown.clone()));

    tokio::select! {
        result = &mut serve => {
            info!(?result, "Tunnel server exited");
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }

    shutdown.cancel();
    let _ = serve.await;
    info!("Server stopped");
    Ok(())
}
