use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::TcpStream;

use crate::commands::progress::Spinners;
use crate::commands::CommandOptions;
use crate::config::SessionConfig;
use crate::consent::format_file_size;
use crate::error::ShareError;
use crate::networking::{bind_listener, copy_to_clipboard, share_address};
use crate::session::{host_session, Collaborators, SessionReport};
use crate::{APP_NAME, APP_VERSION};

/// Serve `file_path` until interrupted.
///
/// The file is checked once up front; each connection then re-reads and
/// re-encrypts it for the verified recipient.
pub async fn run(file_path: &str, port: u16, opts: CommandOptions) -> Result<(), Box<dyn Error>> {
    let path = Path::new(file_path);
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("Cannot read {}: {}", file_path, e))?;
    if !meta.is_file() {
        return Err(format!("Not a regular file: {}", file_path).into());
    }

    let listener = bind_listener(port).await?;
    let addr = share_address(&listener).await?;
    info!(
        "{} {} hosting {} ({}) on {}",
        APP_NAME,
        APP_VERSION,
        file_path,
        format_file_size(meta.len()),
        addr
    );

    if copy_to_clipboard(&addr.to_string()) {
        println!("Share address (copied to clipboard): \x1b[4m\x1b[1m{}\x1b[0m", addr);
    } else {
        println!("Share address: \x1b[4m\x1b[1m{}\x1b[0m", addr);
    }
    println!("Press Ctrl+C to stop");

    let spinners = Spinners::new();
    spinners.wait_for(format!("Waiting for connections on port {}", addr.port()));
    let deps = Arc::new(spinners.decorate(opts.collaborators(), None));
    let config = Arc::new(SessionConfig::default().with_read_timeout(opts.read_timeout));
    let file = Arc::new(path.to_path_buf());

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("New connection from: {}", peer);

        debug!("Spawning session for {}", peer);
        tokio::spawn(serve_peer(
            stream,
            peer,
            Arc::clone(&file),
            Arc::clone(&deps),
            Arc::clone(&config),
            spinners.clone(),
        ));
    }
}

async fn serve_peer(
    stream: TcpStream,
    peer: SocketAddr,
    file: Arc<PathBuf>,
    deps: Arc<Collaborators>,
    config: Arc<SessionConfig>,
    spinners: Spinners,
) {
    let report = host_session(stream, &file, &deps, &config).await;
    if let Some(line) = summary(peer, &report) {
        spinners.println(line);
    }
    debug!("Session steps for {}: {:?}", peer, report.steps);
}

fn summary(peer: SocketAddr, report: &SessionReport) -> Option<String> {
    let who = report.peer_fingerprint.as_deref().unwrap_or("unverified peer");
    match &report.error {
        None => report.metadata.as_ref().map(|meta| {
            format!(
                "Sent {} ({}) to {} [{}]",
                meta.file_name,
                format_file_size(meta.plain_size),
                who,
                peer
            )
        }),
        Some(ShareError::ConsentDeclined) => Some(format!("Rejected connection from {}", peer)),
        Some(ShareError::TransferDeclined) => Some(format!("{} declined the file", who)),
        Some(e) if e.is_stream_failure() => {
            warn!("Connection with {} lost: {}", peer, e);
            None
        }
        Some(e) => {
            warn!("Session with {} failed: {}", peer, e);
            None
        }
    }
}
