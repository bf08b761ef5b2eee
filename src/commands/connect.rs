use std::error::Error;
use std::path::PathBuf;

use log::debug;

use crate::commands::progress::Spinners;
use crate::commands::CommandOptions;
use crate::config::SessionConfig;
use crate::consent::format_file_size;
use crate::error::ShareError;
use crate::networking::connect;
use crate::session::client_session;

/// Connect to a host, prove our identity and download its file into `output`.
pub async fn run(addr: &str, output: PathBuf, opts: CommandOptions) -> Result<(), Box<dyn Error>> {
    let spinners = Spinners::new();
    spinners.wait_for(format!("Connecting to {}", addr));

    let stream = match connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            spinners.stop_waiting();
            return Err(format!("Could not connect to {}: {}", addr, e).into());
        }
    };
    spinners.println(format!("Connected to {}", addr));
    spinners.wait_for("Waiting for the host to accept");

    let deps = spinners.decorate(opts.collaborators(), Some("Waiting for the encrypted file"));
    let config = SessionConfig::default()
        .with_output_dir(output)
        .with_read_timeout(opts.read_timeout);

    let report = client_session(stream, &deps, &config).await;
    spinners.stop_waiting();
    debug!("Session steps: {:?}", report.steps);

    match report.into_result() {
        Ok(report) => {
            if let (Some(meta), Some(path)) = (&report.metadata, &report.saved_to) {
                println!(
                    "Received {} ({}), saved to {}",
                    meta.file_name,
                    format_file_size(meta.plain_size),
                    path.display()
                );
            }
            Ok(())
        }
        Err(ShareError::HandshakeRejected(reply)) => {
            debug!("Host replied: {}", reply);
            Err("The host rejected the connection".into())
        }
        Err(ShareError::TransferDeclined) => Err("File transfer declined".into()),
        Err(e) => Err(e.into()),
    }
}
