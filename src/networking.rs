use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use arboard::Clipboard;
use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Bind the host listener on every interface. Port 0 picks a free port.
pub async fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    debug!("Attempting to bind to {}", bind_addr);
    TcpListener::bind(bind_addr).await
}

pub async fn connect(addr: &str) -> io::Result<TcpStream> {
    debug!("Connecting to {}", addr);
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// The address other machines on the network should use to reach this one.
///
/// Connecting a UDP socket sends nothing, it only asks the OS which local
/// interface would route to a public address. Falls back to loopback when
/// there is no route.
pub async fn local_ip() -> IpAddr {
    match outbound_ip().await {
        Ok(ip) => ip,
        Err(e) => {
            debug!("Could not determine outbound address: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

async fn outbound_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    Ok(socket.local_addr()?.ip())
}

/// `<local-ip>:<port>` for a bound listener.
pub async fn share_address(listener: &TcpListener) -> io::Result<SocketAddr> {
    let port = listener.local_addr()?.port();
    Ok(SocketAddr::new(local_ip().await, port))
}

/// Best-effort clipboard copy. Returns whether it worked.
pub fn copy_to_clipboard(text: &str) -> bool {
    match Clipboard::new() {
        Ok(mut clipboard) => match clipboard.set_text(text.to_string()) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to copy to clipboard: {}", e);
                false
            }
        },
        Err(e) => {
            debug!("Clipboard unavailable: {}", e);
            false
        }
    }
}
