//! The loadavg probe: accepts a TCP connection on `:8743`, copies
//! `/proc/loadavg` to the socket and closes. One read per client, no
//! state, no protocol beyond "whatever bytes the kernel gives us".

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

const LISTEN_ADDR: &str = "0.0.0.0:8743";
const LOADAVG_PATH: &str = "/proc/loadavg";

#[tokio::main]
async fn main() {
    utils::init_tracing("loadavg-probe");

    let listener = match TcpListener::bind(LISTEN_ADDR).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, addr = LISTEN_ADDR, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = LISTEN_ADDR, "loadavg probe listening");

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                tokio::spawn(async move {
                    if let Err(err) = serve(socket).await {
                        tracing::warn!(%peer, %err, "failed to export loadavg");
                    }
                });
            }
            Err(err) => tracing::warn!(%err, "accept failed"),
        }
    }
}

async fn serve(mut socket: TcpStream) -> std::io::Result<()> {
    let body = tokio::fs::read(LOADAVG_PATH).await?;
    socket.write_all(&body).await?;
    socket.shutdown().await
}
