//! One accepted client connection: resolve its pool via the startup
//! message, request a backend resource, dial it, then splice bytes in
//! both directions while tapping message tags for heartbeat control.

use crate::client::GodemandClient;
use crate::heartbeat::HeartbeatState;
use crate::wire::{self, MessageScanner};
use common_lib::config::ConfigHandle;
use common_lib::model::Client;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    api: Arc<GodemandClient>,
    config: ConfigHandle,
    shutdown: shutdown::Shutdown,
) {
    let startup = match wire::read_startup(&mut client).await {
        Ok(startup) => startup,
        Err(err) => {
            tracing::warn!(client = %client_addr, %err, "failed to parse startup message");
            return;
        }
    };

    let user = startup.parameters.get("user").cloned().unwrap_or_default();
    let database = startup.parameters.get("database").cloned().unwrap_or_default();

    let pool_id = match config.load().database_map.get(&database) {
        Some(pool_id) => pool_id.clone(),
        None => {
            tracing::warn!(client = %client_addr, database = %database, "database is not supported by godemand");
            let _ = client.write_all(&wire::fatal_error_response(&format!("database \"{}\" is not supported by godemand", database))).await;
            return;
        }
    };

    let mut meta = HashMap::new();
    meta.insert("user".to_string(), user.clone());
    meta.insert("database".to_string(), database.clone());

    let resource = match api.request_resource(&pool_id, Client { id: client_addr.to_string(), meta }).await {
        Ok(resource) => resource,
        Err(err) => {
            tracing::warn!(client = %client_addr, pool = %pool_id, user = %user, database = %database, %err, "request_resource failed");
            let _ = client.write_all(&wire::fatal_error_response("backend is currently unavailable")).await;
            return;
        }
    };

    let addr = match resource.addr() {
        Some(addr) => addr.to_string(),
        None => {
            tracing::warn!(client = %client_addr, pool = %pool_id, resource = %resource.id, "resource has no serving address yet");
            let _ = client.write_all(&wire::fatal_error_response("backend is not ready yet, retry shortly")).await;
            return;
        }
    };

    let mut backend = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(client = %client_addr, server = %addr, pool = %pool_id, resource = %resource.id, %err, "failed to dial backend");
            let _ = client.write_all(&wire::fatal_error_response("failed to reach backend")).await;
            return;
        }
    };

    if let Err(err) = backend.write_all(&startup.raw).await {
        tracing::warn!(client = %client_addr, server = %addr, %err, "failed to forward startup message to backend");
        return;
    }

    tracing::info!(client = %client_addr, server = %addr, pool = %pool_id, resource = %resource.id, user = %user, database = %database, "session established");

    let heartbeat = HeartbeatState::new(api, pool_id.clone(), resource.id.clone());
    let ticker = tokio::spawn(heartbeat.clone().run_ticker(shutdown));

    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let c2s = tokio::spawn(pump_client_to_server(client_read, backend_write, heartbeat.clone(), pool_id.clone(), user.clone(), database.clone()));
    let s2c = tokio::spawn(pump_server_to_client(backend_read, client_write, heartbeat));

    tokio::select! {
        res = c2s => { s2c.abort(); log_pump_result("client->server", res, &client_addr, &addr, &user, &database); }
        res = s2c => { c2s.abort(); log_pump_result("server->client", res, &client_addr, &addr, &user, &database); }
    }
    ticker.abort();

    tracing::info!(client = %client_addr, server = %addr, pool = %pool_id, resource = %resource.id, "session closed");
}

async fn pump_client_to_server(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    heartbeat: Arc<HeartbeatState>,
    pool_id: String,
    user: String,
    database: String,
) -> std::io::Result<()> {
    let mut scanner = MessageScanner::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        scanner.feed(
            &buf[..n],
            |tag| {
                if tag == b'Q' || tag == b'P' {
                    heartbeat.activate();
                }
            },
            |query| {
                tracing::debug!(pool = %pool_id, user = %user, database = %database, %query, "query");
            },
        );
        writer.write_all(&buf[..n]).await?;
    }
}

async fn pump_server_to_client(mut reader: OwnedReadHalf, mut writer: OwnedWriteHalf, heartbeat: Arc<HeartbeatState>) -> std::io::Result<()> {
    let mut scanner = MessageScanner::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let mut saw_ready = false;
        scanner.feed(
            &buf[..n],
            |tag| {
                if tag == b'Z' {
                    saw_ready = true;
                }
            },
            |_| {},
        );
        writer.write_all(&buf[..n]).await?;
        if saw_ready {
            heartbeat.deactivate();
        }
    }
}

fn log_pump_result(direction: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>, client: &SocketAddr, server: &str, user: &str, database: &str) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(client = %client, server = %server, user = %user, database = %database, %err, direction, "proxy pump failed");
        }
        Err(err) if err.is_cancelled() => {}
        Err(err) => {
            tracing::warn!(client = %client, server = %server, user = %user, database = %database, %err, direction, "proxy pump task panicked");
        }
    }
}
