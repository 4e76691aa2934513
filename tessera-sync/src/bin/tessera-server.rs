use log::{error, info};
use tessera_sync::{ReplicationServer, SyncConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    info!(
        "Starting Tessera replication server for workspace {} (data in {})",
        config.server.workspace_id,
        config.server.store.path.display()
    );

    let server = match ReplicationServer::open(config.server) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open store: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
}
