use std::path::PathBuf;

use axon_catalog::ipc;

pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub socket_path: PathBuf,
}

impl DaemonConfig {
    pub fn new(db_path: Option<PathBuf>, socket_path: Option<PathBuf>, system: bool) -> Self {
        let db_path = db_path.unwrap_or_else(|| {
            directories::ProjectDirs::from("dev", "axon", "axond")
                .map(|d| d.data_dir().join("catalog.db"))
                .unwrap_or_else(|| PathBuf::from(".axond/catalog.db"))
        });

        let socket_path = socket_path.unwrap_or_else(|| {
            if system {
                ipc::system_socket_path()
            } else {
                ipc::session_socket_path()
            }
        });

        Self {
            db_path,
            socket_path,
        }
    }
}
