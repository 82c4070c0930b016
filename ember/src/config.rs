use std::path::PathBuf;

/// Construction arguments for [`crate::server::WebServer`].
///
/// `trig_mode` selects edge triggering: 0 = level everywhere, 1 = ET on
/// connections, 2 = ET on the listener, 3 = ET on both. A `timeout_ms` of 0
/// disables idle-connection expiry.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub trig_mode: u8,
    pub timeout_ms: u64,
    pub sql_host: String,
    pub sql_port: u16,
    pub sql_user: String,
    pub sql_password: String,
    pub db_name: String,
    pub conn_pool_size: usize,
    pub thread_pool_size: usize,
    pub open_log: bool,
    pub log_level: usize,
    pub log_queue_size: usize,
    /// Static asset root; `None` means `<cwd>/resources`.
    pub src_dir: Option<PathBuf>,
    /// Upper bound accepted for a client `Content-Length`.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1316,
            trig_mode: 3,
            timeout_ms: 60_000,
            sql_host: "127.0.0.1".to_string(),
            sql_port: 5432,
            sql_user: "root".to_string(),
            sql_password: "root".to_string(),
            db_name: "webserver".to_string(),
            conn_pool_size: 12,
            thread_pool_size: 6,
            open_log: true,
            log_level: 1,
            log_queue_size: 1024,
            src_dir: None,
            max_body_bytes: 1 << 20,
        }
    }
}
