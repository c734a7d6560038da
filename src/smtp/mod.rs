mod connection;
pub mod outbound;
pub mod server;
mod session;

pub use server::SmtpServer;

use std::net::SocketAddrV4;
use std::path::PathBuf;

/// Inbound listener configuration. TLS material is optional: without it the
/// listener still accepts mail but does not advertise STARTTLS.
#[derive(Clone)]
pub struct SmtpConfig {
    pub listen_addr: SocketAddrV4,
    pub server_name: String,
    pub max_message_bytes: usize,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}
