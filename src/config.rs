use crate::{
    Environment,
    dkim::KeyVault,
    models::DomainSettings,
    pipeline::PipelineConfig,
    smtp::{SmtpConfig, outbound::EngineConfig},
};
use std::{
    env,
    net::{SocketAddr, SocketAddrV4},
    path::PathBuf,
};

/// Everything the platform reads from the environment, resolved once at
/// bootstrap. Missing required variables abort startup; nothing here is
/// consulted again at runtime.
#[derive(Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub http_addr: SocketAddr,
    pub workers: usize,
    pub attachment_dir: PathBuf,
    pub vault: KeyVault,
    pub smtp: SmtpConfig,
    pub engine: EngineConfig,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = Environment::from_env();

        // a local development setup gets away without the full DNS identity
        let hostname = env::var("MAILROOM_HOSTNAME").unwrap_or_else(|_| {
            if matches!(environment, Environment::Development) {
                "localhost".to_string()
            } else {
                panic!("Missing MAILROOM_HOSTNAME environment variable")
            }
        });

        let master_key =
            env::var("MASTER_KEY").expect("Missing MASTER_KEY environment variable");
        let vault = KeyVault::from_base64(&master_key)
            .expect("MASTER_KEY must be 32 base64-encoded bytes");

        let http_addr: SocketAddr = env::var("HTTP_LISTEN_ADDR")
            .unwrap_or("0.0.0.0:8080".to_string())
            .parse()
            .expect("HTTP_LISTEN_ADDR must be a socket address");

        let smtp_addr: SocketAddrV4 = env::var("SMTP_LISTEN_ADDR")
            .unwrap_or("0.0.0.0:2525".to_string())
            .parse()
            .expect("SMTP_LISTEN_ADDR must be an IPv4 socket address");

        let workers = env::var("WORKER_COUNT")
            .unwrap_or("20".to_string())
            .parse()
            .expect("WORKER_COUNT must be a number");

        let domain_settings = DomainSettings {
            dkim_selector: env::var("DKIM_SELECTOR").unwrap_or("mr1".to_string()),
            spf_include: env::var("SPF_INCLUDE").unwrap_or(format!("spf.{hostname}")),
            mx_host: env::var("MX_HOST").unwrap_or(format!("mx.{hostname}")),
            return_path_host: env::var("RETURN_PATH_HOST").unwrap_or(format!("rp.{hostname}")),
        };

        Self {
            environment,
            http_addr,
            workers,
            attachment_dir: env::var("ATTACHMENT_DIR")
                .unwrap_or("./attachments".to_string())
                .into(),
            vault,
            smtp: SmtpConfig {
                listen_addr: smtp_addr,
                server_name: hostname.clone(),
                max_message_bytes: env::var("MAX_INBOUND_MESSAGE_BYTES")
                    .unwrap_or((20 * 1024 * 1024).to_string())
                    .parse()
                    .expect("MAX_INBOUND_MESSAGE_BYTES must be a number"),
                cert_file: env::var("INBOUND_TLS_CERT").ok().map(PathBuf::from),
                key_file: env::var("INBOUND_TLS_KEY").ok().map(PathBuf::from),
            },
            engine: EngineConfig {
                ehlo_domain: hostname.clone(),
                timeout: std::time::Duration::from_secs(60),
            },
            pipeline: PipelineConfig {
                domain_settings,
                public_base_url: env::var("PUBLIC_BASE_URL")
                    .unwrap_or(format!("https://{hostname}")),
                webhook_timeout: std::time::Duration::from_secs(30),
                webhook_retention_days: 30,
                tracking_retention_days: 90,
                max_tracked_urls: 20,
            },
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
