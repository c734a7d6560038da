use crate::{
    models::{AttachmentRef, DomainRepository, InboundRepository, NewInboundEmail},
    queue::{InboundPayload, TaskKind, TaskQueue},
    smtp::{
        SmtpConfig,
        connection::{self, ConnectionError, SessionEnd},
        session::{ReceivedMessage, SmtpSession},
    },
    storage::AttachmentStore,
};
use mail_parser::{MessageParser, MimeHeaders};
use sqlx::PgPool;
use std::{fs::File, io, sync::Arc};
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::TcpListener,
    select,
    sync::mpsc,
};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

pub struct SmtpServer {
    domains: DomainRepository,
    inbound: InboundRepository,
    queue: TaskQueue,
    store: AttachmentStore,
    config: Arc<SmtpConfig>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(
        pool: PgPool,
        config: Arc<SmtpConfig>,
        queue: TaskQueue,
        store: AttachmentStore,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            domains: DomainRepository::new(pool.clone()),
            inbound: InboundRepository::new(pool),
            queue,
            store,
            config,
            shutdown,
        }
    }

    fn build_tls_acceptor(&self) -> Result<Option<TlsAcceptor>, SmtpServerError> {
        let (Some(cert_file), Some(key_file)) = (&self.config.cert_file, &self.config.key_file)
        else {
            return Ok(None);
        };

        let mut cert_reader =
            io::BufReader::new(File::open(cert_file).map_err(SmtpServerError::Certificate)?);
        let mut key_reader =
            io::BufReader::new(File::open(key_file).map_err(SmtpServerError::PrivateKey)?);

        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<CertificateDer<'static>>, io::Error>>()
            .map_err(SmtpServerError::Certificate)?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
            .map_err(SmtpServerError::PrivateKey)?
            .ok_or(SmtpServerError::PrivateKeyNotFound)?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(SmtpServerError::Tls)?;

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        let acceptor = self.build_tls_acceptor()?;
        info!(
            "inbound smtp server on {} (starttls: {})",
            self.config.listen_addr,
            acceptor.is_some()
        );

        let (ingest_tx, ingest_rx) = mpsc::channel::<ReceivedMessage>(100);

        let ingester = Ingester {
            inbound: self.inbound.clone(),
            queue: self.queue.clone(),
            store: self.store.clone(),
        };
        tokio::spawn(ingester.run(ingest_rx));

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down inbound smtp server");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((mut stream, peer_addr)) => {
                        trace!(
                            source_ip = peer_addr.ip().to_string(),
                            source_port = peer_addr.port(),
                            "new inbound connection"
                        );

                        let acceptor = acceptor.clone();
                        let server_name = self.config.server_name.clone();
                        let domains = self.domains.clone();
                        let ingest_tx = ingest_tx.clone();
                        let max_message_bytes = self.config.max_message_bytes;

                        tokio::spawn(async move {
                            let task = async {
                                let mut session = SmtpSession::new(
                                    peer_addr,
                                    ingest_tx.clone(),
                                    domains.clone(),
                                    acceptor.is_some(),
                                    false,
                                    max_message_bytes,
                                );

                                match connection::run(&mut stream, &server_name, &mut session, true)
                                    .await?
                                {
                                    SessionEnd::Quit => Ok::<_, ConnectionError>(()),
                                    SessionEnd::UpgradeTls => {
                                        let Some(acceptor) = acceptor else {
                                            // the session only offers STARTTLS when TLS is configured
                                            return Ok(());
                                        };
                                        let mut tls_stream = acceptor
                                            .accept(stream)
                                            .await
                                            .map_err(ConnectionError::Accept)?;

                                        // RFC 3207: state from before the handshake is discarded
                                        let mut session = SmtpSession::new(
                                            peer_addr,
                                            ingest_tx,
                                            domains,
                                            true,
                                            true,
                                            max_message_bytes,
                                        );
                                        connection::run(
                                            &mut tls_stream,
                                            &server_name,
                                            &mut session,
                                            false,
                                        )
                                        .await?;

                                        tls_stream.shutdown().await.map_err(ConnectionError::Write)
                                    }
                                }
                            };

                            if let Err(err) = task.await {
                                if matches!(err, ConnectionError::Dropped) {
                                    trace!("connection dropped: {err}");
                                } else {
                                    warn!("failed to handle inbound connection: {err}");
                                }
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {err}");
                    }
                },
            }
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("inbound smtp server error: {e:?}");
            }
        });
    }
}

/// Consumes accepted raw messages: parses MIME, persists attachments via
/// the store, writes the inbound row and enqueues its process task.
struct Ingester {
    inbound: InboundRepository,
    queue: TaskQueue,
    store: AttachmentStore,
}

impl Ingester {
    async fn run(self, mut rx: mpsc::Receiver<ReceivedMessage>) {
        while let Some(message) = rx.recv().await {
            if let Err(e) = self.ingest(message).await {
                error!("failed to ingest inbound message: {e:#}");
            }
        }
    }

    async fn ingest(&self, message: ReceivedMessage) -> Result<(), anyhow::Error> {
        let parsed = MessageParser::default()
            .parse(&message.raw_data)
            .unwrap_or_default();

        let mut attachments: Vec<AttachmentRef> = Vec::new();
        for part in parsed.attachments() {
            let filename = part.attachment_name().unwrap_or("attachment");
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{subtype}", ct.ctype()),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());

            let stored = self
                .store
                .save(filename, &content_type, part.contents())
                .await?;
            attachments.push(stored);
        }

        let headers: serde_json::Map<String, serde_json::Value> = parsed
            .headers()
            .iter()
            .map(|header| {
                (
                    header.name.as_str().to_string(),
                    serde_json::to_value(&header.value).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();

        let cc_emails: Vec<String> = parsed
            .cc()
            .map(|cc| {
                cc.iter()
                    .filter_map(|addr| addr.address().map(|a| a.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let new = NewInboundEmail {
            team_id: message.team_id,
            domain_id: message.domain_id,
            from_email: message.from,
            to_emails: message.recipients,
            cc_emails,
            subject: parsed.subject().map(str::to_string),
            html: parsed.body_html(0).map(|b| b.into_owned()),
            text: parsed.body_text(0).map(|b| b.into_owned()),
            raw_message: message.raw_data,
            headers: serde_json::Value::Object(headers),
            attachments,
        };

        let inbound = self.inbound.create(&new).await?;

        self.queue
            .enqueue(
                TaskKind::InboundProcess,
                &InboundPayload {
                    team_id: inbound.team_id,
                    inbound_id: inbound.id,
                },
            )
            .await?;

        info!(
            inbound_id = inbound.id.to_string(),
            team_id = inbound.team_id.to_string(),
            "accepted inbound message"
        );

        Ok(())
    }
}
