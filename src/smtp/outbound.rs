use crate::{
    dkim::PrivateKey,
    dns::{DnsResolver, ResolveError},
    models::TlsPolicy,
};
use chrono::Utc;
use email_address::EmailAddress;
use mail_builder::{MessageBuilder, headers::address::Address, headers::raw::Raw};
use mail_send::{SmtpClientBuilder, smtp};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not assemble message: {0}")]
    Build(#[from] std::io::Error),
    #[error("could not sign message: {0}")]
    Dkim(#[from] crate::dkim::KeyError),
    #[error("recipient address unparseable: {0}")]
    BadRecipient(String),
}

#[derive(Debug, Error)]
enum SendError {
    #[error("permanent failure ({code}): {message}")]
    Permanent { code: u16, message: String },
    #[error("temporary failure ({code}): {message}")]
    Temporary { code: u16, message: String },
}

#[derive(Clone, Copy)]
enum Protection {
    Tls,
    Plaintext,
}

/// DKIM credentials resolved by the pipeline: the signing domain, its
/// selector, and the decrypted PKCS#8 private key.
pub struct DkimMaterial {
    pub domain: String,
    pub selector: String,
    pub private_der: Vec<u8>,
}

pub struct OutboundMessage {
    pub message_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub dkim: Option<DkimMaterial>,
    pub tls_policy: TlsPolicy,
}

impl OutboundMessage {
    pub fn recipients(&self) -> impl Iterator<Item = &String> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Return-Path envelope sender: `bounce.<signing domain>` when a domain
    /// is attached, so remote DSNs come back through the bounce subdomain.
    pub fn envelope_from(&self) -> String {
        match &self.dkim {
            Some(dkim) => format!("bounce@bounce.{}", dkim.domain),
            None => self.from.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecipientResult {
    pub recipient: String,
    pub success: bool,
    pub code: u16,
    pub message: String,
    pub permanent: bool,
}

impl RecipientResult {
    fn ok(recipient: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            success: true,
            code: 250,
            message: "accepted".to_string(),
            permanent: false,
        }
    }

    fn failure(recipient: &str, code: u16, message: String, permanent: bool) -> Self {
        Self {
            recipient: recipient.to_string(),
            success: false,
            code,
            message,
            permanent,
        }
    }
}

#[derive(Clone)]
pub struct EngineConfig {
    pub ehlo_domain: String,
    pub timeout: std::time::Duration,
}

#[derive(Clone)]
pub struct SmtpEngine {
    resolver: DnsResolver,
    config: Arc<EngineConfig>,
}

impl SmtpEngine {
    pub fn new(resolver: DnsResolver, config: Arc<EngineConfig>) -> Self {
        Self { resolver, config }
    }

    /// Assembles the RFC 5322 message and prepends the DKIM-Signature
    /// header when signing material is available.
    pub fn build_message(message: &OutboundMessage) -> Result<Vec<u8>, EngineError> {
        let mut builder = MessageBuilder::new()
            .from(Address::new_address(None::<&str>, message.from.as_str()))
            .to(Address::new_list(
                message
                    .to
                    .iter()
                    .map(|a| Address::new_address(None::<&str>, a.as_str()))
                    .collect(),
            ))
            .subject(message.subject.as_str())
            .header("Message-ID", Raw::new(format!("<{}>", message.message_id)))
            .header("Date", Raw::new(Utc::now().to_rfc2822()));

        if !message.cc.is_empty() {
            builder = builder.cc(Address::new_list(
                message
                    .cc
                    .iter()
                    .map(|a| Address::new_address(None::<&str>, a.as_str()))
                    .collect(),
            ));
        }
        if let Some(reply_to) = &message.reply_to {
            builder = builder.reply_to(Address::new_address(None::<&str>, reply_to.as_str()));
        }
        for (name, value) in &message.headers {
            builder = builder.header(name.clone(), Raw::new(value.clone()));
        }
        if let Some(html) = &message.html {
            builder = builder.html_body(html.as_str());
        }
        if let Some(text) = &message.text {
            builder = builder.text_body(text.as_str());
        }

        let raw = builder.write_to_vec()?;

        let Some(dkim) = &message.dkim else {
            return Ok(raw);
        };

        let key = PrivateKey::from_der(&dkim.domain, &dkim.selector, &dkim.private_der)?;
        let header = key.dkim_header(&raw)?;

        let mut signed = Vec::with_capacity(header.len() + raw.len());
        signed.extend_from_slice(header.as_bytes());
        signed.extend_from_slice(&raw);
        Ok(signed)
    }

    /// Delivers to every recipient not in `skip`, one SMTP transaction per
    /// recipient, and returns a result per attempted recipient. On the
    /// final attempt temporary failures are reported permanent so the
    /// caller can settle the email.
    pub async fn send(
        &self,
        message: &OutboundMessage,
        skip: &[String],
        final_attempt: bool,
    ) -> Result<Vec<RecipientResult>, EngineError> {
        let raw = Self::build_message(message)?;
        let envelope_from = message.envelope_from();

        let mut results = Vec::new();
        for recipient in message.recipients() {
            if skip.contains(recipient) {
                trace!(recipient, "skipping recipient delivered on earlier attempt");
                continue;
            }

            let address = recipient
                .parse::<EmailAddress>()
                .map_err(|_| EngineError::BadRecipient(recipient.clone()))?;

            let result = match self
                .send_single(&address, &envelope_from, &raw, message.tls_policy)
                .await
            {
                Ok(()) => RecipientResult::ok(recipient),
                Err(SendError::Permanent { code, message }) => {
                    RecipientResult::failure(recipient, code, message, true)
                }
                Err(SendError::Temporary { code, message }) => {
                    RecipientResult::failure(recipient, code, message, final_attempt)
                }
            };
            results.push(result);
        }

        Ok(results)
    }

    async fn send_single(
        &self,
        recipient: &EmailAddress,
        envelope_from: &str,
        raw: &[u8],
        tls_policy: TlsPolicy,
    ) -> Result<(), SendError> {
        let domain = recipient.domain();
        let mut priority = 0..65536;
        let mut last_temporary: Option<SendError> = None;

        loop {
            match self.resolver.resolve_mail_domain(domain, &mut priority).await {
                Ok((hostname, port)) => {
                    match self
                        .send_upstream(recipient, envelope_from, raw, &hostname, port, tls_policy)
                        .await
                    {
                        Ok(()) => return Ok(()),
                        Err(err @ SendError::Temporary { .. }) => last_temporary = Some(err),
                        Err(err @ SendError::Permanent { .. }) => return Err(err),
                    }
                }
                Err(ResolveError::AllServersExhausted) => {
                    info!(domain, "all mail servers exhausted");
                    break;
                }
                Err(ResolveError::Dns(err)) => {
                    info!(domain, "could not resolve mail domain: {err}");
                    return Err(SendError::Temporary {
                        code: 451,
                        message: format!("could not resolve {domain}: {err}"),
                    });
                }
            }
        }

        Err(last_temporary.unwrap_or(SendError::Temporary {
            code: 451,
            message: format!("no mail server for {domain} accepted the message"),
        }))
    }

    async fn send_upstream(
        &self,
        recipient: &EmailAddress,
        envelope_from: &str,
        raw: &[u8],
        hostname: &str,
        port: u16,
        tls_policy: TlsPolicy,
    ) -> Result<(), SendError> {
        let order: &[Protection] = match tls_policy {
            // required: STARTTLS must succeed and the certificate must verify
            TlsPolicy::Required => &[Protection::Tls],
            TlsPolicy::Opportunistic => &[Protection::Tls, Protection::Plaintext],
        };

        let mut last_err = None;
        for &protection in order {
            let smtp = SmtpClientBuilder::new(hostname, port)
                .implicit_tls(false)
                .say_ehlo(true)
                .helo_host(&self.config.ehlo_domain)
                .timeout(self.config.timeout);

            let smtp_message = smtp::message::Message {
                mail_from: envelope_from.into(),
                rcpt_to: vec![recipient.email().into()],
                body: raw.into(),
            };

            let result = match protection {
                Protection::Tls => match smtp.connect().await {
                    Err(err) => Err(err),
                    Ok(mut client) => {
                        trace!(hostname, port, "securely connected to upstream server");
                        let result = client.send(smtp_message).await;
                        quit_smtp(client, hostname).await;
                        result
                    }
                },
                Protection::Plaintext => match smtp.connect_plain().await {
                    Err(err) => Err(err),
                    Ok(mut client) => {
                        trace!(hostname, port, "connected to upstream server without TLS");
                        let result = client.send(smtp_message).await;
                        quit_smtp(client, hostname).await;
                        result
                    }
                },
            };

            match result {
                Ok(()) => {
                    debug!(hostname, port, "successfully handed off message");
                    return Ok(());
                }
                Err(err) => {
                    info!(hostname, port, "could not use server: {err}");
                    last_err = Some(classify_send_error(err));
                }
            }
        }

        Err(last_err.unwrap_or(SendError::Temporary {
            code: 451,
            message: "no delivery attempt was made".to_string(),
        }))
    }
}

async fn quit_smtp<T>(client: mail_send::SmtpClient<T>, hostname: &str)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    client
        .quit()
        .await
        .inspect_err(|err| {
            debug!("failed to close upstream SMTP connection with {hostname}: {err}");
        })
        .ok();
}

/// Maps a transport-level error onto the permanent/temporary split. SMTP
/// replies with code >= 500 are permanent, 400..499 temporary; everything
/// without a reply is a synthetic temporary failure.
fn classify_send_error(err: mail_send::Error) -> SendError {
    match err {
        mail_send::Error::UnexpectedReply(response)
        | mail_send::Error::AuthenticationFailed(response) => {
            if response.code >= 500 {
                SendError::Permanent {
                    code: response.code,
                    message: response.message,
                }
            } else {
                SendError::Temporary {
                    code: response.code,
                    message: response.message,
                }
            }
        }
        mail_send::Error::MissingCredentials
        | mail_send::Error::MissingMailFrom
        | mail_send::Error::MissingRcptTo
        | mail_send::Error::UnsupportedAuthMechanism
        | mail_send::Error::MissingStartTls => SendError::Permanent {
            code: 550,
            message: err.to_string(),
        },
        other => SendError::Temporary {
            code: 451,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dns::mock::Resolver;
    use std::net::Ipv4Addr;

    fn random_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_message(to: &str) -> OutboundMessage {
        OutboundMessage {
            message_id: "test-message@x.test".to_string(),
            from: "sender@x.test".to_string(),
            to: vec![to.to_string()],
            cc: vec![],
            bcc: vec![],
            reply_to: None,
            subject: "Hi!".to_string(),
            html: Some("<p>hello</p>".to_string()),
            text: None,
            headers: BTreeMap::new(),
            dkim: None,
            tls_policy: TlsPolicy::Opportunistic,
        }
    }

    #[test]
    fn message_carries_required_headers() {
        let raw = SmtpEngine::build_message(&test_message("rcpt@y.test")).unwrap();
        let text = String::from_utf8_lossy(&raw);

        assert!(text.contains("From: "));
        assert!(text.contains("sender@x.test"));
        assert!(text.contains("To: "));
        assert!(text.contains("Subject: Hi!"));
        assert!(text.contains("Message-ID: <test-message@x.test>"));
        assert!(text.contains("Date: "));
        assert!(text.contains("hello"));
    }

    #[test]
    fn signed_message_starts_with_dkim_header() {
        let generated = crate::dkim::generate_rsa_keypair().unwrap();
        let mut message = test_message("rcpt@y.test");
        message.dkim = Some(DkimMaterial {
            domain: "x.test".to_string(),
            selector: "mr1".to_string(),
            private_der: generated.private_der,
        });

        let raw = SmtpEngine::build_message(&message).unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("DKIM-Signature:"));
        assert!(text.contains("d=x.test"));
    }

    #[test]
    fn envelope_from_uses_bounce_subdomain_when_signing() {
        let mut message = test_message("rcpt@y.test");
        assert_eq!(message.envelope_from(), "sender@x.test");

        message.dkim = Some(DkimMaterial {
            domain: "x.test".to_string(),
            selector: "mr1".to_string(),
            private_der: vec![],
        });
        assert_eq!(message.envelope_from(), "bounce@bounce.x.test");
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn delivers_to_local_test_server() {
        let port = random_port();
        let mailcrab::TestMailServerHandle { token, rx: mut mailcrab_rx } =
            mailcrab::development_mail_server(Ipv4Addr::new(127, 0, 0, 1), port).await;
        let _drop_guard = token.drop_guard();

        let mut mock = Resolver::default();
        mock.add_mx("y.test.", 10, "localhost", port);
        let engine = SmtpEngine::new(
            DnsResolver::mock(mock),
            Arc::new(EngineConfig {
                ehlo_domain: "mailroom.test".to_string(),
                timeout: std::time::Duration::from_secs(10),
            }),
        );

        let results = engine
            .send(&test_message("rcpt@y.test"), &[], false)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].success, "{:?}", results[0]);

        let received = mailcrab_rx.recv().await.unwrap();
        assert_eq!(received.envelope_from.as_str(), "sender@x.test");
    }

    #[tokio::test]
    async fn skip_list_suppresses_redelivery() {
        let mut mock = Resolver::default();
        mock.add_mx("y.test.", 10, "localhost", 1);
        let engine = SmtpEngine::new(
            DnsResolver::mock(mock),
            Arc::new(EngineConfig {
                ehlo_domain: "mailroom.test".to_string(),
                timeout: std::time::Duration::from_secs(1),
            }),
        );

        let results = engine
            .send(&test_message("rcpt@y.test"), &["rcpt@y.test".to_string()], false)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_temporary_failure() {
        let mut mock = Resolver::default();
        // nothing listens on this port
        mock.add_mx("y.test.", 10, "localhost", random_port());
        let engine = SmtpEngine::new(
            DnsResolver::mock(mock),
            Arc::new(EngineConfig {
                ehlo_domain: "mailroom.test".to_string(),
                timeout: std::time::Duration::from_secs(1),
            }),
        );

        let results = engine.send(&test_message("rcpt@y.test"), &[], false).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(!results[0].permanent);

        // the same failure on the final attempt settles permanently
        let results = engine.send(&test_message("rcpt@y.test"), &[], true).await.unwrap();
        assert!(results[0].permanent);
    }
}
