use email_address::EmailAddress;
use smtp_proto::{
    EXT_8BIT_MIME, EXT_ENHANCED_STATUS_CODES, EXT_SMTP_UTF8, EXT_START_TLS, EhloResponse, Request,
};
use std::net::SocketAddr;
use tokio::sync::mpsc::Sender;
use tracing::{debug, trace};

use crate::models::{DomainId, DomainRepository, TeamId};

/// A raw message accepted by the listener, before MIME parsing. The team
/// binding comes from the first verified recipient domain.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub team_id: TeamId,
    pub domain_id: DomainId,
    pub from: String,
    pub recipients: Vec<String>,
    pub raw_data: Vec<u8>,
}

pub struct SmtpSession {
    ingest: Sender<ReceivedMessage>,
    domains: DomainRepository,

    peer_addr: SocketAddr,
    peer_name: Option<String>,
    tls_available: bool,
    tls_active: bool,
    max_message_bytes: usize,
    session_team: Option<(TeamId, DomainId)>,
    current_message: Option<PendingMessage>,
}

#[derive(Debug, Default)]
struct PendingMessage {
    from: String,
    recipients: Vec<String>,
    raw_data: Vec<u8>,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    /// Acknowledge and hand the stream to the TLS acceptor.
    UpgradeTls(u16, String),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

impl SmtpSession {
    const RESPONSE_OK: &str = "2.0.0 Ok";
    const RESPONSE_FROM_OK: &str = "2.1.0 Originator <[email]> ok";
    const RESPONSE_TO_OK: &str = "2.1.5 Recipient <[email]> ok";
    const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_BYE: &str = "2.0.0 Goodbye";
    const RESPONSE_MESSAGE_ACCEPTED: &str = "2.6.0 Message queued for processing";
    const RESPONSE_MESSAGE_REJECTED: &str = "5.6.0 Message rejected";
    const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &str = "5.5.1 Be nice and say EHLO first";
    const RESPONSE_NOVALID_RECIPIENTS: &str = "5.5.1 No valid recipients";
    const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
    const RESPONSE_INVALID_EMAIL: &str = "5.1.3 This email address is not valid";
    const RESPONSE_UNKNOWN_DOMAIN: &str = "5.1.2 Domain not registered or not verified here";
    const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_STARTTLS_READY: &str = "2.0.0 Ready to start TLS";
    const RESPONSE_STARTTLS_UNAVAILABLE: &str = "5.5.1 TLS not available";
    const RESPONSE_ALREADY_TLS: &str = "5.7.4 Already in TLS mode";
    const RESPONSE_COMMAND_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &str = "5.5.1 Must use EHLO";
    const RESPONSE_NO_VRFY: &str = "5.5.1 VRFY command is disabled";
    const RESPONSE_SERVER_ERROR: &str = "4.3.0 Temporary processing problem";

    pub fn new(
        peer_addr: SocketAddr,
        ingest: Sender<ReceivedMessage>,
        domains: DomainRepository,
        tls_available: bool,
        tls_active: bool,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            ingest,
            domains,
            peer_addr,
            peer_name: None,
            tls_available,
            tls_active,
            max_message_bytes,
            session_team: None,
            current_message: None,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    pub async fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
    ) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");
                return SessionReply::ReplyAndContinue(554, e.to_string());
            }
        };

        trace!("received request: {request:?} from {}", self.peer_addr);

        match request {
            Request::Ehlo { host } => {
                let mut response = EhloResponse::new(&host);
                response.capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8;
                if self.tls_available && !self.tls_active {
                    response.capabilities |= EXT_START_TLS;
                }

                let mut buf = Vec::with_capacity(64);
                response.write(&mut buf).ok();

                self.peer_name = Some(host);

                SessionReply::RawReply(buf)
            }
            Request::Helo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_MUST_USE_ESMTP.into())
            }
            Request::Lhlo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            // no auth is required for inbound mail
            Request::Auth { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Quit => SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into()),
            Request::StartTls => {
                if self.tls_active {
                    SessionReply::ReplyAndContinue(504, Self::RESPONSE_ALREADY_TLS.into())
                } else if self.tls_available {
                    SessionReply::UpgradeTls(220, Self::RESPONSE_STARTTLS_READY.into())
                } else {
                    SessionReply::ReplyAndContinue(454, Self::RESPONSE_STARTTLS_UNAVAILABLE.into())
                }
            }
            _ignored_command if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::Mail { from } => {
                debug!("received MAIL FROM: {}", from.address);

                let Ok(from_address) = from.address.parse::<EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_SENDER.into());
                };

                if self.current_message.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
                }

                self.current_message = Some(PendingMessage {
                    from: from_address.to_string(),
                    ..Default::default()
                });

                let response_message = Self::RESPONSE_FROM_OK.replace("[email]", &from.address);
                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Rcpt { to } => {
                debug!("received RCPT TO: {}", to.address);

                let Ok(to_address) = to.address.parse::<EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_EMAIL.into());
                };

                if self.current_message.is_none() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
                }

                let (code, message) = self.accept_recipient(&to_address).await;
                SessionReply::ReplyAndContinue(code, message)
            }
            Request::Data => {
                let Some(PendingMessage { recipients, .. }) = self.current_message.as_ref() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
                };

                if recipients.is_empty() {
                    return SessionReply::ReplyAndContinue(
                        554,
                        Self::RESPONSE_NOVALID_RECIPIENTS.into(),
                    );
                }

                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Rset => {
                self.current_message = None;
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Noop { value: _ } => {
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Vrfy { value: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NO_VRFY.into())
            }
            Request::Bdat { .. }
            | Request::Expn { .. }
            | Request::Help { .. }
            | Request::Etrn { .. }
            | Request::Atrn { .. }
            | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
        }
    }

    /// Mail is only accepted for verified domains. The first verified
    /// recipient domain binds the session team; recipients belonging to a
    /// different team are rejected rather than silently re-attributed.
    async fn accept_recipient(&mut self, to_address: &EmailAddress) -> (u16, String) {
        let domain = match self.domains.find_verified_by_name_any_team(to_address.domain()).await
        {
            Ok(domain) => domain,
            Err(e) => {
                debug!("recipient domain lookup failed: {e}");
                return (451, Self::RESPONSE_SERVER_ERROR.into());
            }
        };

        let Some(domain) = domain else {
            return (550, Self::RESPONSE_UNKNOWN_DOMAIN.into());
        };

        match self.session_team {
            None => self.session_team = Some((domain.team_id, domain.id)),
            Some((team_id, _)) if team_id != domain.team_id => {
                return (550, Self::RESPONSE_UNKNOWN_DOMAIN.into());
            }
            Some(_) => {}
        }

        let Some(message) = self.current_message.as_mut() else {
            return (503, Self::RESPONSE_MAIL_FIRST.into());
        };
        message.recipients.push(to_address.to_string());

        let response_message = Self::RESPONSE_TO_OK.replace("[email]", to_address.email().as_str());
        (250, response_message)
    }

    pub async fn handle_data(&mut self, data: &[u8]) -> DataReply {
        let Some(PendingMessage {
            raw_data: buffer, ..
        }) = self.current_message.as_mut()
        else {
            return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        buffer.extend_from_slice(data);

        if buffer.len() > self.max_message_bytes {
            debug!("failed to read message: message too big");
            self.current_message = None;
            return DataReply::ReplyAndContinue(554, Self::RESPONSE_MESSAGE_REJECTED.into());
        }

        const DATA_END: &[u8] = b"\r\n.\r\n";

        if buffer.ends_with(DATA_END) || buffer == &DATA_END[2..] {
            buffer.truncate(buffer.len() - DATA_END.len());

            let Some(message) = self.current_message.take() else {
                return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
            };

            let Some((team_id, domain_id)) = self.session_team else {
                return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
            };

            trace!("received message ({} bytes)", message.raw_data.len());

            let received = ReceivedMessage {
                team_id,
                domain_id,
                from: message.from,
                recipients: message.recipients,
                raw_data: message.raw_data,
            };

            if let Err(e) = self.ingest.send(received).await {
                debug!("failed to queue message: {e}");
                return DataReply::ReplyAndContinue(554, Self::RESPONSE_MESSAGE_REJECTED.into());
            }

            return DataReply::ReplyAndContinue(250, Self::RESPONSE_MESSAGE_ACCEPTED.into());
        }

        DataReply::ContinueIngest
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc;

    fn test_session(tls_available: bool) -> SmtpSession {
        // lazy pool: none of these paths reach the database
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/unreachable").unwrap();
        let (tx, _rx) = mpsc::channel(1);
        SmtpSession::new(
            "127.0.0.1:2525".parse().unwrap(),
            tx,
            DomainRepository::new(pool),
            tls_available,
            false,
            1024,
        )
    }

    async fn send(session: &mut SmtpSession, line: &str) -> SessionReply {
        let bytes = format!("{line}\r\n");
        session
            .handle(Request::parse(&mut bytes.as_bytes().iter()).map(|r| r.into_owned()))
            .await
    }

    use smtp_proto::Request;

    #[tokio::test]
    async fn commands_require_ehlo_first() {
        let mut session = test_session(false);
        let reply = send(&mut session, "MAIL FROM:<a@x.test>").await;
        assert!(matches!(reply, SessionReply::ReplyAndContinue(503, _)));
    }

    #[tokio::test]
    async fn ehlo_advertises_starttls_only_when_available() {
        let mut session = test_session(true);
        let SessionReply::RawReply(buf) = send(&mut session, "EHLO client.test").await else {
            panic!("expected raw EHLO response");
        };
        assert!(String::from_utf8_lossy(&buf).contains("STARTTLS"));

        let mut session = test_session(false);
        let SessionReply::RawReply(buf) = send(&mut session, "EHLO client.test").await else {
            panic!("expected raw EHLO response");
        };
        assert!(!String::from_utf8_lossy(&buf).contains("STARTTLS"));
    }

    #[tokio::test]
    async fn starttls_handling_depends_on_configuration() {
        let mut session = test_session(true);
        assert!(matches!(
            send(&mut session, "STARTTLS").await,
            SessionReply::UpgradeTls(220, _)
        ));

        let mut session = test_session(false);
        assert!(matches!(
            send(&mut session, "STARTTLS").await,
            SessionReply::ReplyAndContinue(454, _)
        ));
    }

    #[tokio::test]
    async fn rcpt_requires_mail_first() {
        let mut session = test_session(false);
        send(&mut session, "EHLO client.test").await;
        let reply = send(&mut session, "RCPT TO:<u@x.test>").await;
        assert!(matches!(reply, SessionReply::ReplyAndContinue(503, _)));
    }

    #[tokio::test]
    async fn nested_mail_is_rejected() {
        let mut session = test_session(false);
        send(&mut session, "EHLO client.test").await;
        assert!(matches!(
            send(&mut session, "MAIL FROM:<a@x.test>").await,
            SessionReply::ReplyAndContinue(250, _)
        ));
        assert!(matches!(
            send(&mut session, "MAIL FROM:<b@x.test>").await,
            SessionReply::ReplyAndContinue(503, _)
        ));
    }

    #[tokio::test]
    async fn data_without_recipients_is_rejected() {
        let mut session = test_session(false);
        send(&mut session, "EHLO client.test").await;
        send(&mut session, "MAIL FROM:<a@x.test>").await;
        let reply = send(&mut session, "DATA").await;
        assert!(matches!(reply, SessionReply::ReplyAndContinue(554, _)));
    }

    #[tokio::test]
    async fn rset_clears_the_pending_message() {
        let mut session = test_session(false);
        send(&mut session, "EHLO client.test").await;
        send(&mut session, "MAIL FROM:<a@x.test>").await;
        assert!(matches!(
            send(&mut session, "RSET").await,
            SessionReply::ReplyAndContinue(250, _)
        ));
        // a fresh MAIL is accepted again after the reset
        assert!(matches!(
            send(&mut session, "MAIL FROM:<b@x.test>").await,
            SessionReply::ReplyAndContinue(250, _)
        ));
    }

    #[tokio::test]
    async fn oversized_message_data_is_rejected() {
        let mut session = test_session(false);
        send(&mut session, "EHLO client.test").await;
        send(&mut session, "MAIL FROM:<a@x.test>").await;

        let reply = session.handle_data(&[b'x'; 2048]).await;
        assert!(matches!(reply, DataReply::ReplyAndContinue(554, _)));
    }

    #[tokio::test]
    async fn invalid_sender_is_rejected() {
        let mut session = test_session(false);
        send(&mut session, "EHLO client.test").await;
        let reply = send(&mut session, "MAIL FROM:<not-an-address>").await;
        assert!(matches!(reply, SessionReply::ReplyAndContinue(553, _)));
    }
}
