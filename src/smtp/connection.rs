use smtp_proto::Request;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::smtp::session::{DataReply, SessionReply, SmtpSession};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept TLS: {0}")]
    Accept(std::io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("connection dropped unexpectedly")]
    Dropped,
}

const BUFFER_SIZE: usize = 1024;
const CODE_READY: u16 = 220;

/// How a session loop ended: the client said QUIT (or dropped politely), or
/// it asked to upgrade to TLS and the caller should wrap the stream.
pub enum SessionEnd {
    Quit,
    UpgradeTls,
}

pub async fn run(
    stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin),
    server_name: &str,
    session: &mut SmtpSession,
    greet: bool,
) -> Result<SessionEnd, ConnectionError> {
    let (source, mut sink) = tokio::io::split(stream);

    // reused to avoid re-allocating the read buffer
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let mut reader = BufReader::new(source);

    trace!("handling connection with {}", session.peer());

    if greet {
        write_reply(CODE_READY, server_name, &mut sink).await?;
    }

    'session: loop {
        read_line(&mut reader, &mut buffer).await?;

        let request = Request::parse(&mut buffer.iter()).map(|r| r.into_owned());

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut sink).await?;
                continue;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut sink).await?;
                return Ok(SessionEnd::Quit);
            }
            SessionReply::RawReply(buf) => {
                sink.write_all(&buf).await.map_err(ConnectionError::Write)?;
                continue;
            }
            SessionReply::UpgradeTls(code, message) => {
                write_reply(code, &message, &mut sink).await?;
                return Ok(SessionEnd::UpgradeTls);
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut sink).await?;

                'data: loop {
                    read_buf(&mut reader, &mut buffer).await?;

                    match session.handle_data(&buffer).await {
                        DataReply::ContinueIngest => continue 'data,
                        DataReply::ReplyAndContinue(code, message) => {
                            write_reply(code, &message, &mut sink).await?;
                            continue 'session;
                        }
                    }
                }
            }
        }
    }
}

async fn read_buf(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    reader
        .take(BUFFER_SIZE as u64)
        .read_buf(buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    reader
        .take(BUFFER_SIZE as u64)
        .read_until(b'\n', buffer)
        .await
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn write_reply(
    code: u16,
    message: &str,
    mut sink: impl AsyncWriteExt + Unpin,
) -> Result<(), ConnectionError> {
    debug!("sent: {code} {message}");

    sink.write_all(format!("{code} {message}\r\n").as_bytes())
        .await
        .map_err(ConnectionError::Write)
}
