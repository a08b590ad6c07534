//! The SMTP conversation: greeting, EHLO, optional STARTTLS, AUTH PLAIN,
//! MAIL FROM, RCPT TO, DATA, QUIT.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::time::timeout;
use pelican_structs::task::SendTask;

use crate::net::{self, IO_TIMEOUT};
use crate::{RelayConfig, RelayError, message};

/// A parsed SMTP reply: status code plus one line of text per reply line.
#[derive(Debug)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn text(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }

    fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

struct Session<S> {
    stream: BufStream<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Read one reply, following `250-` continuation lines. Each line read
    /// is bounded by [`IO_TIMEOUT`].
    async fn read_reply(&mut self) -> Result<Reply, RelayError> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = timeout(IO_TIMEOUT, self.stream.read_line(&mut line))
                .await
                .map_err(|_| RelayError::Protocol("read timed out".into()))?
                .map_err(|err| RelayError::Protocol(err.to_string()))?;
            if read == 0 {
                return Err(RelayError::Protocol("connection closed by relay".into()));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 3 {
                return Err(RelayError::Protocol(format!("malformed reply line {line:?}")));
            }
            let code: u16 = line[..3]
                .parse()
                .map_err(|_| RelayError::Protocol(format!("malformed reply code in {line:?}")))?;
            let continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line.get(4..).unwrap_or("").trim().to_string());
            if !continuation {
                return Ok(Reply { code, lines });
            }
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<(), RelayError> {
        let write = async {
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await
        };
        timeout(IO_TIMEOUT, write)
            .await
            .map_err(|_| RelayError::Protocol("write timed out".into()))?
            .map_err(|err| RelayError::Protocol(err.to_string()))
    }

    /// Send a command and require the expected reply code.
    async fn exchange(&mut self, line: &str, expected: u16) -> Result<Reply, RelayError> {
        self.send_line(line).await?;
        let reply = self.read_reply().await?;
        if reply.code != expected {
            return Err(RelayError::Protocol(format!(
                "{} rejected: {} {}",
                line.split(' ').next().unwrap_or(line),
                reply.code,
                reply.text()
            )));
        }
        Ok(reply)
    }

    async fn greeting(&mut self) -> Result<(), RelayError> {
        let reply = self.read_reply().await?;
        if reply.code != 220 {
            return Err(RelayError::Protocol(format!(
                "expected 220 greeting, got {} {}",
                reply.code,
                reply.text()
            )));
        }
        Ok(())
    }

    async fn ehlo(&mut self, host: &str) -> Result<(), RelayError> {
        let reply = self.read_after(format!("EHLO {host}")).await?;
        if !reply.is_positive() {
            return Err(RelayError::Protocol(format!(
                "EHLO rejected: {} {}",
                reply.code,
                reply.text()
            )));
        }
        Ok(())
    }

    async fn read_after(&mut self, line: String) -> Result<Reply, RelayError> {
        self.send_line(&line).await?;
        self.read_reply().await
    }

    /// SASL PLAIN: one command carrying `\0authcid\0password` base64-encoded
    /// (RFC 4616).
    async fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), RelayError> {
        let payload = BASE64.encode(format!("\0{username}\0{password}"));
        let reply = self.read_after(format!("AUTH PLAIN {payload}")).await?;
        if reply.code != 235 {
            return Err(RelayError::Auth(format!(
                "{} {}",
                reply.code,
                reply.text()
            )));
        }
        Ok(())
    }

    /// MAIL FROM, one RCPT TO per recipient, DATA with the dot-stuffed body
    /// and the lone-dot terminator.
    async fn transaction(&mut self, task: &SendTask, body: &str) -> Result<(), RelayError> {
        self.exchange(&format!("MAIL FROM:<{}>", task.sender), 250)
            .await?;
        if task.recipients.is_empty() {
            return Err(RelayError::Protocol("task has no recipients".into()));
        }
        for recipient in &task.recipients {
            let reply = self.read_after(format!("RCPT TO:<{recipient}>")).await?;
            if !reply.is_positive() && reply.code != 251 && reply.code != 252 {
                return Err(RelayError::Protocol(format!(
                    "RCPT TO:<{recipient}> rejected: {} {}",
                    reply.code,
                    reply.text()
                )));
            }
        }
        let reply = self.read_after("DATA".to_string()).await?;
        if reply.code != 354 {
            return Err(RelayError::Protocol(format!(
                "DATA rejected: {} {}",
                reply.code,
                reply.text()
            )));
        }
        let stuffed = message::dot_stuff(body);
        let terminator: &[u8] = if stuffed.ends_with("\r\n") {
            b".\r\n"
        } else {
            b"\r\n.\r\n"
        };
        let write = async {
            self.stream.write_all(stuffed.as_bytes()).await?;
            self.stream.write_all(terminator).await?;
            self.stream.flush().await
        };
        timeout(IO_TIMEOUT, write)
            .await
            .map_err(|_| RelayError::Protocol("write timed out".into()))?
            .map_err(|err| RelayError::Protocol(err.to_string()))?;
        let reply = self.read_reply().await?;
        if !reply.is_positive() {
            return Err(RelayError::Protocol(format!(
                "message rejected: {} {}",
                reply.code,
                reply.text()
            )));
        }
        Ok(())
    }

    async fn quit(&mut self) {
        // Best effort; the transaction is already acknowledged.
        if self.send_line("QUIT").await.is_ok() {
            let _ = self.read_reply().await;
        }
    }

    async fn run(
        &mut self,
        config: &RelayConfig,
        task: &SendTask,
        body: &str,
    ) -> Result<(), RelayError> {
        if let Some((username, password)) = config.credentials() {
            self.auth_plain(username, password).await?;
        }
        self.transaction(task, body).await?;
        self.quit().await;
        Ok(())
    }
}

/// Deliver one task to the configured relay.
///
/// Port 465 means implicit TLS; any other port starts plain and upgrades
/// with STARTTLS when `use_tls` is set. The connection is dropped on every
/// exit path.
pub async fn deliver(config: &RelayConfig, task: &SendTask) -> Result<(), RelayError> {
    let body = message::format_message(task, &config.host);
    tracing::debug!(task = %task.id, relay = %config.host, port = config.port, "relay session start");

    if config.port == 465 {
        let stream = net::connect_implicit_tls(&config.host, config.port).await?;
        let mut session = Session::new(stream);
        session.greeting().await?;
        session.ehlo(&config.ehlo_host).await?;
        session.run(config, task, &body).await?;
    } else {
        let tcp = net::connect_plain(&config.host, config.port).await?;
        let mut session = Session::new(tcp);
        session.greeting().await?;
        session.ehlo(&config.ehlo_host).await?;
        if config.use_tls {
            let reply = session.read_after("STARTTLS".to_string()).await?;
            if reply.code != 220 {
                return Err(RelayError::Tls(format!(
                    "STARTTLS rejected: {} {}",
                    reply.code,
                    reply.text()
                )));
            }
            let tls = net::upgrade_tls(session.into_inner(), &config.host).await?;
            let mut session = Session::new(tls);
            session.ehlo(&config.ehlo_host).await?;
            session.run(config, task, &body).await?;
        } else {
            session.run(config, task, &body).await?;
        }
    }
    tracing::debug!(task = %task.id, "relay session complete");
    Ok(())
}
