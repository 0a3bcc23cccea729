use crate::InferenceError;
use crate::protocol::OnlineResponse;
use crate::readiness::Backoff;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

/// Lockstep client: sends one action, waits for its response, repeats.
pub struct OnlineClient {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    sent: u64,
}

fn ends_session(line: &str) -> bool {
    let verb = line.trim().split('\t').next().unwrap_or_default().trim();
    verb.eq_ignore_ascii_case("STOP") || verb.eq_ignore_ascii_case("EXIT")
}

impl OnlineClient {
    pub async fn connect(addr: &str, backoff: Backoff) -> Result<Self, InferenceError> {
        let stream = backoff.retry("connect", || TcpStream::connect(addr)).await?;
        info!(addr, "connected");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader).lines(),
            writer,
            sent: 0,
        })
    }

    pub async fn send(&mut self, action: &str) -> Result<OnlineResponse, InferenceError> {
        let action = action.trim_end_matches(['\r', '\n']);
        self.writer.write_all(action.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        self.sent += 1;

        let line = self.reader.next_line().await?.ok_or_else(|| {
            InferenceError::Protocol(format!(
                "server closed the connection before answering action {}",
                self.sent - 1
            ))
        })?;
        let response = OnlineResponse::parse(&line)?;
        debug!(id = response.id(), success = response.is_success(), "response");
        Ok(response)
    }

    /// Sends every non-blank line of `actions`, stopping after STOP or EXIT.
    ///
    /// If the action source or the connection fails part way, the responses
    /// already received are kept and the failure is reported alongside them.
    pub async fn run<R>(&mut self, actions: R) -> Exchange
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = actions.lines();
        let mut exchange = Exchange::default();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    exchange.interrupted = Some(e.into());
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match self.send(&line).await {
                Ok(response) => exchange.responses.push(response),
                Err(e) => {
                    warn!(error = %e, answered = exchange.responses.len(), "exchange interrupted");
                    exchange.interrupted = Some(e);
                    break;
                }
            }
            if ends_session(&line) {
                break;
            }
        }
        self.writer.shutdown().await.ok();
        info!(actions = exchange.responses.len(), "exchange finished");
        exchange
    }
}

/// Responses received in order, plus what cut the exchange short, if anything.
#[derive(Debug, Default)]
pub struct Exchange {
    pub responses: Vec<OnlineResponse>,
    pub interrupted: Option<InferenceError>,
}

impl Exchange {
    pub fn into_result(self) -> Result<Vec<OnlineResponse>, InferenceError> {
        match self.interrupted {
            Some(e) => Err(e),
            None => Ok(self.responses),
        }
    }
}

/// Writes one response per line to `output`, or stdout when `None`.
/// Missing parent directories are created.
pub fn write_responses(responses: &[OnlineResponse], output: Option<&Path>) -> Result<(), InferenceError> {
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let mut writer = BufWriter::new(fs::File::create(path)?);
            write_lines(&mut writer, responses)?;
            writer.flush()?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = stdout.lock();
            write_lines(&mut writer, responses)?;
            writer.flush()?;
        }
    }
    Ok(())
}

fn write_lines(writer: &mut impl Write, responses: &[OnlineResponse]) -> std::io::Result<()> {
    for response in responses {
        writeln!(writer, "{}", response)?;
    }
    Ok(())
}
