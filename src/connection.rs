//! TCP communication with the MAS controller.
//!
//! [`Connection`] owns one socket and the command table loaded for its
//! lifetime. Communication is strict lock-step: a command goes out, the reply
//! is read to completion (or the timeout window expires) before anything else
//! happens on the wire. Nothing is buffered across calls, so a reply can
//! never be attributed to the wrong command.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info};

use crate::config::ControllerAddress;
use crate::error::{MasError, MasResult};
use crate::protocol::{codec, CommandTable};

/// Default reply/connect timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause before closing the socket, letting the controller finish flushing.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Receive chunk size.
const READ_CHUNK: usize = 80;

/// Connectivity self-test command code.
const PROBE_COMMAND: &str = "MA";

fn connection_err(err: std::io::Error) -> MasError {
    MasError::Connection(err.to_string())
}

/// One live TCP session with the controller.
pub struct Connection {
    stream: TcpStream,
    table: CommandTable,
    timeout: Duration,
}

impl Connection {
    /// Connect to the controller.
    ///
    /// The command table is fixed for the connection's lifetime; every
    /// command sent through this connection is validated against it first.
    pub async fn open(address: &ControllerAddress, table: CommandTable) -> MasResult<Self> {
        let endpoint = address.endpoint();
        let stream = timeout(DEFAULT_TIMEOUT, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| MasError::Connection(format!("connection to {endpoint} timed out")))?
            .map_err(|e| MasError::Connection(format!("failed to connect to {endpoint}: {e}")))?;
        // Commands are tiny; don't let Nagle sit on them.
        stream.set_nodelay(true)?;
        info!(%endpoint, "connected to MAS controller");

        Ok(Self {
            stream,
            table,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the reply timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The reply timeout currently in force.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The command table this connection validates against.
    pub fn command_table(&self) -> &CommandTable {
        &self.table
    }

    /// Send a command and read its complete reply.
    ///
    /// The code and argument count are validated against the command table
    /// before any bytes reach the wire. The reply is accumulated until the
    /// two-byte terminator arrives; the timeout window is wall-clock,
    /// measured from the moment the request was written.
    pub async fn send_command(&mut self, code: &str, args: &[String]) -> MasResult<Vec<String>> {
        self.table.validate(code, args)?;

        let mut line = code.to_owned();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        debug!(command = %line, "sending");

        self.stream
            .write_all(&codec::encode_message(&line))
            .await
            .map_err(connection_err)?;

        let deadline = Instant::now() + self.timeout;
        let mut received = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = match timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Err(_) => {
                    return Err(MasError::Timeout(
                        "controller took too long to respond".into(),
                    ))
                }
                Ok(Err(e)) => return Err(connection_err(e)),
                Ok(Ok(0)) => {
                    return Err(MasError::Connection(
                        "connection closed by controller".into(),
                    ))
                }
                Ok(Ok(n)) => n,
            };
            received.extend_from_slice(&chunk[..n]);
            if codec::reply_complete(&received) {
                break;
            }
        }

        let tokens = codec::decode_reply(&received);
        debug!(reply = ?tokens, "received");
        Ok(tokens)
    }

    /// Probe whether the controller is still answering.
    ///
    /// Sends the no-argument are-you-there command and checks for the exact
    /// reply `OK`. Any error - timeout, socket failure, odd reply - counts as
    /// a negative result rather than propagating.
    pub async fn test_connection(&mut self) -> bool {
        match self.send_command(PROBE_COMMAND, &[]).await {
            Ok(tokens) => tokens == ["OK"],
            Err(err) => {
                debug!(%err, "connectivity probe failed");
                false
            }
        }
    }

    /// Read and drop whatever is sitting unread on the socket.
    ///
    /// Used after a recovered timeout, when a stale reply to the timed-out
    /// command may still be in flight.
    pub async fn discard_pending(&mut self) {
        let mut scratch = [0u8; 128];
        if let Ok(Ok(n)) = timeout(self.timeout, self.stream.read(&mut scratch)).await {
            debug!(bytes = n, "discarded stale bytes");
        }
    }

    /// Close the connection after a brief grace delay.
    pub async fn close(self) {
        sleep(CLOSE_GRACE).await;
        drop(self.stream);
        debug!("connection closed");
    }
}
