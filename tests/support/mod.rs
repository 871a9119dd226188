//! In-process mock MAS controller.
//!
//! Listens on a loopback port and speaks the controller's scrambled framing:
//! requests arrive +128-shifted and terminated by 0x8D, replies go back
//! shifted with the 0x8D 0x8A terminator. Connections are served one at a
//! time, like the real instrument. Knobs let tests swallow requests (to force
//! a reply timeout) or drop the connection mid-session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use masmon::config::ControllerAddress;

const SHIFT: u8 = 128;
const MESSAGE_END: u8 = 0x8D;
const REPLY_END: [u8; 2] = [0x8D, 0x8A];

/// Sentinel for "never drop the connection".
const NEVER: usize = usize::MAX;

/// Handle to a running mock controller.
pub struct MockController {
    /// Loopback endpoint the mock listens on.
    pub address: ControllerAddress,
    received: Arc<Mutex<Vec<String>>>,
    stall: Arc<AtomicUsize>,
    close_countdown: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
}

impl MockController {
    /// Bind a port and start serving.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let received = Arc::new(Mutex::new(Vec::new()));
        let stall = Arc::new(AtomicUsize::new(0));
        let close_countdown = Arc::new(AtomicUsize::new(NEVER));
        let connections = Arc::new(AtomicUsize::new(0));

        {
            let received = received.clone();
            let stall = stall.clone();
            let close_countdown = close_countdown.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    serve(socket, &received, &stall, &close_countdown).await;
                }
            });
        }

        Self {
            address: ControllerAddress {
                node: "127.0.0.1".into(),
                port,
            },
            received,
            stall,
            close_countdown,
            connections,
        }
    }

    /// Every decoded request line the mock has seen, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Swallow the next `n` non-probe requests without replying. Probes
    /// (`MA`) are still answered, mimicking a controller that lost a command
    /// but is otherwise alive.
    pub fn stall_next(&self, n: usize) {
        self.stall.store(n, Ordering::SeqCst);
    }

    /// Answer `n` more requests, then drop the connection without replying.
    /// Applies once; a later connection is served normally.
    pub fn close_after(&self, n: usize) {
        self.close_countdown.store(n, Ordering::SeqCst);
    }

    /// How many connections have been accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(
    mut socket: TcpStream,
    received: &Mutex<Vec<String>>,
    stall: &AtomicUsize,
    close_countdown: &AtomicUsize,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        while !buf.contains(&MESSAGE_END) {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let end = buf.iter().position(|b| *b == MESSAGE_END).unwrap();
        let message: Vec<u8> = buf.drain(..=end).collect();
        let line: String = message[..message.len() - 1]
            .iter()
            .map(|b| char::from(b.wrapping_sub(SHIFT)))
            .collect();
        received.lock().unwrap().push(line.clone());

        let countdown = close_countdown.load(Ordering::SeqCst);
        if countdown != NEVER {
            if countdown == 0 {
                close_countdown.store(NEVER, Ordering::SeqCst);
                return;
            }
            close_countdown.store(countdown - 1, Ordering::SeqCst);
        }

        let code = line.split_whitespace().next().unwrap_or("");
        if stall.load(Ordering::SeqCst) > 0 && code != "MA" {
            stall.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        let reply = match code {
            "MA" => "OK",
            "AS" => "AS 4500 2100 1800 1750",
            "VD" => "4500",
            _ => "OK",
        };
        let mut bytes: Vec<u8> = reply.bytes().map(|b| b.wrapping_add(SHIFT)).collect();
        bytes.extend_from_slice(&REPLY_END);
        if socket.write_all(&bytes).await.is_err() {
            return;
        }
    }
}
