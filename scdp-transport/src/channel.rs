//! An open SSH direct-tcpip channel (§3 "SSH channel").
//!
//! `ssh2::Channel` is a blocking type; pumping bytes to and from one is
//! pushed onto `tokio::task::spawn_blocking` loops. The inbound direction
//! polls the channel in non-blocking mode rather than holding the channel
//! lock through an indefinite blocking read, so a quiet peer can never
//! starve the outbound direction of the lock it needs to write.

use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use ssh2::Session;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// The size of the buffer used when copying bytes between a socket and a
/// channel.
const COPY_BUF_SIZE: usize = 16 * 1024;

/// How long to wait between non-blocking read attempts that found no data
/// available yet.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The outcome of a single non-blocking read attempt against the channel.
enum PollOutcome {
    /// Bytes were read.
    Data(Vec<u8>),
    /// No data is available yet; the caller should back off and retry.
    WouldBlock,
    /// The peer closed its end.
    Eof,
}

/// An open SSH direct-tcpip channel (§2 "Glossary": a subchannel that
/// tunnels a single TCP stream to a `(host, port)` reachable from the SSH
/// peer).
pub struct SshChannel {
    session: Arc<Mutex<Session>>,
    inner: Arc<Mutex<ssh2::Channel>>,
}

impl SshChannel {
    pub(crate) fn new(session: Arc<Mutex<Session>>, channel: ssh2::Channel) -> Self {
        Self {
            session,
            inner: Arc::new(Mutex::new(channel)),
        }
    }

    /// Bidirectionally proxies bytes between `socket` and this channel until
    /// either side signals EOF or error, then closes both ends
    /// (§4.2 "Algorithm").
    ///
    /// Byte order within each direction is preserved; there is no
    /// interleaving across directions (§5 "Ordering guarantees").
    pub async fn pump(self, socket: TcpStream) -> std::io::Result<()> {
        let (mut socket_read, mut socket_write) = socket.into_split();

        let to_channel = {
            let channel = self.inner.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; COPY_BUF_SIZE];
                loop {
                    let n = match socket_read.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };

                    let chunk = buf[..n].to_vec();
                    let channel = channel.clone();
                    let wrote = tokio::task::spawn_blocking(move || {
                        let mut guard = channel.lock().expect("channel mutex poisoned");
                        guard.write_all(&chunk).and_then(|_| guard.flush())
                    })
                    .await;

                    if !matches!(wrote, Ok(Ok(()))) {
                        break;
                    }
                }

                let channel = channel.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    let mut guard = channel.lock().expect("channel mutex poisoned");
                    guard.send_eof()
                })
                .await;
            })
        };

        let from_channel = {
            let channel = self.inner.clone();
            let session = self.session.clone();
            tokio::spawn(async move {
                loop {
                    let channel = channel.clone();
                    let session = session.clone();
                    let poll = tokio::task::spawn_blocking(move || {
                        let session_guard = session.lock().expect("session mutex poisoned");
                        session_guard.set_blocking(false);
                        let mut guard = channel.lock().expect("channel mutex poisoned");
                        let mut buf = vec![0u8; COPY_BUF_SIZE];
                        let outcome = match guard.read(&mut buf) {
                            Ok(0) => Ok(PollOutcome::Eof),
                            Ok(n) => Ok(PollOutcome::Data(buf[..n].to_vec())),
                            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                                Ok(PollOutcome::WouldBlock)
                            }
                            Err(err) => Err(err),
                        };
                        drop(guard);
                        session_guard.set_blocking(true);
                        outcome
                    })
                    .await;

                    let chunk = match poll {
                        Ok(Ok(PollOutcome::Data(chunk))) => chunk,
                        Ok(Ok(PollOutcome::WouldBlock)) => {
                            tokio::time::sleep(POLL_INTERVAL).await;
                            continue;
                        }
                        Ok(Ok(PollOutcome::Eof)) | Ok(Err(_)) | Err(_) => break,
                    };

                    if socket_write.write_all(&chunk).await.is_err() {
                        break;
                    }
                }

                let _ = socket_write.shutdown().await;
            })
        };

        let _ = tokio::join!(to_channel, from_channel);

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock().expect("channel mutex poisoned");
            let _ = guard.close();
            let _ = guard.wait_close();
        })
        .await
        .ok();

        Ok(())
    }
}
