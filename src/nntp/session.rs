//! A single pipelined NNTP session.
//!
//! One session owns one TCP or TLS connection and runs a writer/reader task
//! pair over its two halves. Fetches go through a bounded request channel:
//! the writer sends `GROUP` and `BODY` commands in arrival order and queues
//! a response ticket for each; the reader consumes responses strictly in
//! ticket order, which is exactly the pairing discipline NNTP pipelining
//! requires. The channel bound is the pipeline depth, so a session never
//! has more responses outstanding than the pool handed out slots for.
//!
//! `GROUP` is elided only for a group the server has confirmed with a 211
//! and with no other switch still in flight; a rejected switch is never
//! cached, so retrying the same group resends the command.
//!
//! When either half hits a transport error the session latches broken, the
//! ticket in flight gets the real error, and every other waiter is woken
//! with a connection-closed error rather than being left to hang.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{NntpError, ServerConfig};

/// Marker trait for the boxed transport; lets plain TCP and TLS share one
/// code path without generics leaking into every signature.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type Reader = BufReader<tokio::io::ReadHalf<Box<dyn Transport>>>;
type Writer = tokio::io::WriteHalf<Box<dyn Transport>>;

struct Request {
    group: String,
    message_id: String,
    reply: oneshot::Sender<Result<Vec<u8>, NntpError>>,
}

/// A response the reader owes the server, in send order.
///
/// `group` is set when a `GROUP` command went out ahead of the `BODY`, so
/// the reader knows to consume (and judge) its response first.
struct Ticket {
    group: Option<String>,
    reply: oneshot::Sender<Result<Vec<u8>, NntpError>>,
}

/// Group selection state shared by the two task halves.
///
/// The writer consults it to decide whether `GROUP` can be skipped; the
/// reader commits `confirmed` only once the server's 211 arrives, matching
/// the update-on-success rule of the protocol. `pending` counts switches
/// sent but not yet answered: while it is non-zero the wire state is
/// unknown and elision stays off.
#[derive(Default)]
struct GroupState {
    confirmed: Option<String>,
    pending: usize,
}

fn lock_group(state: &Mutex<GroupState>) -> std::sync::MutexGuard<'_, GroupState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One authenticated NNTP connection with pipelined fetches.
pub struct Session {
    req_tx: mpsc::Sender<Request>,
    broken: Arc<AtomicBool>,
    retired: AtomicBool,
    shutdown: CancellationToken,
    id: usize,
}

impl Session {
    /// Dial, read the greeting, and authenticate.
    ///
    /// `pipeline_depth` bounds how many fetches may be in flight on this
    /// session at once. The returned session is shared by cloning the
    /// `Arc`; dropping every clone does not close the socket; callers go
    /// through [`Session::close`].
    pub async fn connect(
        config: &ServerConfig,
        id: usize,
        pipeline_depth: usize,
    ) -> Result<Arc<Session>, NntpError> {
        let tcp = TcpStream::connect(config.addr()).await?;
        let transport: Box<dyn Transport> = if config.tls {
            let connector = tls_connector()?;
            let name = ServerName::try_from(config.host.clone())
                .map_err(|e| NntpError::Tls(format!("invalid server name: {e}")))?;
            Box::new(connector.connect(name, tcp).await.map_err(|e| {
                NntpError::Tls(format!("handshake with {} failed: {e}", config.host))
            })?)
        } else {
            Box::new(tcp)
        };

        let (read_half, mut writer) = tokio::io::split(transport);
        let mut reader = BufReader::new(read_half);

        let (code, line) = read_status_line(&mut reader).await?;
        if !(200..300).contains(&code) {
            return Err(NntpError::BadGreeting(line));
        }

        if let Some(user) = &config.username {
            let pass = config.password.as_deref().unwrap_or("");
            authenticate(&mut reader, &mut writer, user, pass).await?;
        }

        debug!(session = id, addr = %config.addr(), tls = config.tls, "NNTP session established");

        let broken = Arc::new(AtomicBool::new(false));
        let group_state = Arc::new(Mutex::new(GroupState::default()));
        let shutdown = CancellationToken::new();
        let (req_tx, req_rx) = mpsc::channel(pipeline_depth);
        let (pending_tx, pending_rx) = mpsc::channel(pipeline_depth);

        tokio::spawn(writer_loop(
            req_rx,
            pending_tx,
            writer,
            Arc::clone(&group_state),
            Arc::clone(&broken),
            shutdown.clone(),
            id,
        ));
        tokio::spawn(reader_loop(
            pending_rx,
            reader,
            group_state,
            Arc::clone(&broken),
            shutdown.clone(),
            id,
        ));

        Ok(Arc::new(Session {
            req_tx,
            broken,
            retired: AtomicBool::new(false),
            shutdown,
            id,
        }))
    }

    /// Fetch one article body from `group`.
    ///
    /// Selects the group if the session is not already in it, issues
    /// `BODY <message_id>`, and returns the dot-unstuffed body with CRLF
    /// line endings normalised to LF. Blocks while the session's pipeline
    /// is full.
    pub async fn fetch_body(&self, group: &str, message_id: &str) -> Result<Vec<u8>, NntpError> {
        if self.is_broken() {
            return Err(NntpError::ConnectionClosed);
        }
        let (reply, rx) = oneshot::channel();
        let req = Request {
            group: group.to_owned(),
            message_id: message_id.to_owned(),
            reply,
        };
        self.req_tx
            .send(req)
            .await
            .map_err(|_| NntpError::ConnectionClosed)?;
        rx.await.map_err(|_| NntpError::ConnectionClosed)?
    }

    /// Whether a transport failure has latched this session unusable.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Tear the connection down; idempotent.
    pub fn close(&self) {
        self.broken.store(true, Ordering::Release);
        self.shutdown.cancel();
    }

    /// One-shot latch for the pool's live accounting.
    ///
    /// Returns true for exactly one caller, so a session retired from two
    /// slots only decrements the pool's live counter once.
    pub(super) fn mark_retired(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }

    pub(super) fn id(&self) -> usize {
        self.id
    }
}

fn tls_connector() -> Result<TlsConnector, NntpError> {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for cert in loaded.certs {
        // unparseable platform certs are skipped, same as every other client
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        return Err(NntpError::Tls("no usable platform trust roots".into()));
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// `AUTHINFO USER`/`PASS` flow: 281 accepted, 381 wants the password,
/// anything else is a rejection.
async fn authenticate(
    reader: &mut Reader,
    writer: &mut Writer,
    user: &str,
    pass: &str,
) -> Result<(), NntpError> {
    writer
        .write_all(format!("AUTHINFO USER {user}\r\n").as_bytes())
        .await?;
    let (code, message) = read_status_line(reader).await?;
    match code {
        281 => return Ok(()),
        381 => {}
        code => return Err(NntpError::AuthRejected { code, message }),
    }
    writer
        .write_all(format!("AUTHINFO PASS {pass}\r\n").as_bytes())
        .await?;
    let (code, message) = read_status_line(reader).await?;
    match code {
        281 => Ok(()),
        code => Err(NntpError::AuthRejected { code, message }),
    }
}

/// Read one `code text` status line.
async fn read_status_line(reader: &mut Reader) -> Result<(u16, String), NntpError> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(NntpError::ConnectionClosed);
    }
    while matches!(line.last(), Some(&b'\n') | Some(&b'\r')) {
        line.pop();
    }
    let line = String::from_utf8_lossy(&line).into_owned();
    let code = line
        .get(..3)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| NntpError::BadResponse(line.clone()))?;
    Ok((code, line))
}

/// Read a dot-stuffed multi-line body up to the lone-dot terminator.
///
/// Strips the CR of each CRLF and un-stuffs leading double dots, matching
/// what a decoder downstream expects.
async fn read_dot_body(reader: &mut Reader) -> Result<Vec<u8>, NntpError> {
    let mut body = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(NntpError::ConnectionClosed);
        }
        while matches!(line.last(), Some(&b'\n') | Some(&b'\r')) {
            line.pop();
        }
        match line.as_slice() {
            b"." => return Ok(body),
            [b'.', rest @ ..] => body.extend_from_slice(rest),
            rest => body.extend_from_slice(rest),
        }
        body.push(b'\n');
    }
}

/// Writer half: serialise commands in request order and queue a ticket for
/// each before the bytes hit the wire, so the reader's pairing can never
/// get ahead of the send order.
async fn writer_loop(
    mut req_rx: mpsc::Receiver<Request>,
    pending_tx: mpsc::Sender<Ticket>,
    mut writer: Writer,
    group_state: Arc<Mutex<GroupState>>,
    broken: Arc<AtomicBool>,
    shutdown: CancellationToken,
    id: usize,
) {
    loop {
        let req = tokio::select! {
            r = req_rx.recv() => match r {
                Some(r) => r,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        // skip GROUP only when the server has confirmed this group and no
        // other switch is still in flight ahead of us
        let group_sent = {
            let mut state = lock_group(&group_state);
            let elide =
                state.pending == 0 && state.confirmed.as_deref() == Some(req.group.as_str());
            if !elide {
                state.pending += 1;
            }
            !elide
        };

        let mut cmd = String::new();
        if group_sent {
            cmd.push_str(&format!("GROUP {}\r\n", req.group));
        }
        cmd.push_str(&format!("BODY <{}>\r\n", req.message_id));
        trace!(session = id, message_id = %req.message_id, group_sent, "sending BODY");

        // ticket first: even if the write fails half-way the reader owns
        // the pairing and will wake the waiter
        let ticket = Ticket {
            group: if group_sent { Some(req.group) } else { None },
            reply: req.reply,
        };
        if pending_tx.send(ticket).await.is_err() {
            // reader is gone; dropping the returned ticket wakes the waiter
            break;
        }

        if let Err(e) = writer.write_all(cmd.as_bytes()).await {
            debug!(session = id, error = %e, "command send failed");
            broken.store(true, Ordering::Release);
            break;
        }
    }

    // refuse anything still queued behind a dead writer
    broken.store(true, Ordering::Release);
    req_rx.close();
    while let Ok(req) = req_rx.try_recv() {
        let _ = req.reply.send(Err(NntpError::ConnectionClosed));
    }
}

/// Reader half: consume exactly one response sequence per ticket, in ticket
/// order. Protocol rejections keep the link; transport errors latch it
/// broken and fail every queued ticket.
///
/// This is also where a group switch becomes official: `confirmed` is set
/// only when the 211 has actually been read, so a rejected switch never
/// poisons the elision state.
async fn reader_loop(
    mut pending_rx: mpsc::Receiver<Ticket>,
    mut reader: Reader,
    group_state: Arc<Mutex<GroupState>>,
    broken: Arc<AtomicBool>,
    shutdown: CancellationToken,
    id: usize,
) {
    loop {
        let ticket = tokio::select! {
            t = pending_rx.recv() => match t {
                Some(t) => t,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        // settle the GROUP response first, when this ticket owes one
        let mut group_failure = None;
        if let Some(group) = ticket.group.as_deref() {
            match read_status_line(&mut reader).await {
                Ok((code, message)) => {
                    let mut state = lock_group(&group_state);
                    state.pending -= 1;
                    if code == 211 {
                        state.confirmed = Some(group.to_owned());
                    } else {
                        group_failure = Some(NntpError::Protocol { code, message });
                    }
                }
                Err(e) => {
                    debug!(session = id, error = %e, "response read failed, retiring session");
                    broken.store(true, Ordering::Release);
                    let _ = ticket.reply.send(Err(e));
                    break;
                }
            }
        }

        // the BODY response is on the wire even when GROUP failed; consume
        // it either way so the pairing stays aligned
        let body = read_body_response(&mut reader).await;
        match body {
            Err(e) if e.is_transport() => {
                debug!(session = id, error = %e, "response read failed, retiring session");
                broken.store(true, Ordering::Release);
                let _ = ticket.reply.send(Err(e));
                break;
            }
            body => {
                // a rejected GROUP outranks whatever BODY said
                let result = match group_failure {
                    Some(err) => Err(err),
                    None => body,
                };
                let _ = ticket.reply.send(result);
            }
        }
    }

    broken.store(true, Ordering::Release);
    pending_rx.close();
    while let Ok(ticket) = pending_rx.try_recv() {
        let _ = ticket.reply.send(Err(NntpError::ConnectionClosed));
    }
}

/// Consume one `BODY` response: the 222 status line, then the dot-stuffed
/// body.
async fn read_body_response(reader: &mut Reader) -> Result<Vec<u8>, NntpError> {
    let (code, message) = read_status_line(reader).await?;
    if code != 222 {
        return Err(NntpError::Protocol { code, message });
    }
    read_dot_body(reader).await
}
