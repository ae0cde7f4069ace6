//! Shared fixtures for the integration tests: an in-process mock NNTP
//! server, a reference yEnc encoder, and PAR2 packet builders.

#![allow(dead_code)] // each test binary uses a different slice of this module

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gonzbee::nntp::ServerConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

// ---------------------------------------------------------------------------
// yEnc encoding
// ---------------------------------------------------------------------------

/// Reference yEnc encoder: escapes NUL, LF, CR, and `=`; wraps at 128.
pub fn yenc_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 128 + 16);
    let mut col = 0;
    for &b in data {
        let enc = b.wrapping_add(42);
        match enc {
            0x00 | 0x0a | 0x0d | b'=' => {
                out.push(b'=');
                out.push(enc.wrapping_add(64));
                col += 2;
            }
            _ => {
                out.push(enc);
                col += 1;
            }
        }
        if col >= 128 {
            out.push(b'\n');
            col = 0;
        }
    }
    if col > 0 {
        out.push(b'\n');
    }
    out
}

pub fn crc_of(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// A complete single-part yEnc article body.
pub fn single_part_article(data: &[u8], name: &str) -> Vec<u8> {
    let mut art = Vec::new();
    art.extend_from_slice(
        format!("=ybegin line=128 size={} name={}\n", data.len(), name).as_bytes(),
    );
    art.extend_from_slice(&yenc_encode(data));
    art.extend_from_slice(
        format!("=yend size={} crc32={:08x}\n", data.len(), crc_of(data)).as_bytes(),
    );
    art
}

/// A complete multipart yEnc article body; `begin1` is the 1-based offset
/// as it appears on the wire.
pub fn multipart_article(
    data: &[u8],
    name: &str,
    file_size: u64,
    begin1: u64,
    number: u32,
    total: u32,
) -> Vec<u8> {
    let end = begin1 - 1 + data.len() as u64;
    let mut art = Vec::new();
    art.extend_from_slice(
        format!(
            "=ybegin part={number} total={total} line=128 size={file_size} name={name}\n"
        )
        .as_bytes(),
    );
    art.extend_from_slice(format!("=ypart begin={begin1} end={end}\n").as_bytes());
    art.extend_from_slice(&yenc_encode(data));
    art.extend_from_slice(
        format!(
            "=yend size={} part={number} pcrc32={:08x}\n",
            data.len(),
            crc_of(data)
        )
        .as_bytes(),
    );
    art
}

// ---------------------------------------------------------------------------
// PAR2 packet building
// ---------------------------------------------------------------------------

const PAR2_MAGIC: &[u8; 8] = b"PAR2\0PKT";
const PAR2_HEADER_LEN: usize = 64;
pub const TYPE_MAIN: &[u8; 16] = b"PAR 2.0\0Main\0\0\0\0";
pub const TYPE_FILE_DESC: &[u8; 16] = b"PAR 2.0\0FileDesc";
pub const TYPE_IFSC: &[u8; 16] = b"PAR 2.0\0IFSC\0\0\0\0";

pub fn par2_packet(set_id: &[u8; 16], type_tag: &[u8; 16], body: &[u8]) -> Vec<u8> {
    let packet_len = (PAR2_HEADER_LEN + body.len()) as u64;
    let mut ctx = md5::Context::new();
    ctx.consume(set_id);
    ctx.consume(type_tag);
    ctx.consume(body);
    let hash = ctx.compute().0;

    let mut pkt = Vec::with_capacity(packet_len as usize);
    pkt.extend_from_slice(PAR2_MAGIC);
    pkt.extend_from_slice(&packet_len.to_le_bytes());
    pkt.extend_from_slice(&hash);
    pkt.extend_from_slice(set_id);
    pkt.extend_from_slice(type_tag);
    pkt.extend_from_slice(body);
    pkt
}

/// A marker file's worth of packets for a set of (file_id, name, data)
/// entries with the given slice length.
pub fn par2_marker(set_id: &[u8; 16], slice_len: usize, files: &[([u8; 16], &str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();

    let mut main_body = Vec::new();
    main_body.extend_from_slice(&(slice_len as u64).to_le_bytes());
    main_body.extend_from_slice(&(files.len() as u32).to_le_bytes());
    for (id, _, _) in files {
        main_body.extend_from_slice(id);
    }
    out.extend_from_slice(&par2_packet(set_id, TYPE_MAIN, &main_body));

    for (id, name, data) in files {
        let mut desc = Vec::new();
        desc.extend_from_slice(id);
        desc.extend_from_slice(&md5::compute(data).0);
        desc.extend_from_slice(&md5::compute(&data[..data.len().min(16384)]).0);
        desc.extend_from_slice(&(data.len() as u64).to_le_bytes());
        let name_bytes = name.as_bytes();
        let padded = name_bytes.len().div_ceil(4) * 4;
        desc.extend_from_slice(name_bytes);
        desc.resize(desc.len() + (padded - name_bytes.len()), 0);
        out.extend_from_slice(&par2_packet(set_id, TYPE_FILE_DESC, &desc));

        let mut ifsc = Vec::new();
        ifsc.extend_from_slice(id);
        for chunk in data.chunks(slice_len) {
            ifsc.extend_from_slice(&md5::compute(chunk).0);
            ifsc.extend_from_slice(&[0u8; 4]);
        }
        out.extend_from_slice(&par2_packet(set_id, TYPE_IFSC, &ifsc));
    }

    out
}

// ---------------------------------------------------------------------------
// Mock NNTP server
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ServerStats {
    pub connections_opened: AtomicUsize,
    pub current_connections: AtomicUsize,
    pub peak_connections: AtomicUsize,
    pub group_commands: AtomicUsize,
    pub body_commands: AtomicUsize,
}

struct ServerState {
    articles: HashMap<String, Vec<u8>>,
    auth: Option<(String, String)>,
    kill_ids: HashSet<String>,
    stats: ServerStats,
}

/// Scripted NNTP server bound to an ephemeral localhost port.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

#[derive(Default)]
pub struct MockServerBuilder {
    articles: HashMap<String, Vec<u8>>,
    auth: Option<(String, String)>,
    kill_ids: HashSet<String>,
}

impl MockServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an article body (raw yEnc text, LF line endings) under a
    /// message id without angle brackets.
    pub fn article(mut self, message_id: &str, body: Vec<u8>) -> Self {
        self.articles.insert(message_id.to_owned(), body);
        self
    }

    /// Require AUTHINFO with these credentials.
    pub fn auth(mut self, user: &str, pass: &str) -> Self {
        self.auth = Some((user.to_owned(), pass.to_owned()));
        self
    }

    /// Make this message id hang up mid-body, simulating transport death.
    pub fn kill_article(mut self, message_id: &str) -> Self {
        self.kill_ids.insert(message_id.to_owned());
        self
    }

    pub async fn start(self) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState {
            articles: self.articles,
            auth: self.auth,
            kill_ids: self.kill_ids,
            stats: ServerStats::default(),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state).await;
                });
            }
        });

        MockServer { addr, state }
    }
}

impl MockServer {
    pub fn server_config(&self) -> ServerConfig {
        let (username, password) = match &self.state.auth {
            Some((u, p)) => (Some(u.clone()), Some(p.clone())),
            None => (None, None),
        };
        ServerConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            tls: false,
            username,
            password,
        }
    }

    /// Server config with deliberately wrong credentials.
    pub fn server_config_with_creds(&self, user: &str, pass: &str) -> ServerConfig {
        ServerConfig {
            username: Some(user.to_owned()),
            password: Some(pass.to_owned()),
            ..self.server_config()
        }
    }

    pub fn connections_opened(&self) -> usize {
        self.state.stats.connections_opened.load(Ordering::SeqCst)
    }

    pub fn peak_connections(&self) -> usize {
        self.state.stats.peak_connections.load(Ordering::SeqCst)
    }

    pub fn group_commands(&self) -> usize {
        self.state.stats.group_commands.load(Ordering::SeqCst)
    }

    pub fn body_commands(&self) -> usize {
        self.state.stats.body_commands.load(Ordering::SeqCst)
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let stats = &state.stats;
    stats.connections_opened.fetch_add(1, Ordering::SeqCst);
    let current = stats.current_connections.fetch_add(1, Ordering::SeqCst) + 1;
    stats.peak_connections.fetch_max(current, Ordering::SeqCst);

    let result = serve_connection(stream, &state).await;

    stats.current_connections.fetch_sub(1, Ordering::SeqCst);
    result
}

async fn serve_connection(stream: TcpStream, state: &ServerState) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    writer.write_all(b"200 mock NNTP service ready\r\n").await?;

    let mut authed = state.auth.is_none();
    let mut pending_user: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let cmd = line.trim_end();

        if let Some(user) = cmd.strip_prefix("AUTHINFO USER ") {
            pending_user = Some(user.to_owned());
            writer.write_all(b"381 password required\r\n").await?;
        } else if let Some(pass) = cmd.strip_prefix("AUTHINFO PASS ") {
            let ok = match (&state.auth, &pending_user) {
                (Some((u, p)), Some(sent_user)) => sent_user == u && pass == p,
                _ => false,
            };
            if ok {
                authed = true;
                writer.write_all(b"281 authentication accepted\r\n").await?;
            } else {
                writer.write_all(b"482 authentication rejected\r\n").await?;
            }
        } else if let Some(group) = cmd.strip_prefix("GROUP ") {
            state.stats.group_commands.fetch_add(1, Ordering::SeqCst);
            if !authed {
                writer.write_all(b"480 authentication required\r\n").await?;
            } else if group == "no.such.group" {
                writer.write_all(b"411 no such newsgroup\r\n").await?;
            } else {
                writer
                    .write_all(format!("211 0 0 0 {group}\r\n").as_bytes())
                    .await?;
            }
        } else if let Some(spec) = cmd.strip_prefix("BODY ") {
            state.stats.body_commands.fetch_add(1, Ordering::SeqCst);
            let id = spec.trim_start_matches('<').trim_end_matches('>');
            if !authed {
                writer.write_all(b"480 authentication required\r\n").await?;
            } else if state.kill_ids.contains(id) {
                // start a plausible response, then die mid-body
                writer.write_all(b"222 0 body follows\r\n=ybegi").await?;
                writer.flush().await?;
                return Ok(());
            } else if let Some(article) = state.articles.get(id) {
                writer.write_all(b"222 0 body follows\r\n").await?;
                writer.write_all(&dot_stuff(article)).await?;
                writer.write_all(b".\r\n").await?;
            } else {
                writer.write_all(b"430 no such article\r\n").await?;
            }
        } else {
            writer.write_all(b"500 command not recognized\r\n").await?;
        }
        writer.flush().await?;
    }
}

/// CRLF line endings plus leading-dot stuffing, per RFC 3977.
fn dot_stuff(article: &[u8]) -> Vec<u8> {
    let trimmed = article.strip_suffix(b"\n").unwrap_or(article);
    let mut out = Vec::with_capacity(article.len() + 64);
    for line in trimmed.split(|&b| b == b'\n') {
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out
}
