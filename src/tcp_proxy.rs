use log::{debug, info, trace, warn};

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use asset_host_proxy::{ContentKind, RewriteEngine};

//Adapted from https://github.com/hishboy/rust-tcp-proxy/

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 96;
/// Larger HTML/CSS bodies are streamed unchanged instead of being buffered.
const MAX_REWRITE_BODY: usize = 16 * 1024 * 1024;

pub struct RewriteProxy {
    engine: Arc<RewriteEngine>,
    connect_timeout: Duration,
    stream_timeout: Duration,
}

impl RewriteProxy {
    pub fn new(engine: Arc<RewriteEngine>, connect_timeout: Duration, stream_timeout: Duration) -> Self {
        RewriteProxy {
            engine,
            connect_timeout,
            stream_timeout,
        }
    }

    pub fn start(self, to: SocketAddr, from: SocketAddr) -> io::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(from)?;

        info!(target: "assetproxy", "Proxying TCP connections from {} to {} (rewriting {} -> {})",
              from, to, self.engine.matcher().source(), self.engine.matcher().target());

        Ok(thread::spawn(self.listen_loop(listener, to)))
    }

    fn listen_loop(self, listener: TcpListener, origin: SocketAddr) -> impl FnOnce() {
        let connect_timeout = self.connect_timeout;
        let stream_timeout = self.stream_timeout;
        let engine = self.engine;

        move || {
            for incoming_stream in listener.incoming() {
                let proxied_stream = match incoming_stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(target: "assetproxy", "Failed to accept incoming connection: {}", e);
                        continue;
                    }
                };

                let peer_addr = match proxied_stream.peer_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!(target: "assetproxy", "Failed to get peer address: {}", e);
                        continue;
                    }
                };

                set_stream_timeouts(&proxied_stream, stream_timeout, "client");

                let to_stream = match TcpStream::connect_timeout(&origin, connect_timeout) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(target: "assetproxy", "Failed to connect to origin {}: {}", origin, e);
                        continue;
                    }
                };

                set_stream_timeouts(&to_stream, stream_timeout, "origin");

                let engine = Arc::clone(&engine);

                thread::spawn(move || handle_conn(proxied_stream, to_stream, peer_addr, engine));

                debug!(target: "assetproxy", "Successfully established a connection with client: {}", peer_addr);
            }
        }
    }
}

fn set_stream_timeouts(stream: &TcpStream, timeout: Duration, side: &str) {
    if let Err(e) = stream.set_read_timeout(Some(timeout)) {
        warn!(target: "assetproxy", "Failed to set read timeout on {}: {}", side, e);
    }
    if let Err(e) = stream.set_write_timeout(Some(timeout)) {
        warn!(target: "assetproxy", "Failed to set write timeout on {}: {}", side, e);
    }
}

fn handle_conn(
    client_stream: TcpStream,
    origin_stream: TcpStream,
    peer_addr: SocketAddr,
    engine: Arc<RewriteEngine>,
) {
    let client_read = match client_stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!(target: "assetproxy", "Failed to clone client stream for {}: {}", peer_addr, e);
            return;
        }
    };
    let client_write = client_stream;

    let origin_read = match origin_stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!(target: "assetproxy", "Failed to clone origin stream for {}: {}", peer_addr, e);
            return;
        }
    };
    let origin_write = origin_stream;

    let (methods_tx, methods_rx) = mpsc::channel();

    // Client -> Origin: request bodies are never rewritten
    let client_to_origin = thread::spawn(move || {
        let mut origin_write = origin_write;
        if let Err(e) = forward_requests(client_read, &mut origin_write, methods_tx, peer_addr) {
            trace!(target: "assetproxy", "Request forwarding ended for {}: {}", peer_addr, e);
        }
        let _ = origin_write.shutdown(Shutdown::Write);
    });

    // Origin -> Client: rewrite asset URLs in HTML and CSS responses
    let origin_to_client = thread::spawn(move || {
        let mut client_write = client_write;
        if let Err(e) = proxy_responses(origin_read, &mut client_write, &engine, &methods_rx, peer_addr) {
            trace!(target: "assetproxy", "Response proxy ended for {}: {}", peer_addr, e);
        }
        let _ = client_write.shutdown(Shutdown::Write);
    });

    if let Err(e) = client_to_origin.join() {
        warn!(target: "assetproxy", "Client->origin thread panicked for {}: {:?}", peer_addr, e);
    }
    if let Err(e) = origin_to_client.join() {
        warn!(target: "assetproxy", "Origin->client thread panicked for {}: {:?}", peer_addr, e);
    }

    trace!(target: "assetproxy", "Closed connection with: {}", peer_addr);
}

/// How the end of a message body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Chunked,
    Length(usize),
    /// No length information: a request has no body, a response runs until close.
    Unframed,
}

#[derive(Debug)]
struct RequestHead {
    method: String,
    framing: Framing,
    upgrade: bool,
}

#[derive(Debug)]
struct ResponseHead {
    status: u16,
    framing: Framing,
    content_type: Option<String>,
    content_encoding: Option<String>,
}

impl ResponseHead {
    /// Only uncompressed HTML and CSS bodies go through the engine.
    fn is_rewritable(&self) -> bool {
        let identity = self
            .content_encoding
            .as_deref()
            .map_or(true, |e| e.trim().is_empty() || e.trim().eq_ignore_ascii_case("identity"));

        identity
            && self
                .content_type
                .as_deref()
                .is_some_and(|ct| ContentKind::from_content_type(ct).is_rewritable())
    }
}

fn header_value<'h>(headers: &'h [httparse::Header<'_>], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
}

fn framing(headers: &[httparse::Header<'_>]) -> Framing {
    let chunked = header_value(headers, "transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));

    if chunked {
        return Framing::Chunked;
    }

    match header_value(headers, "content-length").and_then(|len| len.parse().ok()) {
        Some(len) => Framing::Length(len),
        None => Framing::Unframed,
    }
}

fn parse_request_head(head: &[u8]) -> Option<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }

    let upgrade = header_value(request.headers, "upgrade").is_some()
        && header_value(request.headers, "connection")
            .is_some_and(|c| c.to_ascii_lowercase().contains("upgrade"));

    Some(RequestHead {
        method: request.method?.to_string(),
        framing: framing(request.headers),
        upgrade,
    })
}

fn parse_response_head(head: &[u8]) -> Option<ResponseHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }

    Some(ResponseHead {
        status: response.code?,
        framing: framing(response.headers),
        content_type: header_value(response.headers, "content-type").map(str::to_string),
        content_encoding: header_value(response.headers, "content-encoding").map(str::to_string),
    })
}

/// Read a line (until \n) as raw bytes, without requiring valid UTF-8.
/// This is essential for handling binary data that might appear in streams.
fn read_line_bytes<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    Ok(line)
}

/// Reads a message head up to and including the empty line. `None` means the
/// peer closed the connection between messages.
fn read_head<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut head = Vec::new();

    loop {
        let line = read_line_bytes(reader)?;
        if line.is_empty() {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Connection closed inside message head"));
        }

        let blank = line == b"\r\n" || line == b"\n";
        if blank && head.is_empty() {
            // stray CRLF between messages
            continue;
        }

        head.extend_from_slice(&line);

        if blank {
            return Ok(Some(head));
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Message head too large"));
        }
    }
}

/// First line of a head, restricted to printable ASCII and capped for logging.
fn printable_start_line(head: &[u8]) -> String {
    String::from_utf8_lossy(head)
        .lines()
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(100)
        .collect()
}

/// Parse a chunk size from raw bytes (ASCII hex digits)
fn parse_chunk_size(line: &[u8]) -> io::Result<usize> {
    // Find the end of the hex digits (ignore extensions after ';' and whitespace)
    let hex_end = line
        .iter()
        .position(|&b| b == b';' || b == b'\r' || b == b'\n' || b == b' ')
        .unwrap_or(line.len());

    let hex_str = std::str::from_utf8(&line[..hex_end])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Invalid chunk size encoding"))?;

    usize::from_str_radix(hex_str.trim(), 16).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid chunk size '{}': {}", hex_str, e),
        )
    })
}

fn is_header_line(line: &[u8], name: &str) -> bool {
    line.len() > name.len()
        && line[..name.len()].eq_ignore_ascii_case(name.as_bytes())
        && line[name.len()] == b':'
}

/// Drops every occurrence of header `name` from a raw head.
fn remove_header(head: &[u8], name: &str) -> Vec<u8> {
    head.split_inclusive(|&b| b == b'\n')
        .filter(|line| !is_header_line(line, name))
        .flatten()
        .copied()
        .collect()
}

/// Update Content-Length header in a raw head
fn update_content_length(head: &[u8], new_length: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(head.len());

    for line in head.split_inclusive(|&b| b == b'\n') {
        if is_header_line(line, "content-length") {
            result.extend_from_slice(format!("Content-Length: {}\r\n", new_length).as_bytes());
        } else {
            result.extend_from_slice(line);
        }
    }

    result
}

/// Copy exactly `len` bytes, stopping early if the peer closes.
fn pass_through_exact<R: Read, W: Write>(reader: &mut R, writer: &mut W, len: usize) -> io::Result<()> {
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let to_read = std::cmp::min(remaining, buf.len());
        let bytes_read = reader.read(&mut buf[..to_read])?;
        if bytes_read == 0 {
            break;
        }
        writer.write_all(&buf[..bytes_read])?;
        remaining -= bytes_read;
    }
    Ok(())
}

/// Consumes the trailer section after the last chunk, forwarding it when a
/// writer is given.
fn read_trailers<R: BufRead, W: Write>(reader: &mut R, mut writer: Option<&mut W>) -> io::Result<()> {
    loop {
        let line = read_line_bytes(reader)?;
        if let Some(writer) = writer.as_deref_mut() {
            writer.write_all(&line)?;
        }
        if line.is_empty() || line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
    }
}

/// Pass through chunked data without buffering the entire body
fn pass_through_chunked<R: BufRead, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<()> {
    loop {
        let size_line = read_line_bytes(reader)?;
        if size_line.is_empty() {
            break;
        }
        writer.write_all(&size_line)?;

        let chunk_size = parse_chunk_size(&size_line)?;

        if chunk_size == 0 {
            read_trailers(reader, Some(&mut *writer))?;
            break;
        }

        forward_chunk_data(reader, writer, chunk_size)?;
    }

    Ok(())
}

/// Forward one chunk's data and its trailing CRLF.
fn forward_chunk_data<R: Read, W: Write>(reader: &mut R, writer: &mut W, chunk_size: usize) -> io::Result<()> {
    pass_through_exact(reader, writer, chunk_size)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    writer.write_all(&crlf)
}

enum ChunkedBody {
    Complete(Vec<u8>),
    /// The chunk announced by `size_line` would take the body past the limit.
    /// `decoded` holds the data of the chunks before it.
    Oversized {
        decoded: Vec<u8>,
        size_line: Vec<u8>,
        chunk_size: usize,
    },
}

/// Read a chunked HTTP body of at most `limit` decoded bytes
fn read_chunked_body<R: BufRead>(reader: &mut R, limit: usize) -> io::Result<ChunkedBody> {
    let mut body = Vec::new();

    loop {
        let size_line = read_line_bytes(reader)?;
        if size_line.is_empty() {
            break;
        }

        let chunk_size = parse_chunk_size(&size_line)?;

        if chunk_size == 0 {
            read_trailers(reader, None::<&mut io::Sink>)?;
            break;
        }

        if chunk_size > limit - body.len() {
            return Ok(ChunkedBody::Oversized {
                decoded: body,
                size_line,
                chunk_size,
            });
        }

        let start = body.len();
        body.resize(start + chunk_size, 0);
        reader.read_exact(&mut body[start..])?;

        // Read trailing CRLF after chunk
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
    }

    Ok(ChunkedBody::Complete(body))
}

/// Write `data` as one chunk; empty data writes nothing.
fn write_chunk<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if !data.is_empty() {
        write!(writer, "{:x}\r\n", data.len())?;
        writer.write_all(data)?;
        writer.write_all(b"\r\n")?;
    }
    Ok(())
}

/// Write body as chunked encoding
fn write_chunked_body<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    write_chunk(writer, body)?;
    writer.write_all(b"0\r\n\r\n")?;
    Ok(())
}

/// Forward requests to the origin unchanged except for `Accept-Encoding`, so
/// that rewritable responses come back uncompressed. Form submissions and
/// every other request body are copied byte-for-byte.
fn forward_requests<R: Read, W: Write>(
    client_read: R,
    origin_write: &mut W,
    methods: Sender<String>,
    peer_addr: SocketAddr,
) -> io::Result<()> {
    let mut reader = BufReader::new(client_read);

    loop {
        let Some(head) = read_head(&mut reader)? else {
            return Ok(());
        };

        let Some(request) = parse_request_head(&head) else {
            debug!(target: "assetproxy", "Unparseable request head from {}, switching to raw copy", peer_addr);
            origin_write.write_all(&head)?;
            io::copy(&mut reader, origin_write)?;
            return Ok(());
        };

        trace!(target: "assetproxy", "Request from {}: {}", peer_addr, printable_start_line(&head));

        // The response side must know the method before the origin can answer.
        let _ = methods.send(request.method);

        origin_write.write_all(&remove_header(&head, "accept-encoding"))?;

        match request.framing {
            Framing::Chunked => pass_through_chunked(&mut reader, origin_write)?,
            Framing::Length(len) => pass_through_exact(&mut reader, origin_write, len)?,
            Framing::Unframed => {}
        }

        origin_write.flush()?;

        if request.upgrade {
            let bytes = io::copy(&mut reader, origin_write)?;
            trace!(target: "assetproxy", "Copied {} upgraded bytes client->origin for {}", bytes, peer_addr);
            return Ok(());
        }
    }
}

/// Proxy HTTP responses from origin to client, rewriting asset URLs in HTML
/// and CSS bodies.
fn proxy_responses<R: Read, W: Write>(
    origin_read: R,
    client_write: &mut W,
    engine: &RewriteEngine,
    methods: &Receiver<String>,
    peer_addr: SocketAddr,
) -> io::Result<()> {
    let mut reader = BufReader::new(origin_read);

    loop {
        let Some(head) = read_head(&mut reader)? else {
            return Ok(());
        };

        trace!(target: "assetproxy", "Response headers for {}: {}", peer_addr, printable_start_line(&head));

        let Some(response) = parse_response_head(&head) else {
            debug!(target: "assetproxy", "Unparseable response head for {}, switching to raw copy", peer_addr);
            client_write.write_all(&head)?;
            io::copy(&mut reader, client_write)?;
            return Ok(());
        };

        if response.status == 101 {
            client_write.write_all(&head)?;
            client_write.flush()?;
            let bytes = io::copy(&mut reader, client_write)?;
            trace!(target: "assetproxy", "Copied {} upgraded bytes origin->client for {}", bytes, peer_addr);
            return Ok(());
        }

        if (100..200).contains(&response.status) {
            client_write.write_all(&head)?;
            client_write.flush()?;
            continue;
        }

        let method = methods.recv().unwrap_or_else(|_| "GET".to_string());

        if method.eq_ignore_ascii_case("HEAD") || response.status == 204 || response.status == 304 {
            client_write.write_all(&head)?;
            client_write.flush()?;
            continue;
        }

        let oversized = matches!(response.framing, Framing::Length(len) if len > MAX_REWRITE_BODY);
        if oversized {
            debug!(target: "assetproxy", "Body for {} exceeds {} bytes, streaming it unchanged", peer_addr, MAX_REWRITE_BODY);
        }

        if !response.is_rewritable() || oversized {
            client_write.write_all(&head)?;

            match response.framing {
                Framing::Chunked => pass_through_chunked(&mut reader, client_write)?,
                Framing::Length(len) => pass_through_exact(&mut reader, client_write, len)?,
                Framing::Unframed => {
                    let bytes = io::copy(&mut reader, client_write)?;
                    trace!(target: "assetproxy", "Streamed {} bytes for {} (no Content-Length)", bytes, peer_addr);
                    return Ok(());
                }
            }

            client_write.flush()?;
            trace!(target: "assetproxy", "Proxied response for {} without rewriting", peer_addr);
            continue;
        }

        let body = match response.framing {
            Framing::Chunked => match read_chunked_body(&mut reader, MAX_REWRITE_BODY)? {
                ChunkedBody::Complete(body) => body,
                ChunkedBody::Oversized {
                    decoded,
                    size_line,
                    chunk_size,
                } => {
                    debug!(target: "assetproxy", "Chunked body for {} exceeds {} bytes, streaming it unchanged", peer_addr, MAX_REWRITE_BODY);
                    client_write.write_all(&head)?;
                    write_chunk(client_write, &decoded)?;
                    client_write.write_all(&size_line)?;
                    forward_chunk_data(&mut reader, client_write, chunk_size)?;
                    pass_through_chunked(&mut reader, client_write)?;
                    client_write.flush()?;
                    continue;
                }
            },
            Framing::Length(len) => {
                let mut body = vec![0u8; len];
                reader.read_exact(&mut body)?;
                body
            }
            Framing::Unframed => {
                let mut body = Vec::new();
                reader.by_ref().take(MAX_REWRITE_BODY as u64 + 1).read_to_end(&mut body)?;
                if body.len() > MAX_REWRITE_BODY {
                    debug!(target: "assetproxy", "Body for {} exceeds {} bytes, streaming it unchanged", peer_addr, MAX_REWRITE_BODY);
                    client_write.write_all(&head)?;
                    client_write.write_all(&body)?;
                    io::copy(&mut reader, client_write)?;
                    return Ok(());
                }
                body
            }
        };

        let content_type = response.content_type.as_deref().unwrap_or("");
        let rewritten = engine.rewrite(&body, content_type);

        match response.framing {
            Framing::Length(_) => {
                client_write.write_all(&update_content_length(&head, rewritten.len()))?;
                client_write.write_all(&rewritten)?;
            }
            Framing::Chunked => {
                client_write.write_all(&head)?;
                write_chunked_body(client_write, &rewritten)?;
            }
            Framing::Unframed => {
                client_write.write_all(&head)?;
                client_write.write_all(&rewritten)?;
            }
        }

        client_write.flush()?;

        trace!(target: "assetproxy", "Proxied response with URL rewriting for {} ({} -> {} bytes)",
               peer_addr, body.len(), rewritten.len());

        if response.framing == Framing::Unframed {
            return Ok(());
        }
    }
}
