//! Raw HTTP/1.1 relay over a tunnelled connection.
//!
//! Messages are copied byte for byte: the relay parses each head only to
//! find where the body ends, then forwards one request and one response at
//! a time.

use super::tunnel::TunnelError;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream,
};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Status line written to the client when the relay gives up.
pub const CANNOT_REACH_DESTINATION: &[u8] = b"HTTP/1.1 500 Cannot reach destination\r\n\r\n";

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Chunked,
    Length(u64),
    UntilEof,
}

#[derive(Debug)]
struct RequestHead {
    method: String,
    framing: BodyFraming,
    expect_continue: bool,
}

#[derive(Debug)]
struct ResponseHead {
    status: u16,
    framing: BodyFraming,
}

/// How a forwarded response left the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    /// The remote asked for the request body
    Continue,
    /// A final response went through; the next request may follow
    Complete,
    /// Upgraded or read to EOF; nothing more can be relayed
    Finished,
}

/// Relay HTTP exchanges between `client` and `target` until either side
/// stops. The client connection is shut down on every exit path.
pub async fn relay<C>(client: C, target: &str)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut client = BufStream::new(client);
    match relay_loop(&mut client, target).await {
        Ok(()) => debug!(destination = %target, "Relay finished"),
        Err(e) => {
            warn!(destination = %target, error = %e, "Relay aborted");
            if client.write_all(CANNOT_REACH_DESTINATION).await.is_ok() {
                let _ = client.flush().await;
            }
        }
    }
    let _ = client.shutdown().await;
}

async fn relay_loop<C>(client: &mut BufStream<C>, target: &str) -> Result<(), TunnelError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let remote = TcpStream::connect(target)
        .await
        .map_err(|source| TunnelError::Dial {
            target: target.to_string(),
            source,
        })?;
    let mut remote = BufStream::new(remote);

    loop {
        // Wait for the next request, but notice a remote that goes away
        let head = tokio::select! {
            head = read_head(client) => head?,
            idle = async { remote.fill_buf().await.map(|buf| buf.is_empty()) } => {
                return Err(match idle {
                    Ok(true) => TunnelError::RemoteClosed,
                    Ok(false) => TunnelError::UnexpectedData,
                    Err(e) => e.into(),
                });
            }
        };
        let Some(raw) = head else {
            return Ok(());
        };

        let request = parse_request(&raw)?;
        remote.write_all(&raw).await?;
        remote.flush().await?;

        if request.expect_continue && request.framing != BodyFraming::Empty {
            match forward_response(&mut remote, client, &request.method, true).await? {
                Exchange::Continue => {}
                // Answered before the body; the client may or may not send it
                Exchange::Complete | Exchange::Finished => return Ok(()),
            }
        }

        copy_body(client, &mut remote, request.framing).await?;
        remote.flush().await?;

        match forward_response(&mut remote, client, &request.method, false).await? {
            Exchange::Complete => {}
            Exchange::Continue | Exchange::Finished => return Ok(()),
        }
    }
}

/// Forward one response, including any interim ones, from `remote` to
/// `client`. With `stop_at_continue` a `100 Continue` ends the call.
async fn forward_response<R, C>(
    remote: &mut R,
    client: &mut C,
    method: &str,
    stop_at_continue: bool,
) -> Result<Exchange, TunnelError>
where
    R: AsyncBufRead + AsyncWrite + Unpin,
    C: AsyncBufRead + AsyncWrite + Unpin,
{
    loop {
        let raw = read_head(remote).await?.ok_or(TunnelError::RemoteClosed)?;
        let response = parse_response(&raw, method)?;
        client.write_all(&raw).await?;

        if response.status == 101 {
            client.flush().await?;
            tokio::io::copy_bidirectional(client, remote).await?;
            return Ok(Exchange::Finished);
        }
        if (100..200).contains(&response.status) {
            client.flush().await?;
            if stop_at_continue && response.status == 100 {
                return Ok(Exchange::Continue);
            }
            continue;
        }

        copy_body(remote, client, response.framing).await?;
        client.flush().await?;
        return Ok(if response.framing == BodyFraming::UntilEof {
            Exchange::Finished
        } else {
            Exchange::Complete
        });
    }
}

/// Read a message head up to and including the blank line.
///
/// Returns `None` on a clean EOF before the first byte.
async fn read_head<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TunnelError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let start = head.len();
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return if head.is_empty() {
                Ok(None)
            } else {
                Err(TunnelError::Truncated)
            };
        }

        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                // Stray CRLF between messages
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(TunnelError::HeadTooLarge);
        }
    }
}

fn parse_request(raw: &[u8]) -> Result<RequestHead, TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(raw)?.is_partial() {
        return Err(TunnelError::Truncated);
    }

    let framing = match body_framing(req.headers)? {
        Some(framing) => framing,
        None => BodyFraming::Empty,
    };
    let expect_continue = req.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("expect")
            && std::str::from_utf8(h.value)
                .is_ok_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    });
    Ok(RequestHead {
        method: req.method.unwrap_or("GET").to_string(),
        framing,
        expect_continue,
    })
}

fn parse_response(raw: &[u8], request_method: &str) -> Result<ResponseHead, TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    if res.parse(raw)?.is_partial() {
        return Err(TunnelError::Truncated);
    }

    let status = res.code.unwrap_or(500);
    let framing = if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        BodyFraming::Empty
    } else {
        body_framing(res.headers)?.unwrap_or(BodyFraming::UntilEof)
    };
    Ok(ResponseHead { status, framing })
}

/// Framing declared by the headers, chunked taking precedence.
fn body_framing(headers: &[httparse::Header<'_>]) -> Result<Option<BodyFraming>, TunnelError> {
    let mut length = None;
    for header in headers {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let chunked = std::str::from_utf8(header.value)
                .map(|v| {
                    v.rsplit(',')
                        .next()
                        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
                })
                .unwrap_or(false);
            if chunked {
                return Ok(Some(BodyFraming::Chunked));
            }
        } else if header.name.eq_ignore_ascii_case("content-length") {
            let value = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(TunnelError::InvalidContentLength)?;
            length = Some(BodyFraming::Length(value));
        }
    }
    Ok(length)
}

async fn copy_body<R, W>(reader: &mut R, writer: &mut W, framing: BodyFraming) -> Result<(), TunnelError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(()),
        BodyFraming::Length(n) => copy_exact(reader, writer, n).await,
        BodyFraming::UntilEof => {
            tokio::io::copy_buf(reader, writer).await?;
            Ok(())
        }
        BodyFraming::Chunked => copy_chunked(reader, writer).await,
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, n: u64) -> Result<(), TunnelError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy_buf(&mut reader.take(n), writer).await?;
    if copied < n {
        return Err(TunnelError::Truncated);
    }
    Ok(())
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<(), TunnelError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(TunnelError::Truncated);
        }
        writer.write_all(&line).await?;
        let size = chunk_size(&line)?;

        if size == 0 {
            // Trailers, terminated by an empty line
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    return Err(TunnelError::Truncated);
                }
                writer.write_all(&line).await?;
                if line == b"\r\n" || line == b"\n" {
                    return Ok(());
                }
            }
        }

        // Chunk data plus its trailing CRLF
        copy_exact(reader, writer, size + 2).await?;
    }
}

fn chunk_size(line: &[u8]) -> Result<u64, TunnelError> {
    let text = std::str::from_utf8(line).map_err(|_| TunnelError::InvalidChunk)?;
    let size = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| TunnelError::InvalidChunk)
}
