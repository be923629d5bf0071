//! SASL `EXTERNAL` handshake performed before any message is exchanged.

use std::fmt::Write as _;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const MAX_LINE: usize = 4096;

/// Effective uid of this process.
pub fn current_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

fn hex_encode(text: &str) -> String {
    text.bytes().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Authenticate as `uid`; returns the server GUID.
pub async fn authenticate<S>(stream: &mut S, uid: u32) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let auth = format!("\0AUTH EXTERNAL {}\r\n", hex_encode(&uid.to_string()));
    stream.write_all(auth.as_bytes()).await?;
    stream.flush().await?;

    let line = read_line(stream).await?;
    let guid = match line.split_once(' ') {
        Some(("OK", guid)) => guid.trim().to_owned(),
        _ if line == "OK" => String::new(),
        _ => {
            // best effort; the caller drops the stream anyway
            let _ = stream.write_all(b"CANCEL\r\n").await;
            return Err(Error::Auth(format!("server replied '{line}'")));
        }
    };

    stream.write_all(b"BEGIN\r\n").await?;
    stream.flush().await?;
    tracing::debug!(uid, guid = %guid, "bus authenticated");
    Ok(guid)
}

/// Read one `\r\n` terminated line, byte by byte so nothing after it is
/// consumed.
pub(crate) async fn read_line<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        line.push(byte);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return String::from_utf8(line)
                .map_err(|_| Error::Auth("non UTF-8 response line".into()));
        }
        if line.len() > MAX_LINE {
            return Err(Error::Auth("response line too long".into()));
        }
    }
}
