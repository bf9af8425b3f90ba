// Copyright 2024 meshp2p developers
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Varint-length-prefixed message framing.
//!
//! One-message protocols (identify, the security handshake) frame their
//! payloads as `unsigned-varint(len) || payload` over the stream.

use crate::error::Error;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read a single varint-length-prefixed message.
///
/// Fails with [`Error::InvalidMessage`] if the announced length exceeds
/// `max_size` and with [`Error::ConnectionEnded`] if the stream ends before a
/// complete message was read.
pub async fn read_length_prefixed<S>(io: &mut S, max_size: usize) -> crate::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = read_varint(io).await?;
    if len > max_size {
        return Err(Error::InvalidMessage(format!(
            "message of {len} bytes exceeds maximum of {max_size} bytes"
        )));
    }

    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await.map_err(|_| Error::ConnectionEnded)?;

    Ok(payload)
}

/// Write a single varint-length-prefixed message and flush.
pub async fn write_length_prefixed<S>(io: &mut S, payload: &[u8]) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buffer = unsigned_varint::encode::usize_buffer();
    io.write_all(unsigned_varint::encode::usize(payload.len(), &mut buffer)).await?;
    io.write_all(payload).await?;
    io.flush().await?;

    Ok(())
}

/// Read an unsigned varint, byte by byte.
///
/// Byte-wise reads keep the codec from consuming data that belongs to the
/// next protocol layered on the same stream.
pub(crate) async fn read_varint<S>(io: &mut S) -> crate::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut value = 0usize;
    let mut shift = 0u32;

    loop {
        let byte = io.read_u8().await.map_err(|_| Error::ConnectionEnded)?;

        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }

        shift += 7;
        if shift >= usize::BITS {
            return Err(Error::InvalidMessage("varint overflows usize".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (mut dialer, mut listener) = tokio::io::duplex(1024);

        write_length_prefixed(&mut dialer, b"identify payload").await.unwrap();
        let payload = read_length_prefixed(&mut listener, 1024).await.unwrap();

        assert_eq!(payload, b"identify payload");
    }

    #[tokio::test]
    async fn oversize_message_is_rejected() {
        let (mut dialer, mut listener) = tokio::io::duplex(1024);

        write_length_prefixed(&mut dialer, &[0u8; 512]).await.unwrap();

        match read_length_prefixed(&mut listener, 16).await {
            Err(Error::InvalidMessage(_)) => {}
            result => panic!("expected oversize rejection, got {result:?}"),
        }
    }

    #[tokio::test]
    async fn consecutive_messages_do_not_bleed() {
        let (mut dialer, mut listener) = tokio::io::duplex(1024);

        write_length_prefixed(&mut dialer, b"first").await.unwrap();
        write_length_prefixed(&mut dialer, b"second").await.unwrap();

        assert_eq!(read_length_prefixed(&mut listener, 64).await.unwrap(), b"first");
        assert_eq!(read_length_prefixed(&mut listener, 64).await.unwrap(), b"second");
    }
}
