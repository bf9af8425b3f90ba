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

//! [`/ipfs/ping/1.0.0`](https://github.com/libp2p/specs/blob/master/ping/ping.md) implementation.

use crate::{connection::Connection, error::Error, registrar::StreamHandler};

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::ipfs::ping";

/// IPFS ping protocol name.
pub const PROTOCOL_NAME: &str = "/ipfs/ping/1.0.0";

/// Size of a ping payload.
const PING_SIZE: usize = 32;

/// Timeout of one ping round-trip.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Handler echoing ping payloads until the remote closes the stream.
pub(crate) fn handler() -> StreamHandler {
    Arc::new(|mut stream, connection| {
        Box::pin(async move {
            let mut payload = [0u8; PING_SIZE];

            loop {
                match stream.read_exact(&mut payload).await {
                    Ok(_) => {}
                    // Clean shutdown of the remote write half.
                    Err(_) => break,
                }

                if let Err(error) = stream.write_all(&payload).await {
                    tracing::trace!(
                        target: LOG_TARGET,
                        peer = ?connection.peer(),
                        ?error,
                        "failed to echo ping payload",
                    );
                    break;
                }
            }

            let _ = stream.close().await;
        })
    })
}

/// Measure the round-trip time to the remote of `connection`.
pub(crate) async fn ping(connection: &Arc<Connection>) -> crate::Result<Duration> {
    let mut stream = connection.new_stream(&[PROTOCOL_NAME.into()]).await?;

    let mut payload = [0u8; PING_SIZE];
    rand::thread_rng().fill_bytes(&mut payload);

    let round_trip = async {
        stream.write_all(&payload).await?;
        stream.flush().await?;
        let started = Instant::now();

        let mut echoed = [0u8; PING_SIZE];
        stream.read_exact(&mut echoed).await.map_err(|_| Error::ConnectionEnded)?;

        if echoed != payload {
            return Err(Error::InvalidMessage("ping payload mismatch".to_string()));
        }

        Ok(started.elapsed())
    };

    let elapsed = match tokio::time::timeout(PING_TIMEOUT, round_trip).await {
        Ok(Ok(elapsed)) => elapsed,
        Ok(Err(error)) => {
            stream.reset();
            return Err(error);
        }
        Err(_) => {
            stream.reset();
            return Err(Error::Timeout);
        }
    };

    tracing::trace!(
        target: LOG_TARGET,
        peer = ?connection.peer(),
        ?elapsed,
        "ping round-trip measured",
    );

    let _ = stream.close().await;
    Ok(elapsed)
}
