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

//! Pluggable spawning of the node's service loops.
//!
//! The node runs one long-lived loop per concern: connection-close
//! bookkeeping, inbound accepts and auto-dial. Each loop ends on its own
//! when the node's shutdown signal fires. A custom executor can pin the
//! loops to a dedicated runtime or wrap them with instrumentation.

use std::{future::Future, pin::Pin};

/// A boxed service-loop future.
pub type ServiceFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Interface for running the node's service loops.
pub trait Executor: Send + Sync {
    /// Run a service loop to completion in the background.
    ///
    /// `name` identifies the loop, e.g. `auto-dial-loop`; executors are free
    /// to ignore it.
    fn run(&self, name: &'static str, future: ServiceFuture);
}

/// Default executor: `tokio::spawn()` with the loop name attached as a
/// tracing span.
pub(crate) struct DefaultExecutor;

impl Executor for DefaultExecutor {
    fn run(&self, name: &'static str, future: ServiceFuture) {
        let span = tracing::debug_span!("service", name);
        let _ = tokio::spawn(tracing::Instrument::instrument(future, span));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_executor_drives_the_loop() {
        let (tx, rx) = tokio::sync::oneshot::channel();

        DefaultExecutor.run(
            "test-loop",
            Box::pin(async move {
                let _ = tx.send(());
            }),
        );

        rx.await.unwrap();
    }
}
