//! Lazy sources of addresses a sub-protocol wants the node to dial.
//!
//! A [`DialCandidates`] wraps a stream behind an async mutex. Clones share one
//! cursor: every address is handed out once, to whichever consumer pulls it
//! first, and the stream cannot be restarted. Stopping consumption is simply
//! not calling [`DialCandidates::next`] again.

use futures::stream::{self, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tandem_types::NodeAddr;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

type BoxAddrStream = Pin<Box<dyn Stream<Item = NodeAddr> + Send>>;

/// Shared, pull-based stream of dial candidates.
#[derive(Clone)]
pub struct DialCandidates {
    inner: Arc<Mutex<BoxAddrStream>>,
}

impl DialCandidates {
    pub fn from_stream(stream: impl Stream<Item = NodeAddr> + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::pin(stream))),
        }
    }

    /// A finite list of candidates.
    pub fn from_addrs<I>(addrs: I) -> Self
    where
        I: IntoIterator<Item = NodeAddr>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(addrs))
    }

    /// Push-style source. The stream ends once every sender is dropped.
    pub fn channel(capacity: usize) -> (mpsc::Sender<NodeAddr>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::from_stream(ReceiverStream::new(rx)))
    }

    /// Next candidate, or `None` once the source is exhausted.
    pub async fn next(&self) -> Option<NodeAddr> {
        let mut inner = self.inner.lock().await;
        inner.next().await
    }

    /// Fair round-robin merge of several sources. Ends when all of them end.
    pub fn mix(sources: impl IntoIterator<Item = DialCandidates>) -> Self {
        let streams = sources.into_iter().map(|source| {
            stream::unfold(source, |source| async move {
                let addr = source.next().await;
                addr.map(|addr| (addr, source))
            })
            .boxed()
        });
        Self::from_stream(stream::select_all(streams))
    }
}

impl fmt::Debug for DialCandidates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialCandidates").finish_non_exhaustive()
    }
}
