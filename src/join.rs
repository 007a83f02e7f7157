//! Future types for gateway interactions.

use crate::{
    error::{JoinError, JoinResult},
    voice::VoiceCredentials,
};
use core::{
    convert,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use flume::r#async::RecvFut;
use pin_project::pin_project;
use tokio::time::{self, Timeout};

/// Future for a call to [`Client::join`].
///
/// This future `await`s the gateway's negotiation answers and, when a
/// backend is installed, its connection attempt, subject to any
/// timeout set in [`Config::join_timeout`].
///
/// [`Client::join`]: crate::Client::join
/// [`Config::join_timeout`]: crate::Config::join_timeout
#[pin_project]
pub struct Join {
    #[pin]
    inner: JoinClass,
}

impl Join {
    pub(crate) fn new(
        recv: RecvFut<'static, JoinResult<VoiceCredentials>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: match timeout {
                Some(t) => JoinClass::WithTimeout(time::timeout(t, recv)),
                None => JoinClass::Vanilla(recv),
            },
        }
    }
}

impl Future for Join {
    type Output = JoinResult<VoiceCredentials>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}

#[allow(clippy::large_enum_variant)]
#[pin_project(project = JoinClassProj)]
enum JoinClass {
    WithTimeout(#[pin] Timeout<RecvFut<'static, JoinResult<VoiceCredentials>>>),
    Vanilla(RecvFut<'static, JoinResult<VoiceCredentials>>),
}

impl Future for JoinClass {
    type Output = JoinResult<VoiceCredentials>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            JoinClassProj::WithTimeout(t) => t
                .poll(cx)
                .map_err(|_| JoinError::TimedOut)
                .map_ok(|res| res.map_err(|_| JoinError::Dropped).and_then(convert::identity))
                .map(|m| m.and_then(convert::identity)),
            JoinClassProj::Vanilla(t) => Pin::new(t)
                .poll(cx)
                .map_err(|_| JoinError::Dropped)
                .map(|m| m.and_then(convert::identity)),
        }
    }
}
