//! Handshake, reader, heartbeat and reconnect tasks

use futures::FutureExt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{Connection, ConnectionState, ConnectFuture, Inner, ready_future};
use crate::error::{ChatFlowError, Result};
use crate::message::{HEARTBEAT_FRAME, parse_frame};
use crate::transport::{LinkEvent, OutboundFrame};

impl Connection {
    /// Start a handshake or join the one in flight
    ///
    /// `reconnecting` keeps the state at `Reconnecting` while the attempt
    /// runs instead of moving to `Connecting`.
    pub(super) fn begin_connect(&self, reconnecting: bool) -> ConnectFuture {
        let next_state = if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };

        let (future, changed) = {
            let mut core = self.inner.core.lock();
            match core.state {
                ConnectionState::Connected => return ready_future(Ok(())),
                ConnectionState::Closed => {
                    return ready_future(Err(ChatFlowError::connection_closed(format!(
                        "connection for session {} is closed",
                        self.inner.session_id
                    ))));
                }
                _ => {}
            }
            if let Some(pending) = &core.pending {
                return pending.clone();
            }

            // The handshake task blocks on this lock until `pending` is installed
            let handle = tokio::spawn(handshake(Arc::clone(&self.inner)));
            let future: ConnectFuture = async move {
                handle
                    .await
                    .unwrap_or_else(|e| Err(ChatFlowError::unknown(format!("connect task failed: {e}"))))
            }
            .boxed()
            .shared();
            core.pending = Some(future.clone());

            let changed = core.state != next_state;
            core.state = next_state;
            (future, changed)
        };

        if changed {
            self.inner.notify_state(next_state);
        }
        future
    }
}

/// Open one link and install it
async fn handshake(inner: Arc<Inner>) -> Result<()> {
    let opened = open_link(&inner).await;

    let mut core = inner.core.lock();
    core.pending = None;

    if core.state == ConnectionState::Closed {
        if let Ok(link) = opened {
            let _ = link.outbound.send(OutboundFrame::Close);
        }
        return Err(ChatFlowError::connection_closed(
            "connection closed during handshake",
        ));
    }

    match opened {
        Ok(link) => {
            core.generation += 1;
            let generation = core.generation;
            let token = CancellationToken::new();
            core.outbound = Some(link.outbound.clone());
            core.link_token = Some(token.clone());
            core.state = ConnectionState::Connected;

            core.track(tokio::spawn(read_loop(
                Arc::clone(&inner),
                link.inbound,
                generation,
                token.clone(),
            )));
            let interval = inner.config.heartbeat_interval;
            if !interval.is_zero() {
                core.track(tokio::spawn(heartbeat_loop(
                    Arc::clone(&inner),
                    link.outbound,
                    interval,
                    token,
                )));
            }
            drop(core);

            inner.attempts.store(0, Ordering::SeqCst);
            log::info!("[{}] connected to {}", inner.session_id, inner.config.url);
            inner.notify_state(ConnectionState::Connected);
            Ok(())
        }
        Err(err) => {
            let changed = core.state == ConnectionState::Connecting;
            if changed {
                core.state = ConnectionState::Disconnected;
            }
            drop(core);

            log::warn!("[{}] connect failed: {err}", inner.session_id);
            if changed {
                inner.notify_state(ConnectionState::Disconnected);
            }
            Err(err)
        }
    }
}

async fn open_link(inner: &Inner) -> Result<crate::transport::Link> {
    let url = inner.config.url.trim();
    if url.is_empty() {
        return Err(ChatFlowError::connection_failed("no server URL configured"));
    }
    let parsed = url::Url::parse(url)
        .map_err(|e| ChatFlowError::connection_failed(format!("invalid server URL {url}: {e}")))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(ChatFlowError::connection_failed(format!(
            "unsupported URL scheme {}",
            parsed.scheme()
        )));
    }

    log::debug!("[{}] opening link to {url}", inner.session_id);
    inner
        .connector
        .open(url, inner.config.handshake_timeout)
        .await
}

/// Decode inbound frames until the link closes or the token fires
async fn read_loop(
    inner: Arc<Inner>,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
    generation: u64,
    token: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            () = token.cancelled() => return,
            event = inbound.recv() => match event {
                Some(LinkEvent::Text(text)) => dispatch(&inner, &text),
                Some(LinkEvent::Closed(reason)) => break reason,
                None => break None,
            },
        }
    };
    on_link_closed(&inner, generation, reason);
}

fn dispatch(inner: &Inner, text: &str) {
    match parse_frame(text) {
        Ok(envelope) if envelope.is_heartbeat() => {
            log::trace!("[{}] heartbeat", inner.session_id);
        }
        Ok(envelope) => inner.notify_message(&envelope),
        Err(err) => {
            log::warn!("[{}] dropping undecodable frame: {err}", inner.session_id);
            inner.notify_error(&err);
        }
    }
}

/// Single path for every established link that goes away
fn on_link_closed(inner: &Arc<Inner>, generation: u64, reason: Option<String>) {
    let reconnect = {
        let mut core = inner.core.lock();
        if core.generation != generation || core.state != ConnectionState::Connected {
            return;
        }
        core.state = ConnectionState::Disconnected;
        core.outbound = None;
        if let Some(token) = core.link_token.take() {
            token.cancel();
        }
        inner.config.reconnect.enabled
    };

    log::warn!(
        "[{}] connection lost: {}",
        inner.session_id,
        reason.as_deref().unwrap_or("link closed")
    );
    inner.notify_state(ConnectionState::Disconnected);

    if reconnect {
        let mut core = inner.core.lock();
        if core.state == ConnectionState::Closed {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = core.reconnect_token.replace(token.clone()) {
            previous.cancel();
        }
        core.track(tokio::spawn(reconnect_loop(Arc::clone(inner), token)));
    }
}

async fn heartbeat_loop(
    inner: Arc<Inner>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = ticker.tick() => {
                if outbound.send(OutboundFrame::Text(HEARTBEAT_FRAME.to_string())).is_err() {
                    log::debug!("[{}] heartbeat stopped, link writer gone", inner.session_id);
                    return;
                }
            }
        }
    }
}

/// Retry the handshake with capped exponential backoff
async fn reconnect_loop(inner: Arc<Inner>, token: CancellationToken) {
    let policy = inner.config.reconnect.clone();
    let connection = Connection {
        inner: Arc::clone(&inner),
    };

    loop {
        let made = inner.attempts.load(Ordering::SeqCst);
        if !policy.allows(made) {
            {
                let mut core = inner.core.lock();
                if matches!(core.state, ConnectionState::Closed | ConnectionState::Connected) {
                    return;
                }
                core.state = ConnectionState::Disconnected;
                core.reconnect_token = None;
            }
            let err = ChatFlowError::connection_failed(format!(
                "reconnect attempts exhausted after {made} attempts"
            ));
            log::error!("[{}] {err}", inner.session_id);
            inner.notify_state(ConnectionState::Disconnected);
            inner.notify_error(&err);
            return;
        }

        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let announce = {
            let mut core = inner.core.lock();
            match core.state {
                ConnectionState::Closed | ConnectionState::Connected => return,
                ConnectionState::Reconnecting => false,
                _ => {
                    core.state = ConnectionState::Reconnecting;
                    true
                }
            }
        };
        if announce {
            inner.notify_state(ConnectionState::Reconnecting);
        }

        let delay = policy.delay(attempt);
        log::info!(
            "[{}] reconnect attempt {attempt} in {} ms",
            inner.session_id,
            delay.as_millis()
        );
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            () = token.cancelled() => return,
            result = connection.begin_connect(true) => result,
        };
        match result {
            Ok(()) => {
                log::info!("[{}] reconnected after {attempt} attempt(s)", inner.session_id);
                return;
            }
            Err(ChatFlowError::ConnectionClosed(_)) => return,
            Err(err) => {
                log::warn!("[{}] reconnect attempt {attempt} failed: {err}", inner.session_id);
            }
        }
    }
}
