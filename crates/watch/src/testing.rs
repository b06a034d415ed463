//! A scripted transport for exercising the engines without sockets.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ibp_protocol::Message;
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context;

use crate::error::TransportError;
use crate::transport::{ServerTransport, Transport};

pub(crate) const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
pub(crate) const SPAN_ID: &str = "00f067aa0ba902b7";

/// A context whose active span carries [`TRACE_ID`] and [`SPAN_ID`].
pub(crate) fn sampled_context() -> Context {
    let span_context = SpanContext::new(
        TraceId::from_hex(TRACE_ID).unwrap(),
        SpanId::from_hex(SPAN_ID).unwrap(),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );
    Context::new().with_remote_span_context(span_context)
}

enum Incoming {
    Message(Message),
    Raw(String),
    Failure,
}

#[derive(Default)]
struct Script {
    incoming: Mutex<VecDeque<Incoming>>,
    sent: Mutex<Vec<Message>>,
    served: Mutex<Option<PathBuf>>,
    accepted: AtomicBool,
    refuse_accept: AtomicBool,
    closed: AtomicBool,
    recv_calls: AtomicUsize,
}

/// Replays queued messages on `recv` and records everything sent. Once the
/// queue runs dry `recv` reports the peer as gone.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTransport {
    script: Arc<Script>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let transport = Self::new();
        for message in messages {
            transport.push(message);
        }
        transport
    }

    pub(crate) fn push(&self, message: Message) -> &Self {
        self.queue(Incoming::Message(message))
    }

    /// Queues a payload that goes through the real decoder.
    pub(crate) fn push_raw(&self, raw: &str) -> &Self {
        self.queue(Incoming::Raw(raw.to_string()))
    }

    pub(crate) fn push_failure(&self) -> &Self {
        self.queue(Incoming::Failure)
    }

    pub(crate) fn refuse_accept(&self) {
        self.script.refuse_accept.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<Message> {
        self.script.sent.lock().unwrap().clone()
    }

    pub(crate) fn served_at(&self) -> Option<PathBuf> {
        self.script.served.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.script.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn recv_calls(&self) -> usize {
        self.script.recv_calls.load(Ordering::SeqCst)
    }

    fn queue(&self, incoming: Incoming) -> &Self {
        self.script.incoming.lock().unwrap().push_back(incoming);
        self
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotConnected);
        }
        self.script.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        self.script.recv_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.incoming.lock().unwrap().pop_front();
        match next {
            Some(Incoming::Message(message)) => Ok(message),
            Some(Incoming::Raw(raw)) => Ok(Message::decode(&raw)?),
            Some(Incoming::Failure) => {
                Err(TransportError::Io(io::Error::other("scripted failure")))
            }
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.script.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ServerTransport for ScriptedTransport {
    fn serve(&self, address: &Path) -> Result<(), TransportError> {
        *self.script.served.lock().unwrap() = Some(address.to_path_buf());
        Ok(())
    }

    async fn accept(&self) -> Result<(), TransportError> {
        if self.script.refuse_accept.load(Ordering::SeqCst) || self.is_closed() {
            return Err(TransportError::NotAccepted);
        }
        self.script.accepted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn has_connection(&self) -> bool {
        self.script.accepted.load(Ordering::SeqCst) && !self.is_closed()
    }
}
