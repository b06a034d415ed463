//! Connection handshakes: version negotiation, capabilities, and the
//! `SUBSCRIBE` exchange of protocol revisions that have it.
//!
//! Each step exists twice, once per role. The server drives the version step,
//! the client drives the other two.

use ibp_protocol::{
    select_version, Capabilities, CapabilityRequest, CapsMessage, Message, MessageBody,
    MessageKind, Negotiate, NegotiateResponse, ProtocolVersion, Subscribe,
};
use opentelemetry::Context;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::trace::trace_fields;
use crate::transport::Transport;

fn unexpected(expected: MessageKind, actual: &Message) -> ProtocolError {
    ProtocolError::UnexpectedMessage {
        expected,
        actual: actual.kind(),
    }
}

/// Server: offers `supported` and validates the client's pick.
pub(crate) async fn offer_versions<T: Transport + ?Sized>(
    transport: &T,
    supported: &[ProtocolVersion],
) -> Result<ProtocolVersion> {
    transport
        .send(&Message::negotiate(supported.to_vec()))
        .await?;

    let response = transport.recv().await?;
    let &MessageBody::NegotiateResponse(NegotiateResponse { version }) = &response.body else {
        return Err(unexpected(MessageKind::NegotiateResponse, &response));
    };

    if !supported.contains(&version) {
        return Err(ProtocolError::UnsupportedVersion {
            version,
            supported: supported.to_vec(),
        });
    }

    debug!(%version, "Negotiated protocol version");
    Ok(version)
}

/// Client: answers `NEGOTIATE` with the first offered version it supports.
pub(crate) async fn choose_version<T: Transport + ?Sized>(
    transport: &T,
    supported: &[ProtocolVersion],
) -> Result<ProtocolVersion> {
    let request = transport.recv().await?;
    let MessageBody::Negotiate(Negotiate { versions }) = &request.body else {
        return Err(unexpected(MessageKind::Negotiate, &request));
    };

    let version =
        select_version(versions, supported).ok_or_else(|| ProtocolError::NoCommonVersion {
            offered: versions.clone(),
            supported: supported.to_vec(),
        })?;

    transport
        .send(&Message::negotiate_response(version))
        .await?;

    debug!(%version, offered = ?versions, "Selected protocol version");
    Ok(version)
}

/// Server: reads the client's `CAPS`, canonicalizes it and echoes it back.
/// The response already carries trace ids when `otel` was just enabled.
pub(crate) async fn answer_capabilities<T: Transport + ?Sized>(
    transport: &T,
    cx: &Context,
) -> Result<Capabilities> {
    let request = transport.recv().await?;
    let MessageBody::Caps(CapsMessage { caps }) = &request.body else {
        return Err(unexpected(MessageKind::Caps, &request));
    };

    let caps = Capabilities::from_wire(Some(caps))?;

    let mut response = Message::caps_response(caps.to_wire());
    if caps.otel_enabled() {
        response = response.with_trace(trace_fields(cx));
    }
    transport.send(&response).await?;

    debug!(scopes = ?caps.scopes(), otel = caps.otel_enabled(), "Negotiated capabilities");
    Ok(caps)
}

/// Client: sends `CAPS` (even when nothing is requested) and stores the
/// server's canonical answer.
pub(crate) async fn request_capabilities<T: Transport + ?Sized>(
    transport: &T,
    request: &CapabilityRequest,
) -> Result<Capabilities> {
    transport.send(&Message::caps(request.to_wire())).await?;

    let response = transport.recv().await?;
    let MessageBody::CapsResponse(CapsMessage { caps }) = &response.body else {
        return Err(unexpected(MessageKind::CapsResponse, &response));
    };

    Ok(Capabilities::from_wire(Some(caps))?)
}

/// Server: waits for `SUBSCRIBE` and acknowledges it, returning the watch type.
pub(crate) async fn accept_subscription<T: Transport + ?Sized>(transport: &T) -> Result<String> {
    let request = transport.recv().await?;
    let MessageBody::Subscribe(Subscribe { watch_type }) = &request.body else {
        return Err(unexpected(MessageKind::Subscribe, &request));
    };

    transport.send(&Message::subscribe_response()).await?;
    debug!(%watch_type, "Client subscribed");
    Ok(watch_type.clone())
}

/// Client: subscribes to `watch_type` and waits for the acknowledgment.
pub(crate) async fn subscribe<T: Transport + ?Sized>(
    transport: &T,
    watch_type: &str,
) -> Result<()> {
    transport.send(&Message::subscribe(watch_type)).await?;

    let response = transport.recv().await?;
    if response.kind() != MessageKind::SubscribeResponse {
        return Err(unexpected(MessageKind::SubscribeResponse, &response));
    }
    Ok(())
}
