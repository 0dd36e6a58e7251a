use std::sync::Arc;

use crate::dispatch::{DispatchTask, Dispatcher};
use crate::metrics;
use crate::protocol::{ImagePayload, Message, MessageType, StreamId};
use crate::session::{Lookup, SessionError, StreamRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// First frame of a new stream; its session creation was just queued.
    CreationQueued,
    /// Session creation is queued but the owning thread has not run it yet.
    CreationPending,
    Malformed,
    UnknownType,
    InvalidResolution,
    SubmitFailed,
    NoOutputYet,
    DecodeFailed,
    SessionReleased,
}

impl DropReason {
    pub fn label(self) -> &'static str {
        match self {
            DropReason::CreationQueued => "creation_queued",
            DropReason::CreationPending => "creation_pending",
            DropReason::Malformed => "malformed",
            DropReason::UnknownType => "unknown_type",
            DropReason::InvalidResolution => "invalid_resolution",
            DropReason::SubmitFailed => "submit_failed",
            DropReason::NoOutputYet => "no_output_yet",
            DropReason::DecodeFailed => "decode_failed",
            DropReason::SessionReleased => "session_released",
        }
    }
}

impl From<&SessionError> for DropReason {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::InvalidResolution(_) => DropReason::InvalidResolution,
            SessionError::SubmitFailed(_) => DropReason::SubmitFailed,
            SessionError::NoOutputYet => DropReason::NoOutputYet,
            SessionError::DecodeFailed(_) | SessionError::Open(_) => DropReason::DecodeFailed,
            SessionError::Released(_) => DropReason::SessionReleased,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A picture came out of the decoder and its upload was queued.
    Decoded { stream: StreamId },
    Dropped {
        stream: Option<StreamId>,
        reason: DropReason,
    },
    /// Accepted message kinds this receiver does not act on.
    Ignored(MessageType),
}

/// Sends each parsed message where it belongs. Runs on the network thread.
pub struct MessageRouter {
    registry: Arc<StreamRegistry>,
    dispatcher: Arc<Dispatcher<DispatchTask>>,
}

impl MessageRouter {
    pub fn new(registry: Arc<StreamRegistry>, dispatcher: Arc<Dispatcher<DispatchTask>>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    pub fn route(&self, message: Message) -> RouteOutcome {
        metrics::MESSAGES_RECEIVED
            .with_label_values(&[message.message_type.label()])
            .inc();

        let outcome = match message.message_type {
            MessageType::Image => self.route_image(&message),
            MessageType::Object | MessageType::Mesh => {
                tracing::debug!(
                    target: "beach_reel::router",
                    kind = message.message_type.label(),
                    len = message.payload.len(),
                    "message accepted without handler"
                );
                RouteOutcome::Ignored(message.message_type)
            }
            MessageType::Unknown(value) => {
                tracing::warn!(
                    target: "beach_reel::router",
                    message_type = value,
                    len = message.payload.len(),
                    "unknown message type; dropping"
                );
                RouteOutcome::Dropped {
                    stream: None,
                    reason: DropReason::UnknownType,
                }
            }
        };

        if let RouteOutcome::Dropped { reason, .. } = outcome {
            metrics::FRAMES_DROPPED
                .with_label_values(&[reason.label()])
                .inc();
        }
        outcome
    }

    fn route_image(&self, message: &Message) -> RouteOutcome {
        let image = match ImagePayload::parse(&message.payload) {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!(target: "beach_reel::router", error = %err, "malformed image payload");
                return RouteOutcome::Dropped {
                    stream: None,
                    reason: DropReason::Malformed,
                };
            }
        };
        let stream = image.stream_id;
        let resolution = image.resolution();
        let dropped = |reason| RouteOutcome::Dropped {
            stream: Some(stream),
            reason,
        };

        // Checked before lookup so a bad first frame never queues a session.
        let max_resolution = self.registry.max_resolution();
        if !resolution.fits_within(max_resolution) {
            tracing::warn!(
                target: "beach_reel::router",
                stream,
                %resolution,
                max = %max_resolution,
                "image with invalid resolution"
            );
            return dropped(DropReason::InvalidResolution);
        }

        let session = match self.registry.lookup_or_request(stream) {
            Lookup::Ready(session) => session,
            Lookup::Queued => {
                tracing::info!(
                    target: "beach_reel::router",
                    stream,
                    %resolution,
                    "new stream; queueing session creation"
                );
                self.dispatcher
                    .enqueue(DispatchTask::CreateSession { stream, resolution });
                return dropped(DropReason::CreationQueued);
            }
            Lookup::Pending => return dropped(DropReason::CreationPending),
            Lookup::Released => return dropped(DropReason::SessionReleased),
        };

        let result = session
            .lock()
            .process_frame(&image.compressed, resolution.width, resolution.height);
        match result {
            Ok(()) => RouteOutcome::Decoded { stream },
            Err(SessionError::NoOutputYet) => {
                tracing::trace!(target: "beach_reel::router", stream, "decoder warming up");
                dropped(DropReason::NoOutputYet)
            }
            Err(err) => {
                tracing::warn!(
                    target: "beach_reel::router",
                    stream,
                    reason = err.reason(),
                    error = %err,
                    "frame dropped"
                );
                dropped(DropReason::from(&err))
            }
        }
    }
}
