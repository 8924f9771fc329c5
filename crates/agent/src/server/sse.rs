//! Per-session server-push channel.
//!
//! Delivers the same event kinds as the chat response over SSE, for clients
//! that consume the chat body separately or want events while no chat call
//! is in flight. A heartbeat goes out after the configured silence window.

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use std::convert::Infallible;
use std::time::Duration;

use crate::error::AgentResult;
use crate::events::SessionEventKind;
use crate::server::auth::{AuthedUser, authorize_session};
use crate::server::state::AppState;
use crate::stream::EventSubscriber;

pub async fn events(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(session_id): Path<String>,
) -> AgentResult<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>> {
    authorize_session(&state, &user, &session_id).await?;
    let subscriber = state.coordinator.subscribe(&session_id);
    let heartbeat = state.settings.stream.heartbeat();
    log::info!("push channel attached for session {}", session_id);
    Ok(Sse::new(event_stream(subscriber, heartbeat)))
}

fn event_stream(
    subscriber: EventSubscriber,
    heartbeat: Duration,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> {
    struct StreamState {
        subscriber: EventSubscriber,
        heartbeat: Duration,
        closed: bool,
    }

    let state = StreamState {
        subscriber,
        heartbeat,
        closed: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        if state.closed {
            return None;
        }
        loop {
            match tokio::time::timeout(state.heartbeat, state.subscriber.next()).await {
                Ok(Some(event)) => {
                    return Some((Ok(to_sse_event(&event.kind)), state));
                }
                Ok(None) => {
                    // Channel gone (session released); close the stream.
                    state.closed = true;
                    return None;
                }
                Err(_) => {
                    let beat = SessionEventKind::Heartbeat {
                        timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
                    };
                    return Some((Ok(to_sse_event(&beat)), state));
                }
            }
        }
    })
}

fn to_sse_event(kind: &SessionEventKind) -> Event {
    let data = serde_json::to_string(kind).unwrap_or_else(|_| "{}".to_string());
    Event::default().data(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ContentPhase;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn forwards_events_and_heartbeats_on_silence() {
        let coordinator = crate::stream::StreamCoordinator::new(16);
        let subscriber = coordinator.subscribe("s1");
        let mut stream =
            Box::pin(event_stream(subscriber, Duration::from_millis(50)));

        coordinator.publish(
            "s1",
            SessionEventKind::Content {
                content: "hi".into(),
                phase: ContentPhase::Default,
            },
        );
        let first = stream.next().await.unwrap().unwrap();
        // Event carries the serialized kind.
        let _ = first;

        // No publishes: the next item is a heartbeat within ~the window.
        let second = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .expect("heartbeat within window")
            .unwrap()
            .unwrap();
        let _ = second;
    }

    #[tokio::test]
    async fn closes_when_session_channel_is_removed() {
        let coordinator = crate::stream::StreamCoordinator::new(16);
        let subscriber = coordinator.subscribe("s1");
        let mut stream = Box::pin(event_stream(subscriber, Duration::from_secs(30)));

        coordinator.remove_session("s1");
        let next = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .expect("stream should close promptly");
        assert!(next.is_none());
    }
}
