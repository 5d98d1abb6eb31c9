use axum::extract::ws::{Message, WebSocket};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};

use crate::{
    delivery::{EventReceiver, SessionGuard},
    error::ChatError,
    models::{ClientEvent, ParticipantId, ServerEvent},
    state::AppState,
};

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            tracing::error!("Failed to serialize event: {}", e);
            Ok(())
        }
    }
}

/// Drive one chat session until either side hangs up or a force-disconnect aimed at it arrives.
///
/// `guard` owns the origin slot and the online-count entry; it is dropped when this function
/// returns, whichever way the connection ended.
pub async fn handle_websocket(
    socket: WebSocket,
    state: AppState,
    guard: SessionGuard,
    mut events: EventReceiver,
    participant: Option<ParticipantId>,
) {
    let session = guard.id();
    let engine = state.engine.clone();
    let (mut sender, mut receiver) = socket.split();

    let ready = ServerEvent::SessionReady {
        participant: participant
            .and_then(|id| engine.directory().get(id))
            .map(|p| p.public_view()),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    engine.welcome(session, participant);
    match participant {
        Some(id) => engine.broadcaster().authenticate(session, id),
        None => engine.broadcaster().send_to_session(
            session,
            &ServerEvent::OnlineCount {
                count: engine.broadcaster().online_count(),
            },
        ),
    }

    // Task 1: registry events → this client
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let closing = matches!(
                &event,
                ServerEvent::ForceDisconnect { target } if target.is_none() || *target == participant
            );
            if send_event(&mut sender, &event).await.is_err() {
                break;
            }
            if closing {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    });

    // Task 2: client frames → moderation engine
    let recv_engine = engine.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let result = match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => recv_engine.dispatch(participant, event).await,
                        Err(e) => {
                            tracing::debug!(session, "unparseable frame: {}", e);
                            Err(ChatError::Validation("Malformed request.".to_string()))
                        }
                    };
                    if let Err(err) = result {
                        recv_engine.broadcaster().send_to_session(
                            session,
                            &ServerEvent::PrivateNotice { text: err.notice() },
                        );
                    }
                }
                Message::Close(_) => {
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete (which means the connection is closed)
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
        },
    }

    drop(guard);
}
