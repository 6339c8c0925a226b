use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{ServiceError, ServiceResult};

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Error code surfaced when a join is refused by the transport.
pub const JOIN_REFUSED_CODE: i32 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Broadcaster,
    Audience,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    RemoteUserJoined(String),
    RemoteUserLeft(String),
    Error(i32),
    ConnectionStateChanged(ConnectionState),
}

/// Signaling + media channel. A client holds at most one join at a time.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn local_uid(&self) -> String;

    fn current_channel(&self) -> Option<String>;

    async fn join_channel(&self, token: &str, role: ChannelRole) -> ServiceResult<()>;

    async fn leave_channel(&self) -> ServiceResult<()>;

    async fn switch_camera(&self) -> ServiceResult<()>;

    async fn set_local_audio_muted(&self, muted: bool) -> ServiceResult<()>;

    async fn set_remote_audio_muted(&self, muted: bool) -> ServiceResult<()>;

    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

struct Member {
    uid: String,
    events: broadcast::Sender<TransportEvent>,
}

/// In-process stand-in for the media network. Clients created from the same
/// network see each other join and leave channels.
#[derive(Default)]
pub struct LoopbackNetwork {
    channels: RwLock<HashMap<String, Vec<Member>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>, uid: impl Into<String>) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            uid: uid.into(),
            network: Arc::clone(self),
            state: Mutex::new(ClientState::default()),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            failing_joins: AtomicUsize::new(0),
        })
    }

    pub fn members(&self, token: &str) -> Vec<String> {
        self.channels
            .read()
            .get(token)
            .map(|m| m.iter().map(|member| member.uid.clone()).collect())
            .unwrap_or_default()
    }

    fn attach(&self, token: &str, uid: &str, events: broadcast::Sender<TransportEvent>) {
        let mut guard = self.channels.write();
        let members = guard.entry(token.to_string()).or_default();
        for member in members.iter() {
            let _ = member
                .events
                .send(TransportEvent::RemoteUserJoined(uid.to_string()));
            let _ = events.send(TransportEvent::RemoteUserJoined(member.uid.clone()));
        }
        members.push(Member {
            uid: uid.to_string(),
            events,
        });
    }

    fn detach(&self, token: &str, uid: &str) {
        let mut guard = self.channels.write();
        let Some(members) = guard.get_mut(token) else {
            return;
        };
        members.retain(|m| m.uid != uid);
        for member in members.iter() {
            let _ = member
                .events
                .send(TransportEvent::RemoteUserLeft(uid.to_string()));
        }
        if members.is_empty() {
            guard.remove(token);
        }
    }
}

#[derive(Debug)]
struct ClientState {
    channel: Option<(String, ChannelRole)>,
    front_camera: bool,
    local_muted: bool,
    remote_muted: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            channel: None,
            front_camera: true,
            local_muted: false,
            remote_muted: false,
        }
    }
}

pub struct LoopbackTransport {
    uid: String,
    network: Arc<LoopbackNetwork>,
    state: Mutex<ClientState>,
    events: broadcast::Sender<TransportEvent>,
    failing_joins: AtomicUsize,
}

impl LoopbackTransport {
    /// Make the next `count` joins fail with a network error.
    pub fn fail_next_joins(&self, count: usize) {
        self.failing_joins.store(count, Ordering::SeqCst);
    }

    pub fn role(&self) -> Option<ChannelRole> {
        self.state.lock().channel.as_ref().map(|(_, role)| *role)
    }

    pub fn front_camera(&self) -> bool {
        self.state.lock().front_camera
    }

    pub fn local_muted(&self) -> bool {
        self.state.lock().local_muted
    }

    pub fn remote_muted(&self) -> bool {
        self.state.lock().remote_muted
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn take_failure(&self) -> bool {
        self.failing_joins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn local_uid(&self) -> String {
        self.uid.clone()
    }

    fn current_channel(&self) -> Option<String> {
        self.state.lock().channel.as_ref().map(|(token, _)| token.clone())
    }

    async fn join_channel(&self, token: &str, role: ChannelRole) -> ServiceResult<()> {
        {
            let mut state = self.state.lock();
            if let Some((current, _)) = &state.channel {
                return Err(ServiceError::AlreadyJoined(current.clone()));
            }
            self.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connecting));
            if self.take_failure() {
                self.emit(TransportEvent::Error(JOIN_REFUSED_CODE));
                self.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Failed));
                return Err(ServiceError::Network(format!(
                    "join refused for channel {token}"
                )));
            }
            state.channel = Some((token.to_string(), role));
        }
        self.network.attach(token, &self.uid, self.events.clone());
        self.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));
        debug!(target = "transport", uid = %self.uid, token, ?role, "joined channel");
        Ok(())
    }

    async fn leave_channel(&self) -> ServiceResult<()> {
        let (token, _) = self
            .state
            .lock()
            .channel
            .take()
            .ok_or(ServiceError::NotJoined)?;
        self.network.detach(&token, &self.uid);
        self.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        debug!(target = "transport", uid = %self.uid, token = %token, "left channel");
        Ok(())
    }

    async fn switch_camera(&self) -> ServiceResult<()> {
        let mut state = self.state.lock();
        if state.channel.is_none() {
            return Err(ServiceError::NotJoined);
        }
        state.front_camera = !state.front_camera;
        Ok(())
    }

    async fn set_local_audio_muted(&self, muted: bool) -> ServiceResult<()> {
        self.state.lock().local_muted = muted;
        Ok(())
    }

    async fn set_remote_audio_muted(&self, muted: bool) -> ServiceResult<()> {
        self.state.lock().remote_muted = muted;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peers_observe_join_and_leave() {
        let network = LoopbackNetwork::new();
        let host = network.client("host");
        let viewer = network.client("viewer");
        let mut host_events = host.events();

        host.join_channel("chan-1", ChannelRole::Broadcaster)
            .await
            .unwrap();
        viewer
            .join_channel("chan-1", ChannelRole::Audience)
            .await
            .unwrap();
        assert_eq!(network.members("chan-1"), vec!["host", "viewer"]);

        let mut seen = Vec::new();
        while let Ok(event) = host_events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&TransportEvent::RemoteUserJoined("viewer".into())));

        viewer.leave_channel().await.unwrap();
        assert_eq!(
            host_events.try_recv().unwrap(),
            TransportEvent::RemoteUserLeft("viewer".into())
        );
    }

    #[tokio::test]
    async fn only_one_outstanding_join() {
        let network = LoopbackNetwork::new();
        let client = network.client("u1");
        client
            .join_channel("a", ChannelRole::Audience)
            .await
            .unwrap();
        let err = client
            .join_channel("b", ChannelRole::Audience)
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::AlreadyJoined("a".into()));
        client.leave_channel().await.unwrap();
        assert_eq!(
            client.leave_channel().await.unwrap_err(),
            ServiceError::NotJoined
        );
    }

    #[tokio::test]
    async fn injected_join_failure_reports_error_event() {
        let network = LoopbackNetwork::new();
        let client = network.client("u1");
        let mut events = client.events();
        client.fail_next_joins(1);
        assert!(client
            .join_channel("a", ChannelRole::Broadcaster)
            .await
            .is_err());
        assert_eq!(client.current_channel(), None);
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&TransportEvent::Error(JOIN_REFUSED_CODE)));
        client
            .join_channel("a", ChannelRole::Broadcaster)
            .await
            .unwrap();
    }
}
