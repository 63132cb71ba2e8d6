use std::{collections::HashMap, sync::Mutex};

use proto::DeviceServerMessage;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[derive(Clone)]
pub struct DeviceSession {
    session_id: Uuid,
    sender: UnboundedSender<DeviceServerMessage>,
}

impl DeviceSession {
    pub fn new(sender: UnboundedSender<DeviceServerMessage>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn push(&self, message: DeviceServerMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    sessions: Mutex<HashMap<String, DeviceSession>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device_id: &str, session: DeviceSession) {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        sessions.insert(device_id.to_string(), session);
    }

    pub fn lookup(&self, device_id: &str) -> Option<DeviceSession> {
        let sessions = self.sessions.lock().expect("registry lock poisoned");
        sessions.get(device_id).cloned()
    }

    // Removes every binding that points at the session, not just one:
    // re-registration can leave it bound under more than one device id.
    pub fn unregister_session(&self, session_id: Uuid) -> Vec<String> {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        let removed: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.session_id() == session_id)
            .map(|(device_id, _)| device_id.clone())
            .collect();
        for device_id in &removed {
            sessions.remove(device_id);
        }
        removed
    }

    pub fn connected(&self) -> usize {
        self.sessions.lock().expect("registry lock poisoned").len()
    }
}
