use crate::backend::{Backend, BackendError};
use crate::dedup::SeenCache;
use crate::models::{
    Channel, ChannelEvent, ChannelLog, ChannelType, Contact, Direction, Msg, MsgStatus,
    StatusUpdate,
};
use crate::urns::Urn;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

/// What the backend would have fanned out to Redis. Recorded verbatim so
/// tests can assert exactly one hand-off per accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedTask {
    Legacy {
        task_name: String,
        org_id: i64,
        sub_queue: Option<String>,
    },
    Mailroom {
        task_type: String,
        org_id: i64,
        contact_id: i64,
    },
}

#[derive(Default)]
struct MockState {
    channels: Vec<Channel>,
    contacts: Vec<Contact>,
    urn_ids: HashMap<(i64, String), (i64, i64)>,
    msgs: Vec<Msg>,
    status_writes: Vec<StatusUpdate>,
    events: Vec<ChannelEvent>,
    logs: Vec<ChannelLog>,
    queued: Vec<QueuedTask>,
    outgoing: VecDeque<Msg>,
    completed: Vec<(i64, MsgStatus)>,
    next_id: i64,
}

/// In-memory stand-in for `DbBackend`. Same contract, no I/O; everything
/// written is kept for inspection.
pub struct MockBackend {
    state: Mutex<MockState>,
    seen: SeenCache,
    max_send_attempts: i32,
}

impl Default for MockBackend {
    fn default() -> Self {
        MockBackend::new()
    }
}

impl MockBackend {
    pub fn new() -> MockBackend {
        MockBackend {
            state: Mutex::new(MockState {
                next_id: 1,
                ..MockState::default()
            }),
            seen: SeenCache::new(100, Duration::from_secs(3600)),
            max_send_attempts: 3,
        }
    }

    pub fn add_channel(&self, channel: Channel) {
        self.state.lock().channels.push(channel);
    }

    pub fn add_outgoing_msg(&self, msg: Msg) {
        self.state.lock().outgoing.push_back(msg);
    }

    /// Register an outgoing message so a later ack by external id finds it.
    pub fn add_sent_msg(&self, msg: Msg) {
        self.state.lock().msgs.push(msg);
    }

    pub fn written_msgs(&self) -> Vec<Msg> {
        self.state.lock().msgs.clone()
    }

    pub fn status_writes(&self) -> Vec<StatusUpdate> {
        self.state.lock().status_writes.clone()
    }

    pub fn channel_events(&self) -> Vec<ChannelEvent> {
        self.state.lock().events.clone()
    }

    pub fn channel_logs(&self) -> Vec<ChannelLog> {
        self.state.lock().logs.clone()
    }

    pub fn queued_tasks(&self) -> Vec<QueuedTask> {
        self.state.lock().queued.clone()
    }

    pub fn completed(&self) -> Vec<(i64, MsgStatus)> {
        self.state.lock().completed.clone()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.state.lock().contacts.clone()
    }

    fn contact_for_urn(state: &mut MockState, org_id: i64, urn: &Urn, name: Option<&str>) -> (Contact, i64) {
        let key = (org_id, urn.to_string());
        if let Some(&(contact_id, urn_id)) = state.urn_ids.get(&key) {
            let contact = state
                .contacts
                .iter()
                .find(|c| c.id == contact_id)
                .cloned()
                .map(|mut c| {
                    c.is_new = false;
                    c
                })
                .unwrap_or(Contact {
                    id: contact_id,
                    org_id,
                    name: None,
                    urns: vec![urn.clone()],
                    is_new: false,
                });
            return (contact, urn_id);
        }

        let contact_id = state.next_id;
        let urn_id = state.next_id + 1;
        state.next_id += 2;
        let contact = Contact {
            id: contact_id,
            org_id,
            name: name.map(|n| n.to_string()),
            urns: vec![urn.clone()],
            is_new: true,
        };
        state.contacts.push(contact.clone());
        state.urn_ids.insert(key, (contact_id, urn_id));
        (contact, urn_id)
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn get_channel(
        &self,
        channel_type: &ChannelType,
        uuid: Uuid,
    ) -> Result<Channel, BackendError> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|c| c.uuid == uuid && &c.channel_type == channel_type)
            .cloned()
            .ok_or(BackendError::ChannelNotFound)
    }

    async fn write_msg(&self, msg: &mut Msg) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let channel = state
            .channels
            .iter()
            .find(|c| c.uuid == msg.channel_uuid)
            .cloned()
            .ok_or(BackendError::ChannelNotFound)?;
        let (contact, urn_id) =
            MockBackend::contact_for_urn(&mut state, msg.org_id, &msg.urn, msg.contact_name.as_deref());

        msg.id = state.next_id;
        state.next_id += 1;
        msg.contact_id = Some(contact.id);
        msg.contact_urn_id = Some(urn_id);
        state.msgs.push(msg.clone());

        if msg.direction == Direction::Incoming {
            let task = if channel.flow_server_enabled {
                QueuedTask::Mailroom {
                    task_type: "msg_event".to_string(),
                    org_id: channel.org_id,
                    contact_id: contact.id,
                }
            } else {
                QueuedTask::Legacy {
                    task_name: "handle_event_task".to_string(),
                    org_id: channel.org_id,
                    sub_queue: Some(format!("ch:{}", contact.id)),
                }
            };
            state.queued.push(task);
        }
        Ok(())
    }

    fn check_external_id_seen(&self, msg: &Msg) -> bool {
        match msg.external_id.as_deref() {
            Some(external_id) => self.seen.contains(msg.channel_uuid, external_id),
            None => false,
        }
    }

    fn write_external_id_seen(&self, msg: &Msg) {
        if let Some(external_id) = msg.external_id.as_deref() {
            self.seen.insert(msg.channel_uuid, external_id);
        }
    }

    async fn write_msg_status(&self, status: &StatusUpdate) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let found = match (status.msg_id, status.external_id.as_deref()) {
            (Some(msg_id), _) => state.msgs.iter_mut().find(|m| m.id == msg_id),
            (None, Some(external_id)) => state.msgs.iter_mut().find(|m| {
                m.channel_uuid == status.channel_uuid
                    && m.direction == Direction::Outgoing
                    && m.external_id.as_deref() == Some(external_id)
            }),
            (None, None) => None,
        };

        let msg = found.ok_or(BackendError::MsgNotFound)?;
        if !msg.status.is_regression(status.status) {
            msg.status = status.status;
        }
        state.status_writes.push(status.clone());
        Ok(())
    }

    async fn write_channel_event(&self, event: &mut ChannelEvent) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let channel = state
            .channels
            .iter()
            .find(|c| c.uuid == event.channel_uuid)
            .cloned()
            .ok_or(BackendError::ChannelNotFound)?;
        let (contact, urn_id) =
            MockBackend::contact_for_urn(&mut state, event.org_id, &event.urn, None);
        event.contact_id = Some(contact.id);
        event.contact_urn_id = Some(urn_id);
        state.events.push(event.clone());

        let task = if channel.flow_server_enabled {
            QueuedTask::Mailroom {
                task_type: crate::queue::mailroom_event_task_type(event.kind).to_string(),
                org_id: channel.org_id,
                contact_id: contact.id,
            }
        } else {
            QueuedTask::Legacy {
                task_name: "handle_event_task".to_string(),
                org_id: channel.org_id,
                sub_queue: None,
            }
        };
        state.queued.push(task);
        Ok(())
    }

    async fn write_channel_log(&self, log: &ChannelLog) -> Result<(), BackendError> {
        self.state.lock().logs.push(log.clone());
        Ok(())
    }

    async fn pop_next_outgoing_msg(&self) -> Result<Option<Msg>, BackendError> {
        Ok(self.state.lock().outgoing.pop_front())
    }

    async fn mark_outgoing_msg_complete(
        &self,
        msg: &Msg,
        status: &StatusUpdate,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let outcome = if status.status == MsgStatus::Errored {
            let attempts = msg.error_count + 1;
            if attempts >= self.max_send_attempts {
                MsgStatus::Failed
            } else {
                let mut retry = msg.clone();
                retry.error_count = attempts;
                retry.status = MsgStatus::Errored;
                state.outgoing.push_back(retry);
                MsgStatus::Errored
            }
        } else {
            status.status
        };
        state.completed.push((msg.id, outcome));
        Ok(())
    }
}
