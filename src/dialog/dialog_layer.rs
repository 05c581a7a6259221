use super::dialog::ClientInviteDialog;
use super::DialogId;
use crate::message::Response;
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::random_sequence;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// The table of live client dialogs, keyed by
/// (Call-ID, local tag, remote tag).
///
/// A dialog enters the table under its early id (empty remote tag) and is
/// re-keyed once the confirming response supplies the remote tag.
#[derive(Clone)]
pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    pub(crate) inner: Arc<DialogLayerInner>,
}

pub(crate) struct DialogLayerInner {
    pub(crate) dialogs: RwLock<HashMap<DialogId, ClientInviteDialog>>,
    last_seq: AtomicU32,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        DialogLayer {
            endpoint,
            inner: Arc::new(DialogLayerInner {
                dialogs: RwLock::new(HashMap::new()),
                last_seq: AtomicU32::new(random_sequence()),
            }),
        }
    }

    pub fn increment_last_seq(&self) -> u32 {
        self.inner.last_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, dialog: ClientInviteDialog) {
        let id = dialog.id();
        debug!("dialog inserted: {}", id);
        self.inner.dialogs.write().unwrap().insert(id, dialog);
    }

    pub fn remove(&self, id: &DialogId) {
        debug!("dialog removed: {}", id);
        self.inner.dialogs.write().unwrap().remove(id);
    }

    /// Moves a dialog from its early key to the confirmed one.
    pub fn rekey(&self, old_id: &DialogId, dialog: ClientInviteDialog) {
        let mut dialogs = self.inner.dialogs.write().unwrap();
        dialogs.remove(old_id);
        dialogs.insert(dialog.id(), dialog);
    }

    pub fn get(&self, id: &DialogId) -> Option<ClientInviteDialog> {
        self.inner.dialogs.read().unwrap().get(id).cloned()
    }

    /// Finds the dialog a response belongs to: exact id first, then the
    /// early form without the remote tag.
    pub fn match_response(&self, resp: &Response) -> Option<ClientInviteDialog> {
        let id = DialogId::try_from(resp).ok()?;
        let dialogs = self.inner.dialogs.read().unwrap();
        if let Some(dialog) = dialogs.get(&id) {
            return Some(dialog.clone());
        }
        let early = DialogId {
            remote_tag: String::new(),
            ..id
        };
        dialogs.get(&early).cloned()
    }

    /// A dialog sharing Call-ID and local tag with `id` but bound to a
    /// different remote tag, the mark of a forked INVITE.
    pub fn find_sibling(&self, id: &DialogId) -> Option<ClientInviteDialog> {
        self.inner
            .dialogs
            .read()
            .unwrap()
            .iter()
            .find(|(key, _)| {
                key.call_id == id.call_id
                    && key.local_tag == id.local_tag
                    && key.remote_tag != id.remote_tag
            })
            .map(|(_, dialog)| dialog.clone())
    }

    /// Every dialog currently in the table.
    pub fn all(&self) -> Vec<ClientInviteDialog> {
        self.inner.dialogs.read().unwrap().values().cloned().collect()
    }
}
