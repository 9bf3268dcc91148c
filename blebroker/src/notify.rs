use std::collections::HashMap;

use log::{debug, trace};
use tokio::sync::mpsc;

use crate::AttributeHandle;

/// Per-connection map from characteristic handle to the stream that receives
/// its value-changed events.
///
/// There's at most one recipient per characteristic: subscribing again
/// replaces (and so ends) the previous stream.
#[derive(Debug, Default)]
pub(crate) struct NotificationRegistry {
    recipients: HashMap<AttributeHandle, mpsc::UnboundedSender<Vec<u8>>>,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, characteristic: AttributeHandle, tx: mpsc::UnboundedSender<Vec<u8>>) {
        if self.recipients.insert(characteristic, tx).is_some() {
            debug!("Replaced notification recipient for characteristic {}", characteristic);
        }
    }

    /// Returns whether there was a recipient to remove
    pub fn unsubscribe(&mut self, characteristic: AttributeHandle) -> bool {
        self.recipients.remove(&characteristic).is_some()
    }

    #[cfg(test)]
    pub fn is_subscribed(&self, characteristic: AttributeHandle) -> bool {
        self.recipients.contains_key(&characteristic)
    }

    /// Pushes `value` to the characteristic's recipient, if any. A recipient
    /// whose stream has been dropped is forgotten.
    pub fn deliver(&mut self, characteristic: AttributeHandle, value: Vec<u8>) {
        match self.recipients.get(&characteristic) {
            Some(tx) => {
                if tx.send(value).is_err() {
                    debug!("Notification stream for characteristic {} was dropped", characteristic);
                    self.recipients.remove(&characteristic);
                }
            }
            None => {
                trace!("Ignoring value change for unsubscribed characteristic {}", characteristic);
            }
        }
    }

    /// Forgets every recipient, ending their streams
    pub fn clear(&mut self) {
        self.recipients.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.recipients.len()
    }
}
