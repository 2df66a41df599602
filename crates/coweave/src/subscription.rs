//! Change notifications for CoValues.
//!
//! A [`Subscription`] yields the content of a CoValue once right away and
//! again after every change to it or to its owner group (a membership or key
//! change can change what this node may read). Changes that arrive while the
//! subscriber is busy are coalesced into one update.

use tokio::sync::watch;
use tracing::trace;

use coweave_core::{CoID, CoValueContent};

use crate::node::LocalNode;

/// Watches one CoValue. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    node: LocalNode,
    id: CoID,
    value: Option<watch::Receiver<u64>>,
    owner: Option<watch::Receiver<u64>>,
    primed: bool,
}

impl Subscription {
    pub(crate) fn new(node: LocalNode, id: CoID) -> Self {
        let value = node.registry().watch(&id);
        Self {
            node,
            id,
            value: Some(value),
            owner: None,
            primed: false,
        }
    }

    pub fn id(&self) -> CoID {
        self.id
    }

    /// The next content of the CoValue, or `None` once unsubscribed.
    ///
    /// The first call returns immediately if the CoValue is loaded. While it
    /// is not loaded (or not readable), calls wait for it to become so.
    pub async fn next(&mut self) -> Option<CoValueContent> {
        loop {
            let value = self.value.as_mut()?;
            if self.primed {
                let changed = match self.owner.as_mut() {
                    Some(owner) => tokio::select! {
                        r = value.changed() => r,
                        r = owner.changed() => r,
                    },
                    None => value.changed().await,
                };
                if changed.is_err() {
                    return None;
                }
            }
            self.primed = true;
            self.mark_seen();
            self.watch_owner();

            match self.node.content(&self.id) {
                Ok(content) => return Some(content),
                Err(e) => trace!(co_value = %self.id, error = %e, "no content yet"),
            }
        }
    }

    fn mark_seen(&mut self) {
        if let Some(value) = self.value.as_mut() {
            value.borrow_and_update();
        }
        if let Some(owner) = self.owner.as_mut() {
            owner.borrow_and_update();
        }
    }

    fn watch_owner(&mut self) {
        if self.owner.is_some() {
            return;
        }
        let owner = self
            .node
            .registry()
            .with_core(&self.id, |core| core.header().owner_group())
            .flatten();
        if let Some(group) = owner {
            let mut rx = self.node.registry().watch(&group);
            rx.borrow_and_update();
            self.owner = Some(rx);
        }
    }

    /// Stop receiving updates. Calling it again has no effect.
    pub fn unsubscribe(&mut self) {
        self.value = None;
        self.owner = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.value.is_some()
    }
}
