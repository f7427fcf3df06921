//! Resource watchers.

use std::{
    marker::PhantomData,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::mpsc;

use super::{resources::ResourceValue, Resource, ResourceType, SubscriptionUpdate};

/// Events delivered to resource watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent<T> {
    /// The resource was added or changed.
    Changed(Arc<T>),

    /// The server sent an invalid version of the resource, or the client
    /// couldn't reach the server. Any previously delivered value is still
    /// the latest valid one.
    Error(String),

    /// The resource does not exist. Either the server didn't send it before
    /// the resource timeout, or it was deleted.
    DoesNotExist,
}

impl ResourceEvent<ResourceValue> {
    pub(crate) fn downcast<T: Resource>(self) -> Option<ResourceEvent<T>> {
        match self {
            ResourceEvent::Changed(value) => T::from_value(&value).map(ResourceEvent::Changed),
            ResourceEvent::Error(e) => Some(ResourceEvent::Error(e)),
            ResourceEvent::DoesNotExist => Some(ResourceEvent::DoesNotExist),
        }
    }
}

/// A unique id for a single watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct WatcherId(u64);

impl WatcherId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A resource event tagged with the resource it's for.
///
/// Every watch registered with the same sender delivers events to the same
/// channel, so a single task can watch many resources at once.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WatchEvent {
    pub resource_type: ResourceType,
    pub name: String,
    pub event: ResourceEvent<ResourceValue>,
}

pub(crate) type WatchSender = mpsc::UnboundedSender<WatchEvent>;

/// An untyped watch registration. Dropping the handle removes the watch.
#[derive(Debug)]
pub(crate) struct WatchHandle {
    pub(crate) id: WatcherId,
    pub(crate) resource_type: ResourceType,
    pub(crate) name: String,
    pub(crate) subs: mpsc::UnboundedSender<SubscriptionUpdate>,
}

impl WatchHandle {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        // the ADS task may already be gone, which is fine.
        let _ = self.subs.send(SubscriptionUpdate::Unwatch {
            id: self.id,
            resource_type: self.resource_type,
            name: std::mem::take(&mut self.name),
        });
    }
}

/// A watcher for a single resource of type `T`.
///
/// Implements [Stream] to deliver [ResourceEvent]s. The first event for a
/// resource that's already cached is delivered immediately. Dropping the
/// watcher unsubscribes from the resource.
#[derive(Debug)]
pub struct ResourceWatcher<T> {
    handle: WatchHandle,
    events: mpsc::UnboundedReceiver<WatchEvent>,
    _type: PhantomData<T>,
}

impl<T: Resource> ResourceWatcher<T> {
    pub(crate) fn new(handle: WatchHandle, events: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self {
            handle,
            events,
            _type: PhantomData,
        }
    }

    /// The name of the watched resource, as sent to the server.
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Wait for the next event.
    pub async fn next_event(&mut self) -> Option<ResourceEvent<T>> {
        futures::StreamExt::next(self).await
    }
}

impl<T: Resource> Stream for ResourceWatcher<T> {
    type Item = ResourceEvent<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.events.poll_recv(cx) {
                Poll::Ready(Some(e)) => match e.event.downcast() {
                    Some(event) => return Poll::Ready(Some(event)),
                    // a value of the wrong type can't happen for a typed
                    // watch. skip it rather than ending the stream.
                    None => continue,
                },
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> Unpin for ResourceWatcher<T> {}
