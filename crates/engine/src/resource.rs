//! Decoded resources and their acquisition accounting
//!
//! A decoded payload is wrapped in an [`EngineResource`] owned by the
//! coordination context. Consumers hold [`ResourceHandle`]s; every handle
//! stands for exactly one acquisition and gives it back when dropped.

use crate::arena::Index;
use crate::buffer::BufferPool;
use crate::engine::Message;
use crate::key::RequestKey;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// A decoded value the engine can cache and hand out
pub trait Resource: Any + Send + Sync {
    /// Approximate memory footprint in bytes
    fn size(&self) -> usize;

    /// Return native memory to whatever free list it came from
    fn recycle(self: Box<Self>) {}

    /// Access the concrete value for downcasting
    fn as_any(&self) -> &dyn Any;
}

/// Where a delivered resource came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSource {
    /// Read from local storage
    Local,
    /// Fetched from a remote origin
    Remote,
    /// Decoded from unmodified source bytes in the disk cache
    DataDiskCache,
    /// Decoded from a transformed resource in the disk cache
    ResourceDiskCache,
    /// Served from the active set or the memory cache
    MemoryCache,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::DataDiskCache => "data-disk-cache",
            Self::ResourceDiskCache => "resource-disk-cache",
            Self::MemoryCache => "memory-cache",
        };
        f.write_str(name)
    }
}

/// Arena index of a live [`EngineResource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub(crate) Index);

type Payload = Arc<Box<dyn Resource>>;

/// Outcome of giving back an acquisition
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Other acquisitions remain
    Held,
    /// The count just reached zero
    Idle,
}

/// A resource together with its acquisition count
pub struct EngineResource {
    key: RequestKey,
    payload: Payload,
    cacheable: bool,
    acquired: usize,
}

impl EngineResource {
    /// Wrap a decoded payload with a zero acquisition count
    #[must_use]
    pub fn new(key: RequestKey, resource: Box<dyn Resource>, cacheable: bool) -> Self {
        Self {
            key,
            payload: Arc::new(resource),
            cacheable,
            acquired: 0,
        }
    }

    /// Key the resource was loaded for
    #[must_use]
    pub const fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Whether the resource may enter the memory cache when idle
    #[must_use]
    pub const fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Number of outstanding acquisitions
    #[must_use]
    pub const fn acquired(&self) -> usize {
        self.acquired
    }

    /// Footprint reported by the payload
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.size()
    }

    /// Borrow the payload
    #[must_use]
    pub fn get(&self) -> &dyn Resource {
        self.payload.as_ref().as_ref()
    }

    /// Record one more holder
    pub fn acquire(&mut self) {
        self.acquired += 1;
    }

    /// Give back one acquisition
    ///
    /// # Panics
    ///
    /// Panics if the resource is not acquired.
    pub fn release(&mut self) -> Released {
        assert!(
            self.acquired > 0,
            "released {} more times than it was acquired",
            self.key
        );
        self.acquired -= 1;
        if self.acquired == 0 {
            Released::Idle
        } else {
            Released::Held
        }
    }

    /// Destroy the resource and return its memory
    ///
    /// # Panics
    ///
    /// Panics if the resource is still acquired or a handle still shares
    /// the payload.
    pub fn recycle(self) {
        assert!(
            self.acquired == 0,
            "recycled {} while acquired {} times",
            self.key,
            self.acquired
        );
        let payload = Arc::try_unwrap(self.payload);
        assert!(
            payload.is_ok(),
            "recycled {} while a handle still shares it",
            self.key
        );
        if let Ok(resource) = payload {
            resource.recycle();
        }
    }

    pub(crate) fn share(&self) -> Payload {
        Arc::clone(&self.payload)
    }
}

impl fmt::Debug for EngineResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineResource")
            .field("key", &self.key)
            .field("size", &self.size())
            .field("cacheable", &self.cacheable)
            .field("acquired", &self.acquired)
            .finish()
    }
}

/// Consumer-side strong reference to a loaded resource
///
/// Dropping the handle posts a release to the coordination context. The
/// payload reference is dropped first so the context sees a unique payload
/// when the count reaches zero.
pub struct ResourceHandle {
    key: RequestKey,
    id: ResourceId,
    payload: Option<Payload>,
    outbox: Option<UnboundedSender<Message>>,
}

impl ResourceHandle {
    pub(crate) fn new(
        key: RequestKey,
        id: ResourceId,
        payload: Payload,
        outbox: UnboundedSender<Message>,
    ) -> Self {
        Self {
            key,
            id,
            payload: Some(payload),
            outbox: Some(outbox),
        }
    }

    /// Key the resource was loaded for
    #[must_use]
    pub const fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Identifier of the underlying engine resource
    #[must_use]
    pub const fn id(&self) -> ResourceId {
        self.id
    }

    /// Borrow the payload
    #[must_use]
    pub fn get(&self) -> &dyn Resource {
        match &self.payload {
            Some(payload) => payload.as_ref().as_ref(),
            None => &EMPTY,
        }
    }

    /// Borrow the payload as a concrete type
    #[must_use]
    pub fn downcast_ref<T: Resource>(&self) -> Option<&T> {
        self.get().as_any().downcast_ref::<T>()
    }

    /// Footprint reported by the payload
    #[must_use]
    pub fn size(&self) -> usize {
        self.get().size()
    }

    /// Drop the payload reference without posting a release
    pub(crate) fn disarm(mut self) -> ResourceId {
        self.payload = None;
        self.outbox = None;
        self.id
    }
}

struct Empty;

impl Resource for Empty {
    fn size(&self) -> usize {
        0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

static EMPTY: Empty = Empty;

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.payload = None;
        if let Some(outbox) = self.outbox.take() {
            // Sending only fails once the engine and its arena are gone.
            let _ = outbox.send(Message::Release { resource: self.id });
        }
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("size", &self.size())
            .finish()
    }
}

/// Byte array resource whose buffer returns to a [`BufferPool`]
pub struct BytesResource {
    bytes: Vec<u8>,
    pool: Option<Arc<BufferPool>>,
}

impl BytesResource {
    /// Wrap bytes that are freed normally
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, pool: None }
    }

    /// Wrap bytes that go back to `pool` when recycled
    #[must_use]
    pub const fn pooled(bytes: Vec<u8>, pool: Arc<BufferPool>) -> Self {
        Self {
            bytes,
            pool: Some(pool),
        }
    }

    /// The wrapped bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Resource for BytesResource {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn recycle(self: Box<Self>) {
        let Self { bytes, pool } = *self;
        if let Some(pool) = pool {
            pool.put(bytes);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for BytesResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesResource")
            .field("len", &self.bytes.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Model;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted {
        size: usize,
        recycled: Arc<AtomicUsize>,
    }

    impl Resource for Counted {
        fn size(&self) -> usize {
            self.size
        }

        fn recycle(self: Box<Self>) {
            self.recycled.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn key() -> RequestKey {
        RequestKey::builder(Model::Url("https://example.com/a.png".into())).build()
    }

    fn counted(recycled: &Arc<AtomicUsize>) -> EngineResource {
        EngineResource::new(
            key(),
            Box::new(Counted {
                size: 10,
                recycled: Arc::clone(recycled),
            }),
            true,
        )
    }

    #[test]
    fn test_release_reports_idle_once() {
        let recycled = Arc::new(AtomicUsize::new(0));
        let mut resource = counted(&recycled);
        resource.acquire();
        resource.acquire();
        assert_eq!(resource.release(), Released::Held);
        assert_eq!(resource.release(), Released::Idle);
        assert_eq!(resource.acquired(), 0);
        resource.recycle();
        assert_eq!(recycled.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "more times than it was acquired")]
    fn test_release_without_acquire_panics() {
        let recycled = Arc::new(AtomicUsize::new(0));
        let mut resource = counted(&recycled);
        let _ = resource.release();
    }

    #[test]
    #[should_panic(expected = "while acquired")]
    fn test_recycle_while_acquired_panics() {
        let recycled = Arc::new(AtomicUsize::new(0));
        let mut resource = counted(&recycled);
        resource.acquire();
        resource.recycle();
    }

    #[test]
    #[should_panic(expected = "still shares")]
    fn test_recycle_while_shared_panics() {
        let recycled = Arc::new(AtomicUsize::new(0));
        let resource = counted(&recycled);
        let _shared = resource.share();
        resource.recycle();
    }

    #[test]
    fn test_bytes_resource_returns_buffer() {
        let pool = Arc::new(BufferPool::new(1024));
        let mut buffer = pool.get(64);
        buffer.extend_from_slice(b"pixels");
        let resource: Box<dyn Resource> = Box::new(BytesResource::pooled(buffer, Arc::clone(&pool)));
        assert_eq!(resource.size(), 6);
        assert_eq!(
            resource
                .as_any()
                .downcast_ref::<BytesResource>()
                .map(BytesResource::as_bytes),
            Some(&b"pixels"[..])
        );
        resource.recycle();
        assert!(pool.current_bytes() >= 64);
    }

    #[test]
    fn test_dropped_handle_posts_release() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let recycled = Arc::new(AtomicUsize::new(0));
        let resource = counted(&recycled);
        let id = ResourceId(crate::arena::Arena::new().insert(()));
        let handle = ResourceHandle::new(key(), id, resource.share(), tx);
        assert_eq!(handle.size(), 10);
        assert!(handle.downcast_ref::<Counted>().is_some());
        drop(handle);

        match rx.try_recv() {
            Ok(Message::Release { resource: released }) => assert_eq!(released, id),
            _ => panic!("expected a release message"),
        }
        resource.recycle();
        assert_eq!(recycled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarmed_handle_posts_nothing() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let recycled = Arc::new(AtomicUsize::new(0));
        let resource = counted(&recycled);
        let id = ResourceId(crate::arena::Arena::new().insert(()));
        let handle = ResourceHandle::new(key(), id, resource.share(), tx);
        assert_eq!(handle.disarm(), id);
        assert!(rx.try_recv().is_err());
        resource.recycle();
    }
}
