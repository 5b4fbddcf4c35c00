use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::CacheError;
use crate::units::ByteSize;

struct HandleInner {
    key: String,
    size: ByteSize,
    payload: RwLock<Option<Arc<[u8]>>>,
}

/// Revocable reference to a cached asset payload.
///
/// Clones share one payload slot. The store releases the slot when the entry
/// is evicted, removed or cleared, after which every clone reports
/// [`CacheError::HandleReleased`].
#[derive(Clone)]
pub struct AssetHandle {
    inner: Arc<HandleInner>,
}

impl AssetHandle {
    pub(crate) fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        let size = ByteSize::from_usize(payload.len());
        Self {
            inner: Arc::new(HandleInner {
                key: key.into(),
                size,
                payload: RwLock::new(Some(Arc::from(payload))),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Payload size measured when the handle was created.
    pub fn size(&self) -> ByteSize {
        self.inner.size
    }

    pub fn is_released(&self) -> bool {
        self.inner.payload.read().is_none()
    }

    /// Borrow the payload bytes.
    pub fn bytes(&self) -> Result<Arc<[u8]>, CacheError> {
        self.inner
            .payload
            .read()
            .clone()
            .ok_or_else(|| CacheError::HandleReleased {
                key: self.inner.key.clone(),
            })
    }

    /// Drop the payload. Releasing twice is an error.
    pub(crate) fn release(&self) -> Result<ByteSize, CacheError> {
        match self.inner.payload.write().take() {
            Some(_) => Ok(self.inner.size),
            None => Err(CacheError::HandleReleased {
                key: self.inner.key.clone(),
            }),
        }
    }

    /// Whether two handles share the same payload slot.
    pub fn same_as(&self, other: &AssetHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for AssetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetHandle")
            .field("key", &self.inner.key)
            .field("size", &self.inner.size)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_invalidates_every_clone() {
        let handle = AssetHandle::new("img", vec![1, 2, 3]);
        let clone = handle.clone();
        assert_eq!(&*clone.bytes().unwrap(), &[1, 2, 3]);

        assert_eq!(handle.release().unwrap(), ByteSize::from_bytes(3));
        assert!(clone.is_released());
        assert!(matches!(
            clone.bytes(),
            Err(CacheError::HandleReleased { ref key }) if key == "img"
        ));
    }

    #[test]
    fn double_release_is_reported() {
        let handle = AssetHandle::new("img", vec![0; 8]);
        handle.release().unwrap();
        assert!(matches!(
            handle.release(),
            Err(CacheError::HandleReleased { .. })
        ));
    }

    #[test]
    fn clones_share_identity() {
        let a = AssetHandle::new("img", vec![]);
        let b = AssetHandle::new("img", vec![]);
        assert!(a.same_as(&a.clone()));
        assert!(!a.same_as(&b));
    }
}
