//! 证据 blob 存储 (内容寻址)
//!
//! 地址 = BLAKE3(字节)。`put` 幂等：同样的字节只存一份。

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::PersistenceError;
use crate::evidence::ContentAddress;

pub trait BlobStore: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<ContentAddress, PersistenceError>;

    fn get(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, PersistenceError>;
}

/// sled 树 `evidence_blobs`
pub struct SledBlobStore {
    tree: sled::Tree,
}

impl SledBlobStore {
    pub fn open(db: &sled::Db) -> Result<Self, PersistenceError> {
        let tree = db
            .open_tree("evidence_blobs")
            .map_err(|e| PersistenceError::Blob(e.to_string()))?;
        Ok(Self { tree })
    }
}

impl BlobStore for SledBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<ContentAddress, PersistenceError> {
        let address = ContentAddress::of(bytes);
        // 已存在则不覆盖 (CAS 失败说明同一地址已有内容)
        let _existing = self
            .tree
            .compare_and_swap(address.0, None as Option<&[u8]>, Some(bytes))
            .map_err(|e| PersistenceError::Blob(e.to_string()))?;
        Ok(address)
    }

    fn get(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, PersistenceError> {
        let value = self
            .tree
            .get(address.0)
            .map_err(|e| PersistenceError::Blob(e.to_string()))?;
        Ok(value.map(|v| v.to_vec()))
    }
}

/// 内存实现，测试和临时运行用
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<ContentAddress, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 直接改写某个地址下的字节 (模拟存储层被篡改)
    pub fn overwrite(&self, address: ContentAddress, bytes: Vec<u8>) {
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, bytes);
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<ContentAddress, PersistenceError> {
        let address = ContentAddress::of(bytes);
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address)
            .or_insert_with(|| bytes.to_vec());
        Ok(address)
    }

    fn get(&self, address: &ContentAddress) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned())
    }
}
