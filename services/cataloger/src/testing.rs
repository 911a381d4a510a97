//! In-memory stores for unit tests. Every call is appended to a shared
//! [`Journal`] so tests can assert the order stores were touched in.

use crate::document_store::{DocumentStore, DocumentStoreError};
use crate::locator::ImageLocator;
use crate::object_store::{object_key, ObjectStore, ObjectStoreError};
use crate::outcome::DeleteOutcome;
use crate::record::CatalogRecord;
use crate::search_index::{SearchDocument, SearchIndex, SearchIndexError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Position of the first entry starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub struct MemoryObjectStore {
    journal: Journal,
    objects: Mutex<HashSet<String>>,
    pub fail_deletes: AtomicBool,
    pub fail_presign: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            objects: Mutex::new(HashSet::new()),
            fail_deletes: AtomicBool::new(false),
            fail_presign: AtomicBool::new(false),
        }
    }

    fn key(image: &ImageLocator) -> String {
        format!("{}/{}", image.container(), image.blob_name())
    }

    pub fn put(&self, image: &ImageLocator) {
        self.objects.lock().unwrap().insert(Self::key(image));
    }

    pub fn contains(&self, image: &ImageLocator) -> bool {
        self.objects.lock().unwrap().contains(&Self::key(image))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload_image(
        &self,
        owner: &str,
        extension: &str,
        _bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<ImageLocator, ObjectStoreError> {
        let key = object_key(owner, Uuid::new_v4(), extension).ok_or_else(|| {
            ObjectStoreError::Upload {
                key: owner.to_string(),
                message: "invalid key segment".to_string(),
            }
        })?;
        let image = ImageLocator::from_parts("https://store", "uploads", &key);
        self.journal.record(format!("object.upload:{}", image.blob_name()));
        self.put(&image);
        Ok(image)
    }

    async fn delete(&self, image: &ImageLocator) -> Result<DeleteOutcome, ObjectStoreError> {
        self.journal.record(format!("object.delete:{}", image.blob_name()));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Delete {
                key: image.blob_name().to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(if self.objects.lock().unwrap().remove(&Self::key(image)) {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }

    async fn presigned_read_url(
        &self,
        image: &ImageLocator,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError> {
        self.journal.record(format!("object.presign:{}", image.blob_name()));
        if self.fail_presign.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Presign {
                key: image.blob_name().to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(format!("{image}?expires={}", expires_in.as_secs()))
    }
}

pub struct MemoryDocumentStore {
    journal: Journal,
    records: Mutex<HashMap<Uuid, CatalogRecord>>,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            records: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, record: CatalogRecord) {
        self.records.lock().unwrap().insert(record.id, record);
    }

    /// Raw access, expired records included
    pub fn stored(&self, id: Uuid) -> Option<CatalogRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn injected() -> DocumentStoreError {
        DocumentStoreError::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, record: &CatalogRecord) -> Result<bool, DocumentStoreError> {
        self.journal.record(format!("document.create:{}", record.id));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        if records.get(&record.id).is_some_and(|r| !r.is_expired(now)) {
            return Ok(false);
        }
        records.insert(record.id, record.clone());
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<CatalogRecord>, DocumentStoreError> {
        self.journal.record(format!("document.get:{id}"));
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        let now = Utc::now();
        Ok(self.stored(id).filter(|r| !r.is_expired(now)))
    }

    async fn delete(&self, id: Uuid) -> Result<DeleteOutcome, DocumentStoreError> {
        self.journal.record(format!("document.delete:{id}"));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        Ok(match self.records.lock().unwrap().remove(&id) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn find_by_owner_and_image(
        &self,
        owner: &str,
        fragment: &str,
    ) -> Result<Option<CatalogRecord>, DocumentStoreError> {
        let now = Utc::now();
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.user_id.as_deref() == Some(owner))
            .filter(|r| r.original_image_url.contains(fragment))
            .filter(|r| !r.is_expired(now))
            .max_by_key(|r| r.upload_timestamp)
            .cloned())
    }

    async fn purge_expired(&self) -> Result<u64, DocumentStoreError> {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok((before - records.len()) as u64)
    }

    async fn ping(&self) -> Result<(), DocumentStoreError> {
        Ok(())
    }
}

pub struct MemorySearchIndex {
    journal: Journal,
    documents: Mutex<HashMap<String, SearchDocument>>,
    pub fail_writes: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl MemorySearchIndex {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            documents: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<SearchDocument> {
        self.documents.lock().unwrap().get(&id.to_string()).cloned()
    }

    pub fn insert(&self, document: SearchDocument) {
        self.documents
            .lock()
            .unwrap()
            .insert(document.id.clone(), document);
    }

    fn injected() -> SearchIndexError {
        SearchIndexError::Status {
            status: 503,
            body: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn upsert(&self, document: &SearchDocument) -> Result<(), SearchIndexError> {
        self.journal.record(format!("index.upsert:{}", document.id));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.insert(document.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<DeleteOutcome, SearchIndexError> {
        self.journal.record(format!("index.delete:{id}"));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        Ok(match self.documents.lock().unwrap().remove(&id.to_string()) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }
}

/// The three stores wired to one journal
pub struct Stores {
    pub journal: Journal,
    pub objects: Arc<MemoryObjectStore>,
    pub documents: Arc<MemoryDocumentStore>,
    pub index: Arc<MemorySearchIndex>,
}

impl Stores {
    pub fn new() -> Self {
        let journal = Journal::default();
        Self {
            objects: Arc::new(MemoryObjectStore::new(journal.clone())),
            documents: Arc::new(MemoryDocumentStore::new(journal.clone())),
            index: Arc::new(MemorySearchIndex::new(journal.clone())),
            journal,
        }
    }
}
