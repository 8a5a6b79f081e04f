//! Reference in-memory item store
//!
//! A small cache-shaped store that can be scanned by the snapshot engine and
//! rebuilt by the replayer. It exists so the subsystem can run end to end;
//! it is not a production cache.
//!
//! # Design
//!
//! - DashMap keyed by item key: sharded writes, concurrent reads
//! - Collections keep their elements inline, in collection order
//! - Optional memory budget: exceeding it is out-of-memory, as in the real
//!   allocator
//! - Scans snapshot the matching key set at open and pin returned items
//!   until they are released

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cachesnap_core::limits::{DEFAULT_PREFIX_DELIMITER, MAX_KEY_LENGTH};
use cachesnap_core::{now_secs, Element, Item, ItemType, Result, SnapshotError};
use cachesnap_durability::{RedoError, RedoStore};

use crate::scan::{CheckpointScope, ItemScan, ItemSource, ScanBatch, ScanOptions, ScannedItem};

/// Accounting overhead per item
const ITEM_OVERHEAD: usize = 48;
/// Accounting overhead per element
const ELEMENT_OVERHEAD: usize = 16;

#[derive(Debug, Clone)]
struct StoredItem {
    item: Item,
    elements: Vec<Element>,
}

impl StoredItem {
    fn footprint(&self) -> usize {
        item_footprint(&self.item) + self.elements.iter().map(element_footprint).sum::<usize>()
    }
}

fn item_footprint(item: &Item) -> usize {
    ITEM_OVERHEAD + item.key.len() + item.value.len()
}

fn element_footprint(element: &Element) -> usize {
    ELEMENT_OVERHEAD + element.subkey.as_ref().map_or(0, |s| s.len()) + element.value.len()
}

struct StoreInner {
    entries: DashMap<Vec<u8>, StoredItem>,
    memory_limit: Option<usize>,
    memory_used: AtomicUsize,
    pinned: AtomicUsize,
}

impl StoreInner {
    fn charge(&self, bytes: usize) -> Result<()> {
        match self.memory_limit {
            None => {
                self.memory_used.fetch_add(bytes, Ordering::Relaxed);
                Ok(())
            }
            Some(limit) => self
                .memory_used
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                    used.checked_add(bytes).filter(|&n| n <= limit)
                })
                .map(|_| ())
                .map_err(|_| SnapshotError::OutOfMemory),
        }
    }

    fn refund(&self, bytes: usize) {
        self.memory_used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// In-memory item store.
///
/// Cheap to clone; clones share the same contents.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<StoreInner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Create an empty store without a memory budget
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an empty store that fails allocations past `bytes`
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(memory_limit: Option<usize>) -> Self {
        MemStore {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                memory_limit,
                memory_used: AtomicUsize::new(0),
                pinned: AtomicUsize::new(0),
            }),
        }
    }

    /// Link an item, replacing any item with the same key (and its elements).
    ///
    /// Only the growth over the replaced item counts against the budget.
    pub fn insert_item(&self, item: Item) -> Result<()> {
        if item.key.is_empty() || item.key.len() > MAX_KEY_LENGTH {
            return Err(SnapshotError::invalid(format!(
                "key length {} out of range",
                item.key.len()
            )));
        }
        if item.is_collection() && !item.value.is_empty() {
            return Err(SnapshotError::invalid("collection items carry no value"));
        }
        let stored = StoredItem {
            item,
            elements: Vec::new(),
        };
        let footprint = stored.footprint();
        // Charged under the entry lock, net of whatever the item replaces
        match self.inner.entries.entry(stored.item.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let replaced = occupied.get().footprint();
                if footprint > replaced {
                    self.inner.charge(footprint - replaced)?;
                } else {
                    self.inner.refund(replaced - footprint);
                }
                occupied.insert(stored);
            }
            Entry::Vacant(vacant) => {
                self.inner.charge(footprint)?;
                vacant.insert(stored);
            }
        }
        Ok(())
    }

    /// Add an element to the collection at `key`.
    ///
    /// Lists append. Sets reject a duplicate value; maps and b-trees reject
    /// a duplicate subkey. B-tree elements stay ordered by subkey.
    pub fn insert_element(&self, key: &[u8], element: Element) -> Result<()> {
        let mut stored = self
            .inner
            .entries
            .get_mut(key)
            .ok_or_else(|| SnapshotError::invalid("no such collection"))?;

        let position = match stored.item.item_type {
            ItemType::Kv => {
                return Err(SnapshotError::invalid("item is not a collection"));
            }
            ItemType::List | ItemType::Set if element.subkey.is_some() => {
                return Err(SnapshotError::invalid("list and set elements have no subkey"));
            }
            ItemType::Map | ItemType::Btree if element.subkey.is_none() => {
                return Err(SnapshotError::invalid("map and b-tree elements need a subkey"));
            }
            ItemType::List => stored.elements.len(),
            ItemType::Set => {
                if stored.elements.iter().any(|e| e.value == element.value) {
                    return Err(SnapshotError::invalid("set element exists"));
                }
                stored.elements.len()
            }
            ItemType::Map => {
                if stored.elements.iter().any(|e| e.subkey == element.subkey) {
                    return Err(SnapshotError::invalid("map field exists"));
                }
                stored.elements.len()
            }
            ItemType::Btree => {
                match stored
                    .elements
                    .binary_search_by(|e| e.subkey.cmp(&element.subkey))
                {
                    Ok(_) => return Err(SnapshotError::invalid("b-tree element exists")),
                    Err(pos) => pos,
                }
            }
        };

        self.inner.charge(element_footprint(&element))?;
        stored.elements.insert(position, element);
        Ok(())
    }

    /// Item at `key`, unless absent or expired
    pub fn get(&self, key: &[u8]) -> Option<Item> {
        let stored = self.inner.entries.get(key)?;
        if stored.item.expiry.is_expired(now_secs()) {
            return None;
        }
        Some(stored.item.clone())
    }

    /// Elements of the collection at `key`
    pub fn elements(&self, key: &[u8]) -> Option<Vec<Element>> {
        let stored = self.inner.entries.get(key)?;
        if !stored.item.is_collection() {
            return None;
        }
        Some(stored.elements.clone())
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Unlink the item at `key`
    pub fn remove(&self, key: &[u8]) -> bool {
        match self.inner.entries.remove(key) {
            Some((_, old)) => {
                self.inner.refund(old.footprint());
                true
            }
            None => false,
        }
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Items currently held by scans or replay
    pub fn pinned(&self) -> usize {
        self.inner.pinned.load(Ordering::Acquire)
    }

    /// Bytes charged against the memory budget
    pub fn memory_used(&self) -> usize {
        self.inner.memory_used.load(Ordering::Relaxed)
    }
}

impl ItemSource for MemStore {
    fn open_scan(&self, options: ScanOptions) -> Result<Box<dyn ItemScan>> {
        if let Some(scope) = &options.checkpoint_scope {
            scope.on_scan_open();
        }
        let mut keys: Vec<Vec<u8>> = self
            .inner
            .entries
            .iter()
            .filter(|e| options.prefix.matches(e.key(), DEFAULT_PREFIX_DELIMITER))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();

        Ok(Box::new(MemScan {
            inner: Arc::clone(&self.inner),
            keys: keys.into_iter(),
            with_elements: options.with_elements,
            scope: options.checkpoint_scope,
        }))
    }
}

struct MemScan {
    inner: Arc<StoreInner>,
    keys: std::vec::IntoIter<Vec<u8>>,
    with_elements: bool,
    scope: Option<Arc<dyn CheckpointScope>>,
}

impl ItemScan for MemScan {
    fn next_batch(&mut self, capacity: usize) -> ScanBatch {
        let now = now_secs();
        let mut batch = Vec::with_capacity(capacity);
        while batch.len() < capacity {
            let Some(key) = self.keys.next() else {
                break;
            };
            // Items unlinked or expired since the scan opened are skipped
            let Some(stored) = self.inner.entries.get(&key) else {
                continue;
            };
            if stored.item.expiry.is_expired(now) {
                continue;
            }
            let elements = if self.with_elements && stored.item.is_collection() {
                stored.elements.clone()
            } else {
                Vec::new()
            };
            batch.push(ScannedItem {
                item: stored.item.clone(),
                elements,
            });
        }

        if batch.is_empty() {
            return ScanBatch::End;
        }
        self.inner.pinned.fetch_add(batch.len(), Ordering::AcqRel);
        ScanBatch::Items(batch)
    }

    fn release(&mut self, batch: Vec<ScannedItem>) {
        self.inner.pinned.fetch_sub(batch.len(), Ordering::AcqRel);
    }

    fn close(self: Box<Self>, completed: bool) {
        if let Some(scope) = &self.scope {
            scope.on_scan_close(completed);
        }
    }
}

/// A collection pinned by replay
pub struct PinnedCollection {
    key: Vec<u8>,
    inner: Arc<StoreInner>,
}

impl PinnedCollection {
    /// Key of the pinned collection
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl Drop for PinnedCollection {
    fn drop(&mut self) {
        self.inner.pinned.fetch_sub(1, Ordering::AcqRel);
    }
}

fn redo_error(e: SnapshotError) -> RedoError {
    match e {
        SnapshotError::OutOfMemory => RedoError::OutOfMemory,
        other => RedoError::Rejected(other.to_string()),
    }
}

impl RedoStore for MemStore {
    type Owner = PinnedCollection;

    fn redo_link(&self, item: &Item) -> std::result::Result<(), RedoError> {
        self.insert_item(item.clone()).map_err(redo_error)
    }

    fn collection_owner(&self, key: &[u8]) -> Option<PinnedCollection> {
        let stored = self.inner.entries.get(key)?;
        if !stored.item.is_collection() {
            return None;
        }
        self.inner.pinned.fetch_add(1, Ordering::AcqRel);
        Some(PinnedCollection {
            key: key.to_vec(),
            inner: Arc::clone(&self.inner),
        })
    }

    fn redo_element(
        &self,
        owner: &PinnedCollection,
        element: &Element,
    ) -> std::result::Result<(), RedoError> {
        self.insert_element(&owner.key, element.clone())
            .map_err(redo_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachesnap_core::{Expiry, PrefixFilter};
    use parking_lot::Mutex;

    fn drain(store: &MemStore, options: ScanOptions, capacity: usize) -> Vec<ScannedItem> {
        let mut scan = store.open_scan(options).unwrap();
        let mut all = Vec::new();
        loop {
            match scan.next_batch(capacity) {
                ScanBatch::Items(batch) => {
                    all.extend(batch.iter().cloned());
                    scan.release(batch);
                }
                ScanBatch::End => break,
                ScanBatch::OutOfMemory => panic!("unexpected oom"),
            }
        }
        scan.close(true);
        all
    }

    #[test]
    fn test_insert_replaces_item_and_elements() {
        let store = MemStore::new();
        store
            .insert_item(Item::collection("l", ItemType::List).unwrap())
            .unwrap();
        store.insert_element(b"l", Element::value("a")).unwrap();

        store
            .insert_item(Item::collection("l", ItemType::List).unwrap())
            .unwrap();
        assert!(store.elements(b"l").unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_collection_rules() {
        let store = MemStore::new();
        for (key, t) in [
            ("l", ItemType::List),
            ("s", ItemType::Set),
            ("m", ItemType::Map),
            ("b", ItemType::Btree),
        ] {
            store.insert_item(Item::collection(key, t).unwrap()).unwrap();
        }
        store.insert_item(Item::kv("k", "v")).unwrap();

        store.insert_element(b"l", Element::value("x")).unwrap();
        store.insert_element(b"l", Element::value("x")).unwrap();
        assert_eq!(store.elements(b"l").unwrap().len(), 2);

        store.insert_element(b"s", Element::value("x")).unwrap();
        assert!(store.insert_element(b"s", Element::value("x")).is_err());

        store.insert_element(b"m", Element::keyed("f", "1")).unwrap();
        assert!(store.insert_element(b"m", Element::keyed("f", "2")).is_err());
        assert!(store.insert_element(b"m", Element::value("nokey")).is_err());

        store.insert_element(b"b", Element::keyed("c", "3")).unwrap();
        store.insert_element(b"b", Element::keyed("a", "1")).unwrap();
        store.insert_element(b"b", Element::keyed("b", "2")).unwrap();
        let bkeys: Vec<_> = store
            .elements(b"b")
            .unwrap()
            .into_iter()
            .map(|e| e.subkey.unwrap())
            .collect();
        assert_eq!(bkeys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        assert!(store.insert_element(b"k", Element::value("x")).is_err());
        assert!(store.insert_element(b"missing", Element::value("x")).is_err());
    }

    #[test]
    fn test_memory_limit() {
        let store = MemStore::with_memory_limit(ITEM_OVERHEAD + 10);
        store.insert_item(Item::kv("k", "v")).unwrap();
        assert!(matches!(
            store.insert_item(Item::kv("k2", "v")),
            Err(SnapshotError::OutOfMemory)
        ));

        // Removing refunds the footprint
        store.remove(b"k");
        assert_eq!(store.memory_used(), 0);
        store.insert_item(Item::kv("k2", "v")).unwrap();
    }

    #[test]
    fn test_scan_prefix_and_batches() {
        let store = MemStore::new();
        for key in ["a:1", "a:2", "a:3", "b:1", "plain"] {
            store.insert_item(Item::kv(key, "v")).unwrap();
        }

        let all = drain(&store, ScanOptions::default(), 2);
        assert_eq!(all.len(), 5);

        let a = drain(
            &store,
            ScanOptions {
                prefix: PrefixFilter::Prefix(b"a".to_vec()),
                ..Default::default()
            },
            2,
        );
        let keys: Vec<_> = a.iter().map(|s| s.item.key.clone()).collect();
        assert_eq!(keys, vec![b"a:1".to_vec(), b"a:2".to_vec(), b"a:3".to_vec()]);

        let null = drain(
            &store,
            ScanOptions {
                prefix: PrefixFilter::Null,
                ..Default::default()
            },
            16,
        );
        assert_eq!(null.len(), 1);
        assert_eq!(null[0].item.key, b"plain".to_vec());
        assert_eq!(store.pinned(), 0);
    }

    #[test]
    fn test_scan_skips_expired_and_elements_on_request() {
        let store = MemStore::new();
        store
            .insert_item(Item::kv("old", "v").with_expiry(Expiry::At(1)))
            .unwrap();
        store
            .insert_item(Item::collection("set", ItemType::Set).unwrap())
            .unwrap();
        store.insert_element(b"set", Element::value("x")).unwrap();

        let without = drain(&store, ScanOptions::default(), 16);
        assert_eq!(without.len(), 1);
        assert!(without[0].elements.is_empty());

        let with = drain(
            &store,
            ScanOptions {
                with_elements: true,
                ..Default::default()
            },
            16,
        );
        assert_eq!(with[0].elements, vec![Element::value("x")]);
    }

    #[test]
    fn test_batches_pin_until_released() {
        let store = MemStore::new();
        for i in 0..5 {
            store.insert_item(Item::kv(format!("k{}", i), "v")).unwrap();
        }
        let mut scan = store.open_scan(ScanOptions::default()).unwrap();
        let ScanBatch::Items(batch) = scan.next_batch(3) else {
            panic!("expected items");
        };
        assert_eq!(store.pinned(), 3);
        scan.release(batch);
        assert_eq!(store.pinned(), 0);
        scan.close(false);
    }

    #[test]
    fn test_checkpoint_scope_hooks() {
        #[derive(Default)]
        struct Hooks(Mutex<Vec<String>>);
        impl CheckpointScope for Hooks {
            fn on_scan_open(&self) {
                self.0.lock().push("open".into());
            }
            fn on_scan_close(&self, completed: bool) {
                self.0.lock().push(format!("close:{}", completed));
            }
        }

        let hooks = Arc::new(Hooks::default());
        let store = MemStore::new();
        drain(
            &store,
            ScanOptions {
                checkpoint_scope: Some(hooks.clone()),
                ..Default::default()
            },
            16,
        );
        assert_eq!(*hooks.0.lock(), vec!["open", "close:true"]);
    }

    #[test]
    fn test_redo_store_pins_owner() {
        let store = MemStore::new();
        store
            .redo_link(&Item::collection("l", ItemType::List).unwrap())
            .unwrap();
        let owner = store.collection_owner(b"l").unwrap();
        assert_eq!(store.pinned(), 1);
        store.redo_element(&owner, &Element::value("x")).unwrap();
        drop(owner);
        assert_eq!(store.pinned(), 0);

        store.redo_link(&Item::kv("k", "v")).unwrap();
        assert!(store.collection_owner(b"k").is_none());
    }

    #[test]
    fn test_relink_at_budget_charges_difference() {
        let footprint = ITEM_OVERHEAD + 3 + 5;
        let store = MemStore::with_memory_limit(footprint);
        store.redo_link(&Item::kv("foo", "hello")).unwrap();
        assert_eq!(store.memory_used(), footprint);

        store.redo_link(&Item::kv("foo", "hello")).unwrap();
        assert_eq!(store.memory_used(), footprint);

        // Shrinking refunds, growing past the budget still fails
        store.redo_link(&Item::kv("foo", "hi")).unwrap();
        assert_eq!(store.memory_used(), footprint - 3);
        assert_eq!(
            store.redo_link(&Item::kv("foo", "hello!")),
            Err(RedoError::OutOfMemory)
        );
        assert_eq!(store.get(b"foo").unwrap().value, b"hi".to_vec());
    }

    #[test]
    fn test_relink_collection_refunds_elements() {
        let store = MemStore::new();
        store
            .insert_item(Item::collection("l", ItemType::List).unwrap())
            .unwrap();
        let bare = store.memory_used();
        store.insert_element(b"l", Element::value("abc")).unwrap();
        assert!(store.memory_used() > bare);

        store
            .insert_item(Item::collection("l", ItemType::List).unwrap())
            .unwrap();
        assert_eq!(store.memory_used(), bare);
    }

    #[test]
    fn test_redo_out_of_memory() {
        let store = MemStore::with_memory_limit(ITEM_OVERHEAD + 1);
        assert_eq!(
            store.redo_link(&Item::kv("big", "value")),
            Err(RedoError::OutOfMemory)
        );
    }
}
