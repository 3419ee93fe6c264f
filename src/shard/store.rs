// Copyright 2025 The Quilt Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use thiserror::Error;

use crate::clock::Timestamp;
use crate::data::{CollectionUuid, DocKey, Document, FieldSet, Namespace};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum StoreError {
    #[error("no collection named {0}")]
    NameNotFound(Namespace),
    #[error("namespace {0} already exists")]
    NamespaceExists(Namespace),
    #[error("collection {0} is gone")]
    NamespaceGone(CollectionUuid),
    #[error("duplicate key {key} in collection {collection}")]
    DuplicateKey { collection: CollectionUuid, key: DocKey },
    #[error("document {key} missing in collection {collection}")]
    DocumentMissing { collection: CollectionUuid, key: DocKey },
}

/// A committed document and the commit timestamp of its current version.
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned {
    pub doc: Document,
    pub ts: Timestamp,
}

#[derive(Clone, Debug)]
struct Collection {
    namespace: Namespace,
    docs: BTreeMap<DocKey, Versioned>,
}

/// One shard's committed data. Collections are addressed by uuid with the
/// current names kept as an index, so renames never change identity. Every
/// mutation stamps the commit timestamp of the version it writes.
#[derive(Clone, Debug, Default)]
pub struct Keyspace {
    collections: HashMap<CollectionUuid, Collection>,
    names: HashMap<Namespace, CollectionUuid>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, namespace: Namespace) -> Result<CollectionUuid> {
        let collection = CollectionUuid::random();
        self.create_with(collection, namespace)?;
        Ok(collection)
    }

    /// Creates a collection under a caller-chosen uuid. Recreating the same
    /// uuid refreshes its name mapping, so replaying a create is a no-op.
    pub fn create_with(&mut self, collection: CollectionUuid, namespace: Namespace) -> Result<()> {
        if let Some(owner) = self.names.get(&namespace) {
            if *owner != collection {
                return Err(StoreError::NamespaceExists(namespace));
            }
        }
        match self.collections.get_mut(&collection) {
            Some(existing) => {
                let old = std::mem::replace(&mut existing.namespace, namespace.clone());
                if old != namespace {
                    self.names.remove(&old);
                }
            },
            None => {
                self.collections
                    .insert(collection, Collection { namespace: namespace.clone(), docs: BTreeMap::new() });
            },
        }
        self.names.insert(namespace, collection);
        Ok(())
    }

    pub fn resolve(&self, namespace: &Namespace) -> Option<CollectionUuid> {
        self.names.get(namespace).copied()
    }

    pub fn namespace_of(&self, collection: CollectionUuid) -> Option<&Namespace> {
        self.collections.get(&collection).map(|c| &c.namespace)
    }

    pub fn drop_name(&mut self, namespace: &Namespace) -> Result<CollectionUuid> {
        match self.names.get(namespace) {
            None => Err(StoreError::NameNotFound(namespace.clone())),
            Some(collection) => {
                let collection = *collection;
                self.drop_uuid(collection)?;
                Ok(collection)
            },
        }
    }

    pub fn drop_uuid(&mut self, collection: CollectionUuid) -> Result<()> {
        match self.collections.remove(&collection) {
            None => Err(StoreError::NamespaceGone(collection)),
            Some(removed) => {
                self.names.remove(&removed.namespace);
                Ok(())
            },
        }
    }

    /// Renames by uuid. Renaming a collection to the name it already has is
    /// a no-op; a name held by a different collection refuses.
    pub fn rename_uuid(&mut self, collection: CollectionUuid, to: Namespace) -> Result<()> {
        match self.names.get(&to) {
            Some(owner) if *owner == collection => return Ok(()),
            Some(_) => return Err(StoreError::NamespaceExists(to)),
            None => (),
        }
        match self.collections.get_mut(&collection) {
            None => Err(StoreError::NamespaceGone(collection)),
            Some(existing) => {
                let old = std::mem::replace(&mut existing.namespace, to.clone());
                self.names.remove(&old);
                self.names.insert(to, collection);
                Ok(())
            },
        }
    }

    fn collection(&self, collection: CollectionUuid) -> Result<&Collection> {
        self.collections.get(&collection).ok_or(StoreError::NamespaceGone(collection))
    }

    fn collection_mut(&mut self, collection: CollectionUuid) -> Result<&mut Collection> {
        self.collections.get_mut(&collection).ok_or(StoreError::NamespaceGone(collection))
    }

    pub fn get(&self, collection: CollectionUuid, key: &DocKey) -> Result<Option<&Versioned>> {
        Ok(self.collection(collection)?.docs.get(key))
    }

    pub fn insert(&mut self, collection: CollectionUuid, doc: Document, ts: Timestamp) -> Result<()> {
        let slot = self.collection_mut(collection)?;
        if slot.docs.contains_key(&doc.key) {
            return Err(StoreError::DuplicateKey { collection, key: doc.key });
        }
        slot.docs.insert(doc.key.clone(), Versioned { doc, ts });
        Ok(())
    }

    pub fn upsert(&mut self, collection: CollectionUuid, doc: Document, ts: Timestamp) -> Result<()> {
        let slot = self.collection_mut(collection)?;
        slot.docs.insert(doc.key.clone(), Versioned { doc, ts });
        Ok(())
    }

    pub fn update_set(
        &mut self,
        collection: CollectionUuid,
        key: &DocKey,
        set: &FieldSet,
        ts: Timestamp,
    ) -> Result<()> {
        let slot = self.collection_mut(collection)?;
        match slot.docs.get_mut(key) {
            None => Err(StoreError::DocumentMissing { collection, key: key.clone() }),
            Some(versioned) => {
                versioned.doc.apply_set(set);
                versioned.ts = ts;
                Ok(())
            },
        }
    }

    /// Removes a document, reporting whether it was present. Absence is not
    /// an error here: commit replay and interactive deletes both tolerate
    /// it, each with its own accounting.
    pub fn remove(&mut self, collection: CollectionUuid, key: &DocKey) -> Result<bool> {
        let slot = self.collection_mut(collection)?;
        Ok(slot.docs.remove(key).is_some())
    }

    /// Hands off every document with key at or above `from`, for rehoming a
    /// split range onto another shard.
    pub fn extract_range(&mut self, collection: CollectionUuid, from: &DocKey) -> Result<Vec<(DocKey, Versioned)>> {
        let slot = self.collection_mut(collection)?;
        let moved = slot.docs.split_off(from);
        Ok(moved.into_iter().collect())
    }

    pub fn adopt(&mut self, collection: CollectionUuid, docs: Vec<(DocKey, Versioned)>) -> Result<()> {
        let slot = self.collection_mut(collection)?;
        slot.docs.extend(docs);
        Ok(())
    }

    /// Every live version in key order, for equality checks between a source
    /// and a replayed copy.
    pub fn dump(&self, collection: CollectionUuid) -> Result<Vec<Versioned>> {
        Ok(self.collection(collection)?.docs.values().cloned().collect())
    }

    pub fn doc_count(&self, collection: CollectionUuid) -> Result<usize> {
        Ok(self.collection(collection)?.docs.len())
    }
}

#[cfg(test)]
mod tests {
    use speculoos::prelude::*;

    use super::*;

    fn ns(name: &str) -> Namespace {
        Namespace::from(name)
    }

    fn ts(physical: u64) -> Timestamp {
        Timestamp { physical, logical: 0 }
    }

    #[test]
    fn test_create_resolve_rename() {
        let mut keyspace = Keyspace::new();
        let accounts = keyspace.create(ns("bank.accounts")).unwrap();
        assert_that!(&keyspace.resolve(&ns("bank.accounts"))).is_equal_to(&Some(accounts));

        let duplicate = keyspace.create(ns("bank.accounts"));
        assert_that!(&duplicate).is_equal_to(&Err(StoreError::NamespaceExists(ns("bank.accounts"))));

        keyspace.rename_uuid(accounts, ns("bank.ledgered")).unwrap();
        assert_that!(&keyspace.resolve(&ns("bank.accounts"))).is_equal_to(&None);
        assert_that!(&keyspace.resolve(&ns("bank.ledgered"))).is_equal_to(&Some(accounts));
        assert_that!(&keyspace.namespace_of(accounts)).is_equal_to(&Some(&ns("bank.ledgered")));

        // Renaming to the current name stays put.
        keyspace.rename_uuid(accounts, ns("bank.ledgered")).unwrap();
        assert_that!(&keyspace.resolve(&ns("bank.ledgered"))).is_equal_to(&Some(accounts));
    }

    #[test]
    fn test_create_with_is_replay_safe() {
        let mut keyspace = Keyspace::new();
        let coll = keyspace.create(ns("a.b")).unwrap();
        keyspace.insert(coll, Document::new("k").with("v", 1i64), ts(1)).unwrap();

        keyspace.create_with(coll, ns("a.b")).unwrap();
        assert_that!(&keyspace.doc_count(coll).unwrap()).is_equal_to(&1);

        let other = keyspace.create(ns("a.c")).unwrap();
        let clash = keyspace.create_with(other, ns("a.b"));
        assert_that!(&clash).is_equal_to(&Err(StoreError::NamespaceExists(ns("a.b"))));
    }

    #[test]
    fn test_document_lifecycle() {
        let mut keyspace = Keyspace::new();
        let coll = keyspace.create(ns("a.b")).unwrap();

        keyspace.insert(coll, Document::new("k1").with("v", 1i64), ts(1)).unwrap();
        let duplicate = keyspace.insert(coll, Document::new("k1").with("v", 2i64), ts(2));
        assert_that!(&duplicate)
            .is_equal_to(&Err(StoreError::DuplicateKey { collection: coll, key: DocKey::from("k1") }));

        let mut set = FieldSet::new();
        set.insert("v".into(), 3i64.into());
        keyspace.update_set(coll, &DocKey::from("k1"), &set, ts(3)).unwrap();
        let versioned = keyspace.get(coll, &DocKey::from("k1")).unwrap().unwrap();
        assert_that!(&versioned.doc.get("v")).is_equal_to(&Some(&crate::data::Value::Int(3)));
        assert_that!(&versioned.ts).is_equal_to(&ts(3));

        let missing = keyspace.update_set(coll, &DocKey::from("k9"), &set, ts(4));
        assert_that!(&missing)
            .is_equal_to(&Err(StoreError::DocumentMissing { collection: coll, key: DocKey::from("k9") }));

        assert_that!(&keyspace.remove(coll, &DocKey::from("k1")).unwrap()).is_equal_to(&true);
        assert_that!(&keyspace.remove(coll, &DocKey::from("k1")).unwrap()).is_equal_to(&false);
    }

    #[test]
    fn test_extract_and_adopt_range() {
        let mut donor = Keyspace::new();
        let coll = donor.create(ns("a.b")).unwrap();
        for key in ["a", "m", "z"] {
            donor.insert(coll, Document::new(key).with("v", 1i64), ts(1)).unwrap();
        }

        let moved = donor.extract_range(coll, &DocKey::from("m")).unwrap();
        assert_that!(&moved).has_length(2);
        assert_that!(&donor.doc_count(coll).unwrap()).is_equal_to(&1);

        let mut recipient = Keyspace::new();
        recipient.create_with(coll, ns("a.b")).unwrap();
        recipient.adopt(coll, moved).unwrap();
        assert_that!(&recipient.doc_count(coll).unwrap()).is_equal_to(&2);
        assert_that!(&recipient.get(coll, &DocKey::from("z")).unwrap()).is_some();
    }

    #[test]
    fn test_drop_by_name_and_uuid() {
        let mut keyspace = Keyspace::new();
        let coll = keyspace.create(ns("a.b")).unwrap();
        assert_that!(&keyspace.drop_name(&ns("a.b")).unwrap()).is_equal_to(&coll);
        assert_that!(&keyspace.drop_name(&ns("a.b"))).is_equal_to(&Err(StoreError::NameNotFound(ns("a.b"))));
        assert_that!(&keyspace.drop_uuid(coll)).is_equal_to(&Err(StoreError::NamespaceGone(coll)));
    }
}
