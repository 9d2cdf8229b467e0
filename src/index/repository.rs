// In-memory index repository shared by the indexer and query handlers

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::query::Query;
use super::snapshot::{IndexSnapshot, SNAPSHOT_FORMAT_VERSION};
use super::{split_member_fqn, Definition, File, IndexEvent, IndexStatus, Reference};

const EVENT_CAPACITY: usize = 1024;

/// Repository statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub files: usize,
    pub namespaces: usize,
    pub symbols: usize,
    pub definitions: usize,
    pub references: usize,
    pub conflicts: usize,
}

/// Indexed files plus the FQN indexes derived from them
#[derive(Debug, Default)]
pub(crate) struct IndexState {
    /// uri -> (insertion sequence, file)
    pub(crate) files: HashMap<String, (u64, Arc<File>)>,
    /// fqn -> declaring files ordered by insertion sequence; the first is live
    declarers: HashMap<String, BTreeMap<u64, String>>,
    /// fqn -> uris with at least one reference to it
    referrers: HashMap<String, BTreeSet<String>>,
    /// Restored from a snapshot and not yet checked against disk
    unverified: HashSet<String>,
    next_sequence: u64,
}

impl IndexState {
    pub(crate) fn owner(&self, fqn: &str) -> Option<&str> {
        self.declarers
            .get(fqn)
            .and_then(|declarers| declarers.values().next())
            .map(String::as_str)
    }

    pub(crate) fn is_live(&self, definition: &Definition) -> bool {
        self.owner(&definition.fqn) == Some(definition.uri.as_str())
    }

    pub(crate) fn definition(&self, fqn: &str) -> Option<&Definition> {
        let owner = self.owner(fqn)?;
        let (_, file) = self.files.get(owner)?;
        file.definitions.iter().find(|d| d.fqn == fqn)
    }

    /// The FQN a reference currently binds to: the namespaced name while it
    /// has a definition, else the global fallback if that one does
    pub(crate) fn bound<'r>(&self, reference: &'r Reference) -> &'r str {
        match reference.fallback.as_deref() {
            Some(fallback) if self.owner(&reference.fqn).is_none() && self.owner(fallback).is_some() => {
                fallback
            }
            _ => &reference.fqn,
        }
    }

    /// Files in insertion order
    pub(crate) fn ordered_files(&self) -> Vec<&Arc<File>> {
        let mut files: Vec<&(u64, Arc<File>)> = self.files.values().collect();
        files.sort_by_key(|(sequence, _)| *sequence);
        files.into_iter().map(|(_, file)| file).collect()
    }

    /// Swap a file in; returns FQNs whose live definition changed
    fn replace(&mut self, file: File) -> Vec<String> {
        let uri = file.uri.clone();
        let sequence = match self.files.get(&uri) {
            Some((sequence, _)) => *sequence,
            None => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                sequence
            }
        };

        let mut before = HashMap::new();
        if let Some((_, old)) = self.files.remove(&uri) {
            for definition in &old.definitions {
                before.insert(definition.fqn.clone(), self.owner(&definition.fqn).map(str::to_string));
            }
            self.detach(&uri, &old);
        }

        for definition in &file.definitions {
            self.declarers
                .entry(definition.fqn.clone())
                .or_default()
                .insert(sequence, uri.clone());
        }
        for reference in &file.references {
            for name in reference.names() {
                self.referrers
                    .entry(name.to_string())
                    .or_default()
                    .insert(uri.clone());
            }
        }

        let mut changed: Vec<String> = file
            .definitions
            .iter()
            .filter(|definition| self.owner(&definition.fqn) == Some(uri.as_str()))
            .map(|definition| definition.fqn.clone())
            .collect();
        let declared: HashSet<&str> = file.definitions.iter().map(|d| d.fqn.as_str()).collect();
        for (fqn, previous) in before {
            if declared.contains(fqn.as_str()) {
                continue;
            }
            let now = self.owner(&fqn);
            if now.is_some() && now != previous.as_deref() {
                changed.push(fqn);
            }
        }

        self.unverified.remove(&uri);
        self.files.insert(uri, (sequence, Arc::new(file)));
        changed
    }

    /// Drop a file; returns FQNs promoted to another declarer
    fn remove(&mut self, uri: &str) -> Option<Vec<String>> {
        let (_, old) = self.files.remove(uri)?;
        let owned: Vec<String> = old
            .definitions
            .iter()
            .filter(|definition| self.owner(&definition.fqn) == Some(uri))
            .map(|definition| definition.fqn.clone())
            .collect();
        self.detach(uri, &old);
        self.unverified.remove(uri);
        let promoted = owned
            .into_iter()
            .filter(|fqn| self.owner(fqn).is_some())
            .collect();
        Some(promoted)
    }

    fn detach(&mut self, uri: &str, file: &File) {
        for definition in &file.definitions {
            if let Some(declarers) = self.declarers.get_mut(&definition.fqn) {
                declarers.retain(|_, declarer| declarer != uri);
                if declarers.is_empty() {
                    self.declarers.remove(&definition.fqn);
                }
            }
        }
        for reference in &file.references {
            for name in reference.names() {
                if let Some(referrers) = self.referrers.get_mut(name) {
                    referrers.remove(uri);
                    if referrers.is_empty() {
                        self.referrers.remove(name);
                    }
                }
            }
        }
    }
}

/// Shared, thread-safe index of every known file
pub struct Repository {
    state: RwLock<IndexState>,
    status: Mutex<IndexStatus>,
    events: broadcast::Sender<IndexEvent>,
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(IndexState::default()),
            status: Mutex::new(IndexStatus::NotStarted),
            events,
        }
    }

    /// Build a repository from a snapshot. Incompatible snapshots give an empty one.
    pub fn from_snapshot(snapshot: IndexSnapshot) -> Self {
        let repo = Self::new();
        repo.restore(snapshot);
        repo
    }

    /// Insert or atomically replace the record for `file.uri`
    pub fn upsert_file(&self, file: File) {
        let uri = file.uri.clone();
        let changed = self.state.write().replace(file);
        debug!("Indexed {} ({} new definitions)", uri, changed.len());
        for fqn in changed {
            let _ = self.events.send(IndexEvent::DefinitionAdded(fqn));
        }
    }

    pub fn remove_file(&self, uri: &str) -> bool {
        let promoted = self.state.write().remove(uri);
        match promoted {
            Some(promoted) => {
                for fqn in promoted {
                    let _ = self.events.send(IndexEvent::DefinitionAdded(fqn));
                }
                true
            }
            None => false,
        }
    }

    pub fn get_file(&self, uri: &str) -> Option<Arc<File>> {
        self.state.read().files.get(uri).map(|(_, file)| file.clone())
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.state.read().files.contains_key(uri)
    }

    pub fn uris(&self) -> Vec<String> {
        self.state.read().files.keys().cloned().collect()
    }

    /// Live definition of an exact FQN
    pub fn get_definition(&self, fqn: &str) -> Option<Definition> {
        self.state.read().definition(fqn).cloned()
    }

    /// Member definition inherited from a parent type, searched breadth-first
    pub fn get_inherited_definition(&self, fqn: &str) -> Option<Definition> {
        let (class, member) = split_member_fqn(fqn)?;
        let state = self.state.read();

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([class.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if current != class {
                if let Some(definition) = state.definition(&format!("{}{}", current, member)) {
                    return Some(definition.clone());
                }
            }
            if let Some(owner) = state.definition(&current) {
                queue.extend(owner.parents.iter().cloned());
            }
        }
        None
    }

    /// URIs of files holding at least one reference bound to `fqn`
    pub fn get_reference_uris(&self, fqn: &str) -> Vec<String> {
        let state = self.state.read();
        let Some(uris) = state.referrers.get(fqn) else {
            return Vec::new();
        };
        uris.iter()
            .filter(|uri| {
                state.files.get(uri.as_str()).is_some_and(|(_, file)| {
                    file.references.iter().any(|reference| state.bound(reference) == fqn)
                })
            })
            .cloned()
            .collect()
    }

    /// Every reference currently bound to `fqn`, in file insertion order
    pub fn references_to(&self, fqn: &str) -> Vec<Reference> {
        let state = self.state.read();
        let Some(uris) = state.referrers.get(fqn) else {
            return Vec::new();
        };
        let mut files: Vec<&(u64, Arc<File>)> = uris
            .iter()
            .filter_map(|uri| state.files.get(uri.as_str()))
            .collect();
        files.sort_by_key(|(sequence, _)| *sequence);
        files
            .into_iter()
            .flat_map(|(_, file)| file.references.iter())
            .filter(|reference| state.bound(reference) == fqn)
            .cloned()
            .collect()
    }

    /// FQNs declared by `uri` whose live definition lives elsewhere
    pub fn conflicts(&self, uri: &str) -> Vec<String> {
        let state = self.state.read();
        let Some((_, file)) = state.files.get(uri) else {
            return Vec::new();
        };
        file.definitions
            .iter()
            .filter(|definition| !state.is_live(definition))
            .map(|definition| definition.fqn.clone())
            .collect()
    }

    /// Lazy query view. Holds a read lock: never keep one across an `.await`.
    pub fn query(&self) -> Query<'_> {
        Query::new(self.state.read())
    }

    pub fn is_verified(&self, uri: &str) -> bool {
        !self.state.read().unverified.contains(uri)
    }

    pub fn mark_verified(&self, uri: &str) {
        self.state.write().unverified.remove(uri);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> IndexStatus {
        *self.status.lock()
    }

    pub fn is_complete(&self) -> bool {
        self.status() == IndexStatus::Complete
    }

    /// Enter `Indexing` unless already complete; status never moves backwards
    pub fn begin_indexing(&self) {
        let mut status = self.status.lock();
        if *status == IndexStatus::NotStarted {
            *status = IndexStatus::Indexing;
        }
    }

    /// Flip to `Complete` and notify waiters under the same lock
    pub fn mark_complete(&self) {
        let mut status = self.status.lock();
        if *status != IndexStatus::Complete {
            *status = IndexStatus::Complete;
            let _ = self.events.send(IndexEvent::Complete);
        }
    }

    pub fn stats(&self) -> RepositoryStats {
        let state = self.state.read();
        let mut stats = RepositoryStats {
            files: state.files.len(),
            definitions: state.declarers.len(),
            ..Default::default()
        };
        for (_, file) in state.files.values() {
            stats.namespaces += file.namespaces.len();
            stats.symbols += file.symbols().count();
            stats.references += file.references.len();
            stats.conflicts += file.definitions.iter().filter(|d| !state.is_live(d)).count();
        }
        stats
    }

    /// Serializable copy of every file, in insertion order
    pub fn snapshot(&self) -> IndexSnapshot {
        let state = self.state.read();
        IndexSnapshot {
            version: SNAPSHOT_FORMAT_VERSION,
            created_at: chrono::Utc::now(),
            files: state
                .ordered_files()
                .into_iter()
                .map(|file| file.as_ref().clone())
                .collect(),
        }
    }

    /// Replace the whole state with a snapshot's. Returns the number of files restored.
    pub fn restore(&self, snapshot: IndexSnapshot) -> usize {
        let mut restored = IndexState::default();
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            warn!(
                "Ignoring snapshot with format version {} (expected {})",
                snapshot.version, SNAPSHOT_FORMAT_VERSION
            );
        } else {
            for file in snapshot.files {
                let uri = file.uri.clone();
                restored.replace(file);
                restored.unverified.insert(uri);
            }
        }

        let count = restored.files.len();
        *self.state.write() = restored;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Namespace, Position, Range, Symbol, SymbolKind};
    use proptest::prelude::*;

    fn definition(uri: &str, fqn: &str) -> Definition {
        Definition {
            fqn: fqn.to_string(),
            name: fqn.rsplit('\\').next().unwrap_or(fqn).to_string(),
            kind: SymbolKind::Class,
            uri: uri.to_string(),
            range: Range::new(Position::new(1, 0), Position::new(1, 10)),
            container: None,
            signature: None,
            documentation: None,
            parents: Vec::new(),
        }
    }

    fn file(uri: &str, defs: &[&str], refs: &[&str]) -> File {
        let definitions: Vec<Definition> = defs.iter().map(|fqn| definition(uri, fqn)).collect();
        let symbols = definitions
            .iter()
            .map(|d| Symbol {
                name: d.name.clone(),
                kind: d.kind,
                fqn: d.fqn.clone(),
                range: d.range,
                namespace: String::new(),
                container: None,
            })
            .collect();
        File {
            uri: uri.to_string(),
            content_hash: format!("hash-{}", uri),
            parse_duration_ms: 1,
            has_errors: false,
            namespaces: vec![Namespace {
                name: String::new(),
                symbols,
            }],
            definitions,
            references: refs
                .iter()
                .map(|fqn| Reference {
                    fqn: fqn.to_string(),
                    uri: uri.to_string(),
                    range: Range::default(),
                    fallback: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_upsert_replaces_atomically() {
        let repo = Repository::new();
        repo.upsert_file(file("file:///a.php", &["A\\Foo"], &["B\\Bar"]));
        assert!(repo.get_definition("A\\Foo").is_some());
        assert_eq!(repo.get_reference_uris("B\\Bar"), vec!["file:///a.php"]);

        repo.upsert_file(file("file:///a.php", &["A\\Baz"], &[]));

        assert!(repo.get_definition("A\\Foo").is_none());
        assert_eq!(repo.get_definition("A\\Baz").unwrap().uri, "file:///a.php");
        assert!(repo.get_reference_uris("B\\Bar").is_empty());
        assert_eq!(repo.stats().files, 1);
    }

    #[test]
    fn test_duplicate_fqn_keeps_first_seen() {
        let repo = Repository::new();
        repo.upsert_file(file("file:///first.php", &["App\\Dup"], &[]));
        repo.upsert_file(file("file:///second.php", &["App\\Dup"], &[]));

        assert_eq!(repo.get_definition("App\\Dup").unwrap().uri, "file:///first.php");
        assert_eq!(repo.conflicts("file:///second.php"), vec!["App\\Dup"]);
        assert!(repo.conflicts("file:///first.php").is_empty());

        // Reindexing the owner keeps ownership
        repo.upsert_file(file("file:///first.php", &["App\\Dup"], &[]));
        assert_eq!(repo.get_definition("App\\Dup").unwrap().uri, "file:///first.php");

        // Removing the owner promotes the next declarer
        let mut events = repo.subscribe();
        assert!(repo.remove_file("file:///first.php"));
        assert_eq!(repo.get_definition("App\\Dup").unwrap().uri, "file:///second.php");
        assert_eq!(
            events.try_recv().unwrap(),
            IndexEvent::DefinitionAdded("App\\Dup".to_string())
        );
        assert_eq!(repo.stats().conflicts, 0);
    }

    #[test]
    fn test_events_and_status() {
        let repo = Repository::new();
        let mut events = repo.subscribe();
        assert_eq!(repo.status(), IndexStatus::NotStarted);

        repo.begin_indexing();
        assert_eq!(repo.status(), IndexStatus::Indexing);
        repo.upsert_file(file("file:///a.php", &["A\\One"], &[]));
        repo.mark_complete();
        repo.mark_complete();
        repo.begin_indexing();

        assert_eq!(repo.status(), IndexStatus::Complete);
        assert_eq!(
            events.try_recv().unwrap(),
            IndexEvent::DefinitionAdded("A\\One".to_string())
        );
        assert_eq!(events.try_recv().unwrap(), IndexEvent::Complete);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_unqualified_call_binds_by_live_definition() {
        let repo = Repository::new();
        let mut call = file("file:///call.php", &[], &[]);
        call.references.push(Reference {
            fqn: "App\\helper()".to_string(),
            uri: "file:///call.php".to_string(),
            range: Range::default(),
            fallback: Some("helper()".to_string()),
        });
        repo.upsert_file(call);
        repo.upsert_file(file("file:///global.php", &["helper()"], &[]));

        // Only the global function exists: the call falls back to it
        assert_eq!(repo.get_reference_uris("helper()"), vec!["file:///call.php"]);
        assert!(repo.get_reference_uris("App\\helper()").is_empty());

        repo.upsert_file(file("file:///app.php", &["App\\helper()"], &[]));
        assert!(repo.get_reference_uris("helper()").is_empty());
        assert!(repo.references_to("helper()").is_empty());
        assert_eq!(repo.get_reference_uris("App\\helper()"), vec!["file:///call.php"]);
        let bound = repo.references_to("App\\helper()");
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].uri, "file:///call.php");

        // Dropping the namespaced function rebinds the call to the global one
        repo.remove_file("file:///app.php");
        assert_eq!(repo.get_reference_uris("helper()"), vec!["file:///call.php"]);

        repo.remove_file("file:///call.php");
        assert!(repo.get_reference_uris("helper()").is_empty());
        assert!(repo.state.read().referrers.is_empty());
    }

    #[test]
    fn test_inherited_definition_is_cycle_safe() {
        let repo = Repository::new();
        let mut a = file("file:///a.php", &["A", "A::run()"], &[]);
        a.definitions[0].parents = vec!["B".to_string()];
        let mut b = file("file:///b.php", &["B"], &[]);
        b.definitions[0].parents = vec!["A".to_string()];
        repo.upsert_file(a);
        repo.upsert_file(b);

        assert_eq!(repo.get_inherited_definition("B::run()").unwrap().fqn, "A::run()");
        assert!(repo.get_inherited_definition("B::missing()").is_none());
    }

    #[test]
    fn test_snapshot_round_trip_preserves_ownership() {
        let repo = Repository::new();
        repo.upsert_file(file("file:///z.php", &["Dup", "Z"], &["Y"]));
        repo.upsert_file(file("file:///a.php", &["Dup"], &[]));

        let snapshot = repo.snapshot();
        assert_eq!(snapshot.files[0].uri, "file:///z.php");

        let restored = Repository::from_snapshot(snapshot);
        assert_eq!(restored.get_definition("Dup").unwrap().uri, "file:///z.php");
        assert_eq!(restored.get_reference_uris("Y"), vec!["file:///z.php"]);
        assert_eq!(restored.stats(), repo.stats());
        assert!(!restored.is_verified("file:///z.php"));

        restored.mark_verified("file:///z.php");
        assert!(restored.is_verified("file:///z.php"));
    }

    #[test]
    fn test_restore_rejects_other_format_versions() {
        let repo = Repository::new();
        repo.upsert_file(file("file:///a.php", &["A"], &[]));
        let mut snapshot = repo.snapshot();
        snapshot.version += 1;

        let restored = Repository::from_snapshot(snapshot);
        assert_eq!(restored.stats().files, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Upsert(usize, Vec<usize>),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4usize, prop::collection::vec(0..6usize, 0..4)).prop_map(|(f, d)| Op::Upsert(f, d)),
            (0..4usize).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_every_fqn_has_at_most_one_live_definition(ops in prop::collection::vec(op(), 1..40)) {
            let repo = Repository::new();
            for op in ops {
                match op {
                    Op::Upsert(f, defs) => {
                        let mut fqns: Vec<String> = defs.iter().map(|d| format!("N\\C{}", d)).collect();
                        fqns.sort();
                        fqns.dedup();
                        let refs: Vec<&str> = fqns.iter().map(String::as_str).collect();
                        repo.upsert_file(file(&format!("file:///f{}.php", f), &refs, &refs));
                    }
                    Op::Remove(f) => {
                        repo.remove_file(&format!("file:///f{}.php", f));
                    }
                }
            }

            let (live, referrers) = {
                let query = repo.query();
                let live: Vec<String> = query.definitions().map(|d| d.fqn.clone()).collect();
                let mut referrers: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for reference in query.references() {
                    let uris = referrers.entry(reference.fqn.clone()).or_default();
                    if !uris.contains(&reference.uri) {
                        uris.push(reference.uri.clone());
                    }
                }
                (live, referrers)
            };

            let mut unique = live.clone();
            unique.sort();
            unique.dedup();
            prop_assert_eq!(unique.len(), live.len());

            for fqn in &live {
                let owner = repo.get_definition(fqn).unwrap();
                prop_assert!(repo.get_file(&owner.uri).is_some());
            }
            for (fqn, mut uris) in referrers {
                uris.sort();
                prop_assert_eq!(repo.get_reference_uris(&fqn), uris);
            }
        }
    }
}
