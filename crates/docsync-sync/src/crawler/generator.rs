//! Crawl event generation
//!
//! Compares the local tree, the remote tree and the stored mappings and
//! produces the events a crawl has to emit:
//!
//! - objects known to neither storage nor the other side become creation
//!   events; a local and a remote creation at the same path merge into one
//!   event carrying both sides;
//! - known objects that changed, moved or disappeared on either side are
//!   collected per remote id in the merge map and become one event each.
//!
//! Generation is pure; the crawler does all I/O up front.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use docsync_core::domain::{
    newtypes::{LocalGuid, RemoteId},
    ContentChange, DomainError, EventSource, FileOrFolderEvent, LocalHandle, MappedObject,
    MetaDataChange, PathMatcher, RemoteHandle, RemoteObject,
};
use docsync_core::ports::LocalEntry;
use tracing::{debug, warn};

use super::tree::{NodeId, ObjectTree};

/// A crawled local entry with its GUID attribute
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub entry: LocalEntry,
    pub guid: Option<LocalGuid>,
}

/// Changes of one known object on both sides
#[derive(Debug, Clone, Default)]
pub struct MergePair {
    pub local: Option<(LocalHandle, MetaDataChange)>,
    pub remote: Option<(RemoteHandle, MetaDataChange)>,
    pub old_local_path: Option<PathBuf>,
}

impl MergePair {
    fn has_change(&self) -> bool {
        let local = self
            .local
            .as_ref()
            .is_some_and(|(_, c)| *c != MetaDataChange::None);
        let remote = self
            .remote
            .as_ref()
            .is_some_and(|(_, c)| *c != MetaDataChange::None);
        local || remote
    }

    fn into_event(self) -> Option<FileOrFolderEvent> {
        let (local, local_change) = match self.local {
            Some((handle, change)) => (Some(handle), change),
            None => (None, MetaDataChange::None),
        };
        let (remote, remote_change) = match self.remote {
            Some((handle, change)) => (Some(handle), change),
            None => (None, MetaDataChange::None),
        };
        let mut event = FileOrFolderEvent::new(local, remote, EventSource::Crawler).ok()?;
        event.local_change = local_change;
        event.remote_change = remote_change;
        event.old_local_path = self.old_local_path;
        Some(event)
    }
}

/// Result of comparing the three trees
#[derive(Debug, Default)]
pub struct CrawlEvents {
    /// Creations, parents before children
    pub creation_events: Vec<FileOrFolderEvent>,
    pub merge_map: HashMap<RemoteId, MergePair>,
    /// Keys of `merge_map` in stored-tree order
    pub merge_order: Vec<RemoteId>,
    /// Known objects unchanged on both sides
    pub unchanged: usize,
}

impl CrawlEvents {
    /// Events in queue order: creations first, then merged changes
    pub fn into_events(mut self) -> Vec<FileOrFolderEvent> {
        let mut events = std::mem::take(&mut self.creation_events);
        for id in &self.merge_order {
            if let Some(pair) = self.merge_map.remove(id) {
                events.extend(pair.into_event());
            }
        }
        events
    }

    pub fn is_empty(&self) -> bool {
        self.creation_events.is_empty() && self.merge_map.is_empty()
    }
}

/// Stored mapping with its derived local path
#[derive(Debug, Clone)]
struct StoredNode {
    mapped: MappedObject,
    local_path: PathBuf,
}

/// Compares crawled trees against the stored mappings
pub struct CrawlEventGenerator<'a> {
    matcher: &'a PathMatcher,
}

impl<'a> CrawlEventGenerator<'a> {
    pub fn new(matcher: &'a PathMatcher) -> Self {
        Self { matcher }
    }

    /// Compares the trees
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ValidationFailed` if `stored` lacks the mapping
    /// of the remote root.
    pub fn generate(
        &self,
        local: &ObjectTree<LocalNode>,
        remote: &ObjectTree<RemoteObject>,
        stored: &[MappedObject],
    ) -> Result<CrawlEvents, DomainError> {
        let root_id = remote.item(ObjectTree::<RemoteObject>::ROOT).id.clone();
        let stored_tree = self.stored_tree(&root_id, stored)?;
        let by_id: HashMap<RemoteId, NodeId> = stored_tree
            .dfs()
            .into_iter()
            .map(|n| (stored_tree.item(n).mapped.remote_id().clone(), n))
            .collect();

        let mut events = CrawlEvents::default();
        let mut pairs: HashMap<RemoteId, MergePair> = HashMap::new();
        let mut seen_remote = HashSet::new();
        let mut seen_local = HashSet::new();
        let mut remote_changed = HashSet::new();
        let mut local_changed = HashSet::new();

        // Remote side
        let mut remote_creations = Vec::new();
        for node in remote.dfs().into_iter().skip(1) {
            let object = remote.item(node);
            let Some(&stored_node) = by_id.get(&object.id) else {
                remote_creations.push(object.clone());
                continue;
            };
            seen_remote.insert(object.id.clone());
            let mapped = &stored_tree.item(stored_node).mapped;
            let moved =
                object.parent_id.as_ref() != mapped.parent_id() || object.name != mapped.name();
            let changed = object.change_token.as_ref() != mapped.last_change_token();
            let change = if moved {
                MetaDataChange::Moved
            } else if changed {
                MetaDataChange::Changed
            } else {
                MetaDataChange::None
            };
            if change != MetaDataChange::None {
                remote_changed.insert(object.id.clone());
            }
            pairs.entry(object.id.clone()).or_default().remote =
                Some((RemoteHandle::Object(object.clone()), change));
        }

        // Local side
        let local_ids = self.match_local(local, &stored_tree, &by_id);
        let mut local_creations = Vec::new();
        for node in local.dfs().into_iter().skip(1) {
            let entry = &local.item(node).entry;
            let Some(id) = local_ids.get(&node) else {
                local_creations.push(entry.clone());
                continue;
            };
            seen_local.insert(id.clone());
            let stored_node = stored_tree.item(by_id[id]);
            let mapped = &stored_node.mapped;

            let parent_id = local.parent(node).and_then(|p| {
                if p == ObjectTree::<LocalNode>::ROOT {
                    Some(&root_id)
                } else {
                    local_ids.get(&p)
                }
            });
            let moved = parent_id != mapped.parent_id() || entry.name() != Some(mapped.name());
            let changed = !entry.is_directory
                && (entry.modified != mapped.last_local_write_time()
                    || mapped.content_size() != Some(entry.size));

            let pair = pairs.entry(id.clone()).or_default();
            let change = if moved {
                pair.old_local_path = Some(stored_node.local_path.clone());
                MetaDataChange::Moved
            } else if changed {
                MetaDataChange::Changed
            } else {
                MetaDataChange::None
            };
            if change != MetaDataChange::None {
                local_changed.insert(id.clone());
            }
            pair.local = Some((LocalHandle::new(&entry.path, entry.is_directory), change));
        }

        // Disappeared objects; a deleted folder covers its descendants
        let mut gone_local = HashSet::new();
        let mut gone_remote = HashSet::new();
        for node in stored_tree.dfs().into_iter().skip(1) {
            let stored_node = stored_tree.item(node);
            let id = stored_node.mapped.remote_id();
            let parent = stored_tree.parent(node).filter(|p| *p != ObjectTree::<StoredNode>::ROOT);

            if !seen_local.contains(id) {
                gone_local.insert(node);
                if !parent.is_some_and(|p| gone_local.contains(&p)) {
                    pairs.entry(id.clone()).or_default().local = Some((
                        LocalHandle::new(&stored_node.local_path, stored_node.mapped.is_folder()),
                        MetaDataChange::Deleted,
                    ));
                }
            }
            if !seen_remote.contains(id) {
                gone_remote.insert(node);
                if !parent.is_some_and(|p| gone_remote.contains(&p)) {
                    pairs.entry(id.clone()).or_default().remote =
                        Some((RemoteHandle::Deleted { id: id.clone() }, MetaDataChange::Deleted));
                }
            }
            if !gone_local.contains(&node)
                && !gone_remote.contains(&node)
                && !local_changed.contains(id)
                && !remote_changed.contains(id)
            {
                events.unchanged += 1;
            }

            if pairs.get(id).is_some_and(MergePair::has_change) {
                events.merge_order.push(id.clone());
            } else {
                pairs.remove(id);
            }
        }
        events.merge_map = pairs;

        events.creation_events = self.merge_creations(remote_creations, local_creations);
        debug!(
            creations = events.creation_events.len(),
            changes = events.merge_map.len(),
            unchanged = events.unchanged,
            "Crawl compared"
        );
        Ok(events)
    }

    /// Tree of stored mappings below the root mapping, with local paths
    fn stored_tree(
        &self,
        root_id: &RemoteId,
        stored: &[MappedObject],
    ) -> Result<ObjectTree<StoredNode>, DomainError> {
        let mut children: HashMap<&RemoteId, Vec<&MappedObject>> = HashMap::new();
        let mut root = None;
        for mapped in stored {
            if mapped.remote_id() == root_id {
                root = Some(mapped.clone());
            } else if let Some(parent) = mapped.parent_id() {
                children.entry(parent).or_default().push(mapped);
            }
        }
        let root = root.ok_or_else(|| {
            DomainError::ValidationFailed(format!("no mapping for the remote root {root_id}"))
        })?;

        let mut tree = ObjectTree::new(StoredNode {
            mapped: root,
            local_path: self.matcher.local_root().as_path().to_path_buf(),
        });
        let mut stack = vec![ObjectTree::<StoredNode>::ROOT];
        while let Some(node) = stack.pop() {
            let id = tree.item(node).mapped.remote_id().clone();
            let base = tree.item(node).local_path.clone();
            let mut kids = children.remove(&id).unwrap_or_default();
            kids.sort_by(|a, b| a.name().cmp(b.name()));
            for kid in kids {
                let child = tree.add_child(
                    node,
                    StoredNode {
                        mapped: kid.clone(),
                        local_path: base.join(kid.name()),
                    },
                );
                stack.push(child);
            }
        }
        Ok(tree)
    }

    /// Assigns local nodes to stored mappings
    ///
    /// GUIDs win; entries without a GUID fall back to the stored path. When
    /// several entries carry the same GUID (copies) the one at the stored
    /// path keeps the mapping and the others count as new.
    fn match_local(
        &self,
        local: &ObjectTree<LocalNode>,
        stored_tree: &ObjectTree<StoredNode>,
        by_id: &HashMap<RemoteId, NodeId>,
    ) -> HashMap<NodeId, RemoteId> {
        let mut by_guid: HashMap<LocalGuid, &RemoteId> = HashMap::new();
        let mut by_path: HashMap<&PathBuf, &RemoteId> = HashMap::new();
        for node in stored_tree.dfs().into_iter().skip(1) {
            let item = stored_tree.item(node);
            by_guid.insert(item.mapped.guid(), item.mapped.remote_id());
            by_path.insert(&item.local_path, item.mapped.remote_id());
        }

        let mut candidates: HashMap<&RemoteId, Vec<NodeId>> = HashMap::new();
        for node in local.dfs().into_iter().skip(1) {
            let item = local.item(node);
            let id = match item.guid {
                Some(guid) => by_guid.get(&guid).copied(),
                None => by_path.get(&item.entry.path).copied(),
            };
            if let Some(id) = id {
                candidates.entry(id).or_default().push(node);
            }
        }

        let mut assigned = HashMap::new();
        for (id, nodes) in candidates {
            let stored_path = &stored_tree.item(by_id[id]).local_path;
            let chosen = nodes
                .iter()
                .copied()
                .find(|n| &local.item(*n).entry.path == stored_path)
                .unwrap_or(nodes[0]);
            assigned.insert(chosen, id.clone());
        }
        assigned
    }

    /// Creation events, pairing local and remote creations at the same path
    fn merge_creations(
        &self,
        remote_creations: Vec<RemoteObject>,
        local_creations: Vec<LocalEntry>,
    ) -> Vec<FileOrFolderEvent> {
        let mut local_by_path: HashMap<PathBuf, LocalEntry> = local_creations
            .iter()
            .map(|e| (e.path.clone(), e.clone()))
            .collect();

        let mut events = Vec::new();
        for object in remote_creations {
            let content = if object.is_document() && object.has_content_stream {
                ContentChange::Created
            } else {
                ContentChange::None
            };
            let local_path = object
                .path
                .as_ref()
                .and_then(|p| self.matcher.create_local_path(p).ok())
                .map(|p| p.into_path_buf());
            let Some(local_path) = local_path else {
                warn!(id = %object.id, "Remote object has no path below the sync root");
                continue;
            };

            let mut event = FileOrFolderEvent::remote(
                RemoteHandle::Object(object),
                MetaDataChange::Created,
                content,
                EventSource::Crawler,
            );
            if let Some(entry) = local_by_path.remove(&local_path) {
                event = event.with_local(
                    LocalHandle::new(&entry.path, entry.is_directory),
                    MetaDataChange::Created,
                    if entry.is_directory {
                        ContentChange::None
                    } else {
                        ContentChange::Created
                    },
                );
            }
            events.push(event);
        }

        for entry in local_creations {
            if local_by_path.remove(&entry.path).is_none() {
                continue;
            }
            let content = if entry.is_directory {
                ContentChange::None
            } else {
                ContentChange::Created
            };
            events.push(FileOrFolderEvent::local(
                LocalHandle::new(&entry.path, entry.is_directory),
                MetaDataChange::Created,
                content,
                EventSource::Crawler,
            ));
        }
        events
    }
}
