use crate::aggregator::ChannelSnapshot;
use crate::layout::ChannelLayout;
use cellwright_core::{EntryStatus, InventoryEntry, Location};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Points at one entry of one inventory generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryRef {
    /// Inventory generation the entry belongs to.
    pub generation: u64,
    /// Part type list the entry is in.
    pub part_type: String,
    /// Position in that list.
    pub index: usize,
}

/// Part type → located instances.
///
/// Every detection is its own entry: a part seen by two channels appears
/// twice. Entries keep the order in which the channels were snapshotted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Inventory {
    parts: BTreeMap<String, Vec<InventoryEntry>>,
    generation: u64,
}

impl Inventory {
    /// Incremented on every rebuild.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// All entries for a part type, in list order.
    pub fn entries(&self, part_type: &str) -> &[InventoryEntry] {
        self.parts.get(part_type).map_or(&[], Vec::as_slice)
    }

    /// Part types with at least one entry, sorted.
    pub fn part_types(&self) -> impl Iterator<Item = &str> {
        self.parts.keys().map(String::as_str)
    }

    /// First-fit selection: the first free entry accepted by `accept`.
    pub fn first_free_where(
        &self,
        part_type: &str,
        accept: impl Fn(&InventoryEntry) -> bool,
    ) -> Option<(EntryRef, &InventoryEntry)> {
        self.entries(part_type)
            .iter()
            .enumerate()
            .find(|(_, e)| e.is_free() && accept(e))
            .map(|(index, e)| {
                (
                    EntryRef {
                        generation: self.generation,
                        part_type: part_type.to_string(),
                        index,
                    },
                    e,
                )
            })
    }

    /// The first free entry of a part type.
    pub fn first_free(&self, part_type: &str) -> Option<(EntryRef, &InventoryEntry)> {
        self.first_free_where(part_type, |_| true)
    }

    /// Resolve a reference. `None` if it points at another generation.
    pub fn get(&self, entry: &EntryRef) -> Option<&InventoryEntry> {
        if entry.generation != self.generation {
            return None;
        }
        self.parts.get(&entry.part_type)?.get(entry.index)
    }

    /// Commit to an entry. Returns false if the reference is stale, unknown,
    /// or already processed.
    pub fn mark_processed(&mut self, entry: &EntryRef) -> bool {
        if entry.generation != self.generation {
            return false;
        }
        match self
            .parts
            .get_mut(&entry.part_type)
            .and_then(|v| v.get_mut(entry.index))
        {
            Some(e) if e.is_free() => {
                e.status = EntryStatus::Processed;
                true
            }
            _ => false,
        }
    }

    /// Entries of a part type not yet used by a placement.
    pub fn free_count(&self, part_type: &str) -> usize {
        self.entries(part_type).iter().filter(|e| e.is_free()).count()
    }

    /// Entries of every part type.
    pub fn total_count(&self) -> usize {
        self.parts.values().map(Vec::len).sum()
    }

    /// Bins of the layout in which no part is currently detected.
    pub fn empty_bins(&self, layout: &ChannelLayout) -> Vec<u8> {
        let occupied: BTreeSet<u8> = self
            .parts
            .values()
            .flatten()
            .filter_map(|e| e.location.bin())
            .collect();
        layout
            .bins()
            .into_iter()
            .filter(|b| !occupied.contains(b))
            .collect()
    }
}

/// Rebuilds the inventory from aggregator snapshots and publishes it.
///
/// The published inventory is swapped as a whole; readers holding an older
/// `Arc<Inventory>` keep a consistent view.
pub struct InventoryBuilder {
    layout: Arc<ChannelLayout>,
    published: RwLock<Arc<Inventory>>,
}

impl InventoryBuilder {
    /// Builder for `layout`, starting from an empty inventory.
    pub fn new(layout: Arc<ChannelLayout>) -> Self {
        Self {
            layout,
            published: RwLock::new(Arc::new(Inventory::default())),
        }
    }

    /// Layout used to derive locations.
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Replace the inventory with one derived from `snapshots`.
    ///
    /// Statuses carry over per `(part type, location)` group when the group's
    /// size is unchanged, so re-reading identical snapshots never resets an
    /// entry the scheduler already committed to. A group whose size changed
    /// starts over as free.
    pub fn rebuild(&self, snapshots: &[ChannelSnapshot]) -> Arc<Inventory> {
        let mut published = self.published.write();
        let previous = published.clone();

        let mut parts: BTreeMap<String, Vec<InventoryEntry>> = BTreeMap::new();
        for snapshot in snapshots {
            for detection in snapshot.batch.iter() {
                parts
                    .entry(detection.part_type.clone())
                    .or_default()
                    .push(InventoryEntry {
                        part_type: detection.part_type.clone(),
                        world_pose: detection.world_pose,
                        channel_id: snapshot.channel_id.clone(),
                        location: self
                            .layout
                            .locate(&snapshot.channel_id, &detection.sensor_pose),
                        status: EntryStatus::Free,
                    });
            }
        }

        for (part_type, entries) in &mut parts {
            carry_statuses(previous.entries(part_type), entries);
        }

        let inventory = Arc::new(Inventory {
            parts,
            generation: previous.generation + 1,
        });
        debug!(
            generation = inventory.generation,
            entries = inventory.total_count(),
            "Inventory rebuilt"
        );
        *published = inventory.clone();
        inventory
    }

    /// The most recently published inventory.
    pub fn current(&self) -> Arc<Inventory> {
        self.published.read().clone()
    }

    /// Commit to an entry of the published inventory.
    pub fn mark_processed(&self, entry: &EntryRef) -> bool {
        let mut published = self.published.write();
        Arc::make_mut(&mut published).mark_processed(entry)
    }
}

fn carry_statuses(previous: &[InventoryEntry], current: &mut [InventoryEntry]) {
    let mut old: HashMap<&Location, Vec<EntryStatus>> = HashMap::new();
    for e in previous {
        old.entry(&e.location).or_default().push(e.status);
    }
    let mut sizes: HashMap<Location, usize> = HashMap::new();
    for e in current.iter() {
        *sizes.entry(e.location.clone()).or_default() += 1;
    }
    let mut seen: HashMap<Location, usize> = HashMap::new();
    for e in current.iter_mut() {
        let Some(statuses) = old.get(&e.location) else {
            continue;
        };
        if statuses.len() != sizes[&e.location] {
            continue;
        }
        let k = seen.entry(e.location.clone()).or_default();
        e.status = statuses[*k];
        *k += 1;
    }
}
