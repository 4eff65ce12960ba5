//! In-memory [`CatalogStore`] with an undo journal.
//!
//! Tables are ordered maps keyed by ID, with secondary indexes for natural
//! keys, catalog membership, star links and a [`SkyIndex`] over master
//! stars. Every mutation goes through a raw helper that keeps those indexes
//! consistent, and the public write path records the inverse operation in a
//! journal. `commit` drops the journal; `rollback` replays it backwards.
//! ID counters are never rolled back, so IDs are not reused.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use super::{
    Bandpass, BandpassId, Catalog, CatalogId, CatalogStar, CatalogStarId, CatalogStore, EdgeId,
    IntercalEdge, NewCatalog, NewCatalogStar, Observation, Star, StarId, Unique,
};
use crate::error::{Error, Result};
use crate::geometry::{Footprint, SkyPoint};
use crate::meta::Metadata;
use crate::skyindex::SkyIndex;

/// Inverse of one journaled write.
#[derive(Debug, Clone)]
enum Undo {
    CatalogInserted(CatalogId),
    /// A catalog was modified or deleted; put this version back.
    CatalogRestored(Box<Catalog>),
    BandpassInserted(BandpassId),
    CatalogStarInserted(CatalogStarId),
    CatalogStarRemoved(Box<CatalogStar>),
    ObservationSet {
        key: (CatalogStarId, BandpassId),
        previous: Option<Observation>,
    },
    StarInserted(StarId),
    StarRemoved(Star),
    Link {
        catalog_star: CatalogStarId,
        previous: Option<StarId>,
    },
    EdgeInserted(EdgeId),
    /// An edge was modified or deleted; put this version back.
    EdgeRestored(IntercalEdge),
}

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct IdCounters {
    pub catalog: u64,
    pub catalog_star: u64,
    pub star: u64,
    pub bandpass: u64,
    pub edge: u64,
}

impl IdCounters {
    fn bump(counter: &mut u64) -> u64 {
        *counter += 1;
        *counter
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub(super) catalogs: BTreeMap<CatalogId, Catalog>,
    catalog_keys: HashMap<(String, String), CatalogId>,
    pub(super) bandpasses: BTreeMap<BandpassId, Bandpass>,
    bandpass_keys: HashMap<(String, String), BandpassId>,
    pub(super) catalog_stars: BTreeMap<CatalogStarId, CatalogStar>,
    catalog_members: HashMap<CatalogId, BTreeSet<CatalogStarId>>,
    pub(super) observations: BTreeMap<(CatalogStarId, BandpassId), Observation>,
    pub(super) stars: BTreeMap<StarId, Star>,
    star_members: HashMap<StarId, Vec<CatalogStarId>>,
    /// Linked catalog stars per catalog; entries are dropped at zero.
    linked_counts: BTreeMap<CatalogId, usize>,
    star_index: SkyIndex,
    pub(super) edges: BTreeMap<EdgeId, IntercalEdge>,
    edge_keys: HashMap<(CatalogId, CatalogId, BandpassId), EdgeId>,
    pub(super) next_ids: IdCounters,
    journal: Vec<Undo>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn catalog_count(&self) -> usize {
        self.catalogs.len()
    }

    pub fn catalog_star_count(&self) -> usize {
        self.catalog_stars.len()
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    // ── Raw mutations (index maintenance, no journaling) ────────────────

    pub(super) fn raw_put_catalog(&mut self, catalog: Catalog) {
        self.catalog_keys.insert(catalog.natural_key(), catalog.id);
        self.catalog_members.entry(catalog.id).or_default();
        self.catalogs.insert(catalog.id, catalog);
    }

    fn raw_remove_catalog(&mut self, id: CatalogId) -> Option<Catalog> {
        let catalog = self.catalogs.remove(&id)?;
        self.catalog_keys.remove(&catalog.natural_key());
        self.catalog_members.remove(&id);
        self.linked_counts.remove(&id);
        Some(catalog)
    }

    pub(super) fn raw_put_bandpass(&mut self, bandpass: Bandpass) {
        self.bandpass_keys.insert(bandpass.natural_key(), bandpass.id);
        self.bandpasses.insert(bandpass.id, bandpass);
    }

    fn raw_remove_bandpass(&mut self, id: BandpassId) {
        if let Some(bandpass) = self.bandpasses.remove(&id) {
            self.bandpass_keys.remove(&bandpass.natural_key());
        }
    }

    /// Insert a catalog star; an existing link on the record is re-established.
    pub(super) fn raw_put_catalog_star(&mut self, mut catalog_star: CatalogStar) {
        let link = catalog_star.star.take();
        let id = catalog_star.id;
        self.catalog_members
            .entry(catalog_star.catalog)
            .or_default()
            .insert(id);
        self.catalog_stars.insert(id, catalog_star);
        if link.is_some() {
            self.raw_set_link(id, link);
        }
    }

    fn raw_remove_catalog_star(&mut self, id: CatalogStarId) -> Option<CatalogStar> {
        self.raw_set_link(id, None);
        let catalog_star = self.catalog_stars.remove(&id)?;
        if let Some(members) = self.catalog_members.get_mut(&catalog_star.catalog) {
            members.remove(&id);
        }
        Some(catalog_star)
    }

    /// Point a catalog star at `star` (or unlink it). Returns the previous link.
    fn raw_set_link(&mut self, id: CatalogStarId, star: Option<StarId>) -> Option<StarId> {
        let catalog_star = self.catalog_stars.get_mut(&id)?;
        let catalog = catalog_star.catalog;
        let previous = std::mem::replace(&mut catalog_star.star, star);

        if let Some(old) = previous {
            if let Some(members) = self.star_members.get_mut(&old) {
                members.retain(|&m| m != id);
            }
            if let Some(count) = self.linked_counts.get_mut(&catalog) {
                *count -= 1;
                if *count == 0 {
                    self.linked_counts.remove(&catalog);
                }
            }
        }
        if let Some(new) = star {
            self.star_members.entry(new).or_default().push(id);
            *self.linked_counts.entry(catalog).or_insert(0) += 1;
        }
        previous
    }

    pub(super) fn raw_put_star(&mut self, star: Star) {
        self.star_index.insert(star.id.0, star.coord);
        self.star_members.entry(star.id).or_default();
        self.stars.insert(star.id, star);
    }

    /// Remove a star that has no linked catalog stars left.
    fn raw_remove_star(&mut self, id: StarId) -> Option<Star> {
        let star = self.stars.remove(&id)?;
        self.star_index.remove(id.0);
        self.star_members.remove(&id);
        Some(star)
    }

    pub(super) fn raw_put_edge(&mut self, edge: IntercalEdge) {
        self.edge_keys
            .insert((edge.from, edge.to, edge.bandpass), edge.id);
        self.edges.insert(edge.id, edge);
    }

    fn raw_remove_edge(&mut self, id: EdgeId) -> Option<IntercalEdge> {
        let edge = self.edges.remove(&id)?;
        self.edge_keys.remove(&(edge.from, edge.to, edge.bandpass));
        Some(edge)
    }

    fn raw_set_observation(
        &mut self,
        key: (CatalogStarId, BandpassId),
        observation: Option<Observation>,
    ) -> Option<Observation> {
        match observation {
            Some(obs) => self.observations.insert(key, obs),
            None => self.observations.remove(&key),
        }
    }

    // ── Journaled helpers ───────────────────────────────────────────────

    fn link(&mut self, id: CatalogStarId, star: Option<StarId>) {
        let previous = self.raw_set_link(id, star);
        if previous != star {
            self.journal.push(Undo::Link {
                catalog_star: id,
                previous,
            });
        }
    }

    fn remove_edge_journaled(&mut self, id: EdgeId) -> Result<()> {
        let edge = self.raw_remove_edge(id).ok_or(Error::EdgeNotFound(id))?;
        self.journal.push(Undo::EdgeRestored(edge));
        Ok(())
    }

    fn catalog_mut(&mut self, id: CatalogId) -> Result<&mut Catalog> {
        let catalog = self.catalogs.get(&id).ok_or(Error::CatalogNotFound(id))?;
        self.journal
            .push(Undo::CatalogRestored(Box::new(catalog.clone())));
        self.catalogs.get_mut(&id).ok_or(Error::CatalogNotFound(id))
    }

    fn undo(&mut self, op: Undo) {
        match op {
            Undo::CatalogInserted(id) => {
                self.raw_remove_catalog(id);
            }
            Undo::CatalogRestored(catalog) => self.raw_put_catalog(*catalog),
            Undo::BandpassInserted(id) => self.raw_remove_bandpass(id),
            Undo::CatalogStarInserted(id) => {
                self.raw_remove_catalog_star(id);
            }
            Undo::CatalogStarRemoved(catalog_star) => self.raw_put_catalog_star(*catalog_star),
            Undo::ObservationSet { key, previous } => {
                self.raw_set_observation(key, previous);
            }
            Undo::StarInserted(id) => {
                self.raw_remove_star(id);
            }
            Undo::StarRemoved(star) => self.raw_put_star(star),
            Undo::Link {
                catalog_star,
                previous,
            } => {
                self.raw_set_link(catalog_star, previous);
            }
            Undo::EdgeInserted(id) => {
                self.raw_remove_edge(id);
            }
            Undo::EdgeRestored(edge) => self.raw_put_edge(edge),
        }
    }
}

impl CatalogStore for MemoryStore {
    fn find_or_create_catalog(&mut self, new: NewCatalog) -> Result<(CatalogId, bool)> {
        if let Some(&id) = self
            .catalog_keys
            .get(&(new.name.clone(), new.instrument.clone()))
        {
            return Ok((id, false));
        }
        let id = CatalogId(IdCounters::bump(&mut self.next_ids.catalog));
        self.raw_put_catalog(Catalog {
            id,
            name: new.name,
            instrument: new.instrument,
            footprint: new.footprint,
            meta: new.meta,
        });
        self.journal.push(Undo::CatalogInserted(id));
        Ok((id, true))
    }

    fn find_catalog(&self, name: &str, instrument: &str) -> Option<CatalogId> {
        self.catalog_keys
            .get(&(name.to_string(), instrument.to_string()))
            .copied()
    }

    fn catalog(&self, id: CatalogId) -> Result<&Catalog> {
        self.catalogs.get(&id).ok_or(Error::CatalogNotFound(id))
    }

    fn catalog_ids(&self) -> Vec<CatalogId> {
        self.catalogs.keys().copied().collect()
    }

    fn set_catalog_meta(&mut self, id: CatalogId, meta: Metadata) -> Result<()> {
        self.catalog_mut(id)?.meta = meta;
        Ok(())
    }

    fn set_catalog_footprint(&mut self, id: CatalogId, footprint: Footprint) -> Result<()> {
        self.catalog_mut(id)?.footprint = footprint;
        Ok(())
    }

    fn delete_catalog(&mut self, id: CatalogId) -> Result<()> {
        if !self.catalogs.contains_key(&id) {
            return Err(Error::CatalogNotFound(id));
        }

        let edge_ids: Vec<EdgeId> = self
            .edges
            .values()
            .filter(|e| e.from == id || e.to == id)
            .map(|e| e.id)
            .collect();
        for edge in &edge_ids {
            self.remove_edge_journaled(*edge)?;
        }

        let members: Vec<CatalogStarId> = self
            .catalog_members
            .get(&id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        let mut n_obs = 0usize;
        for cs in &members {
            let keys: Vec<(CatalogStarId, BandpassId)> = self
                .observations
                .range((*cs, BandpassId(0))..=(*cs, BandpassId(u64::MAX)))
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                let previous = self.raw_set_observation(key, None);
                self.journal.push(Undo::ObservationSet { key, previous });
                n_obs += 1;
            }
            self.link(*cs, None);
            if let Some(removed) = self.raw_remove_catalog_star(*cs) {
                self.journal
                    .push(Undo::CatalogStarRemoved(Box::new(removed)));
            }
        }

        if let Some(catalog) = self.raw_remove_catalog(id) {
            debug!(
                "Deleted {}: {} catalog stars, {} observations, {} edges",
                catalog,
                members.len(),
                n_obs,
                edge_ids.len()
            );
            self.journal.push(Undo::CatalogRestored(Box::new(catalog)));
        }
        Ok(())
    }

    fn find_or_create_bandpass(&mut self, name: &str, system: &str) -> Result<BandpassId> {
        if let Some(id) = self.find_bandpass(name, system) {
            return Ok(id);
        }
        let id = BandpassId(IdCounters::bump(&mut self.next_ids.bandpass));
        self.raw_put_bandpass(Bandpass {
            id,
            name: name.to_string(),
            system: system.to_string(),
        });
        self.journal.push(Undo::BandpassInserted(id));
        Ok(id)
    }

    fn find_bandpass(&self, name: &str, system: &str) -> Option<BandpassId> {
        self.bandpass_keys
            .get(&(name.to_string(), system.to_string()))
            .copied()
    }

    fn bandpass(&self, id: BandpassId) -> Result<&Bandpass> {
        self.bandpasses.get(&id).ok_or(Error::BandpassNotFound(id))
    }

    fn insert_catalog_stars(
        &mut self,
        catalog: CatalogId,
        stars: Vec<NewCatalogStar>,
    ) -> Result<Vec<CatalogStarId>> {
        if !self.catalogs.contains_key(&catalog) {
            return Err(Error::CatalogNotFound(catalog));
        }
        let mut ids = Vec::with_capacity(stars.len());
        for new in stars {
            let id = CatalogStarId(IdCounters::bump(&mut self.next_ids.catalog_star));
            self.raw_put_catalog_star(CatalogStar {
                id,
                catalog,
                x: new.x,
                y: new.y,
                coord: new.coord,
                cfrac: new.cfrac,
                star: None,
            });
            self.journal.push(Undo::CatalogStarInserted(id));
            ids.push(id);
        }
        Ok(ids)
    }

    fn insert_observations(&mut self, observations: Vec<Observation>) -> Result<()> {
        for obs in observations {
            if !self.catalog_stars.contains_key(&obs.catalog_star) {
                return Err(Error::CatalogStarNotFound(obs.catalog_star));
            }
            if !self.bandpasses.contains_key(&obs.bandpass) {
                return Err(Error::BandpassNotFound(obs.bandpass));
            }
            let key = (obs.catalog_star, obs.bandpass);
            let previous = self.raw_set_observation(key, Some(obs));
            self.journal.push(Undo::ObservationSet { key, previous });
        }
        Ok(())
    }

    fn catalog_star(&self, id: CatalogStarId) -> Result<&CatalogStar> {
        self.catalog_stars
            .get(&id)
            .ok_or(Error::CatalogStarNotFound(id))
    }

    fn catalog_star_ids(&self, catalog: CatalogId) -> Result<Vec<CatalogStarId>> {
        self.catalog_members
            .get(&catalog)
            .map(|m| m.iter().copied().collect())
            .ok_or(Error::CatalogNotFound(catalog))
    }

    fn observation(&self, star: CatalogStarId, bandpass: BandpassId) -> Option<&Observation> {
        self.observations.get(&(star, bandpass))
    }

    fn catalogs_observed_in(&self, bandpass: BandpassId) -> Vec<CatalogId> {
        let found: BTreeSet<CatalogId> = self
            .observations
            .values()
            .filter(|o| o.bandpass == bandpass)
            .filter_map(|o| self.catalog_stars.get(&o.catalog_star))
            .map(|cs| cs.catalog)
            .collect();
        found.into_iter().collect()
    }

    fn create_star_from(&mut self, origin: CatalogStarId) -> Result<StarId> {
        let coord = self.catalog_star(origin)?.coord;
        let id = StarId(IdCounters::bump(&mut self.next_ids.star));
        self.raw_put_star(Star { id, coord, origin });
        self.journal.push(Undo::StarInserted(id));
        self.link(origin, Some(id));
        Ok(id)
    }

    fn star(&self, id: StarId) -> Result<&Star> {
        self.stars.get(&id).ok_or(Error::StarNotFound(id))
    }

    fn star_count(&self) -> usize {
        self.stars.len()
    }

    fn stars_near(&self, center: SkyPoint, radius_deg: f64) -> Vec<StarId> {
        self.star_index
            .query(center, radius_deg)
            .into_iter()
            .map(|(key, _)| StarId(key))
            .collect()
    }

    fn link_catalog_star(&mut self, catalog_star: CatalogStarId, star: StarId) -> Result<()> {
        if !self.catalog_stars.contains_key(&catalog_star) {
            return Err(Error::CatalogStarNotFound(catalog_star));
        }
        if !self.stars.contains_key(&star) {
            return Err(Error::StarNotFound(star));
        }
        self.link(catalog_star, Some(star));
        Ok(())
    }

    fn star_members(&self, star: StarId) -> Result<&[CatalogStarId]> {
        self.star_members
            .get(&star)
            .map(Vec::as_slice)
            .ok_or(Error::StarNotFound(star))
    }

    fn compiled_catalog_ids(&self) -> Vec<CatalogId> {
        self.linked_counts.keys().copied().collect()
    }

    fn delete_stars(&mut self, stars: &[StarId]) -> Result<()> {
        for &id in stars {
            let members = self.star_members(id)?.to_vec();
            for cs in members {
                self.link(cs, None);
            }
            if let Some(star) = self.raw_remove_star(id) {
                self.journal.push(Undo::StarRemoved(star));
            }
        }
        Ok(())
    }

    fn clear_stars(&mut self) -> Result<()> {
        let all: Vec<StarId> = self.stars.keys().copied().collect();
        self.delete_stars(&all)
    }

    fn insert_edge(
        &mut self,
        from: CatalogId,
        to: CatalogId,
        bandpass: BandpassId,
    ) -> Result<EdgeId> {
        self.catalog(from)?;
        self.catalog(to)?;
        self.bandpass(bandpass)?;
        if IntercalEdge::edge_exists(&*self, from, to, bandpass) {
            return Err(Error::DuplicateEdge { from, to, bandpass });
        }
        let id = EdgeId(IdCounters::bump(&mut self.next_ids.edge));
        self.raw_put_edge(IntercalEdge {
            id,
            from,
            to,
            bandpass,
            delta: None,
            delta_err: None,
        });
        self.journal.push(Undo::EdgeInserted(id));
        Ok(id)
    }

    fn find_edge(&self, from: CatalogId, to: CatalogId, bandpass: BandpassId) -> Option<EdgeId> {
        self.edge_keys.get(&(from, to, bandpass)).copied()
    }

    fn edge(&self, id: EdgeId) -> Result<&IntercalEdge> {
        self.edges.get(&id).ok_or(Error::EdgeNotFound(id))
    }

    fn edges(&self, bandpass: BandpassId) -> Vec<IntercalEdge> {
        self.edges
            .values()
            .filter(|e| e.bandpass == bandpass)
            .copied()
            .collect()
    }

    fn set_edge_delta(&mut self, id: EdgeId, delta: f64, delta_err: f64) -> Result<()> {
        let edge = self.edges.get_mut(&id).ok_or(Error::EdgeNotFound(id))?;
        let previous = *edge;
        edge.delta = Some(delta);
        edge.delta_err = Some(delta_err);
        self.journal.push(Undo::EdgeRestored(previous));
        Ok(())
    }

    fn delete_edge(&mut self, id: EdgeId) -> Result<()> {
        self.remove_edge_journaled(id)
    }

    fn commit(&mut self) -> Result<()> {
        if !self.journal.is_empty() {
            debug!("Committing {} changes", self.journal.len());
        }
        self.journal.clear();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let n = self.journal.len();
        while let Some(op) = self.journal.pop() {
            self.undo(op);
        }
        if n > 0 {
            debug!("Rolled back {} changes", n);
        }
        Ok(())
    }

    fn pending_changes(&self) -> usize {
        self.journal.len()
    }
}
