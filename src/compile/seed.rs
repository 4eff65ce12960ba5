//! Seeding the star table from an observed catalog.

use tracing::info;

use crate::error::Result;
use crate::store::{CatalogId, CatalogStarId, CatalogStore, StarId};

/// Turn every unlinked catalog star of `catalog` into a new master star and
/// commit. With `reset`, stars already linked from this catalog are deleted
/// first (clearing every link to them). Returns the number of stars created.
pub fn seed_star_table<S: CatalogStore + ?Sized>(
    store: &mut S,
    catalog: CatalogId,
    reset: bool,
) -> Result<usize> {
    if reset {
        reset_star_table(store, catalog)?;
    }
    let unlinked: Vec<CatalogStarId> = store
        .catalog_star_ids(catalog)?
        .into_iter()
        .filter(|id| matches!(store.catalog_star(*id), Ok(cs) if cs.star.is_none()))
        .collect();
    for &cs in &unlinked {
        store.create_star_from(cs)?;
    }
    store.commit()?;
    info!("Seeded {} stars from catalog {}", unlinked.len(), catalog);
    Ok(unlinked.len())
}

/// Delete the master stars linked from `catalog`'s catalog stars. Returns
/// the number of stars deleted. Does not commit.
pub fn reset_star_table<S: CatalogStore + ?Sized>(store: &mut S, catalog: CatalogId) -> Result<usize> {
    let mut stars: Vec<StarId> = Vec::new();
    for id in store.catalog_star_ids(catalog)? {
        if let Some(star) = store.catalog_star(id)?.star {
            stars.push(star);
        }
    }
    stars.sort_unstable();
    stars.dedup();
    store.delete_stars(&stars)?;
    Ok(stars.len())
}
