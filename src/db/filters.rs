//! Filter (tenant) configuration stored in the `config:filters` hash.

use super::{keys, Store};
use crate::model::Filter;
use anyhow::{bail, Result};
use tracing::instrument;

/// Current filter set: the default unbound filter first, then the stored
/// filters ordered by name.
#[instrument(skip_all)]
pub async fn load_filters(store: &dyn Store, default_filter: &str) -> Result<Vec<Filter>> {
    let mut filters = vec![Filter::unbound(default_filter)];
    for (name, handle) in store.hash_get_all(keys::FILTERS).await? {
        if name == default_filter {
            continue;
        }
        let handle = handle.trim();
        filters.push(Filter {
            name,
            handle: (!handle.is_empty()).then(|| handle.to_string()),
        });
    }
    Ok(filters)
}

/// Create `name`, optionally bound to `handle`. Re-binding an existing filter
/// to a different handle is refused; repeating the same binding is a no-op.
#[instrument(skip_all)]
pub async fn bind_filter(
    store: &dyn Store,
    default_filter: &str,
    name: &str,
    handle: Option<&str>,
) -> Result<Filter> {
    let name = name.trim();
    if name.is_empty() {
        bail!("filter name must be non-empty");
    }
    if name == default_filter {
        bail!("{} is the built-in unbound filter", default_filter);
    }
    let handle = handle
        .map(|h| h.trim().trim_start_matches('@'))
        .filter(|h| !h.is_empty());

    let existing = store
        .hash_get_all(keys::FILTERS)
        .await?
        .into_iter()
        .find(|(field, _)| field == name);
    if let Some((_, current)) = existing {
        let current = current.trim();
        if current != handle.unwrap_or("") {
            bail!(
                "filter {} is already bound to {:?}; remove it before rebinding",
                name,
                (!current.is_empty()).then_some(current)
            );
        }
    } else {
        store
            .hash_set(keys::FILTERS, name, handle.unwrap_or(""))
            .await?;
    }

    Ok(Filter {
        name: name.to_string(),
        handle: handle.map(str::to_string),
    })
}

/// Remove a filter's configuration. Its records and dedup set are left alone.
#[instrument(skip_all)]
pub async fn unbind_filter(store: &dyn Store, name: &str) -> Result<bool> {
    store.hash_del(keys::FILTERS, name).await
}
