//! The write engine: key/unique cluster resolution against the existing
//! graph, then the insert phase, all-or-nothing per request.

pub mod align;
pub mod bootstrap;
pub mod cluster;

use knotd_store::{Dateline, LocalId, Store, Timestamp};

pub use bootstrap::Bootstrap;

use crate::constraint::ConstraintSet;
use crate::error::EngineError;
use crate::value::Value;

/// Run a completed write constraint tree: bootstrap the namespace if
/// needed, resolve key clusters to existing guids, assert unique
/// clusters, then align bottom-up. On any failure the store rolls back
/// to the pre-request checkpoint and the cached bootstrap guids are
/// invalidated (they may have been created by the aborted transaction).
pub fn execute(
    set: &mut ConstraintSet,
    store: &mut dyn Store,
    boot: &mut Bootstrap,
    now: Timestamp,
) -> Result<(Value, Dateline), EngineError> {
    let mark = store.checkpoint();
    match phases(set, store, boot, now) {
        Ok(value) => {
            let horizon = store.horizon().prev().unwrap_or(LocalId::ZERO);
            Ok((value, Dateline::single(store.instance_id(), horizon)))
        }
        Err(err) => {
            store.rollback_to(mark)?;
            boot.invalidate();
            Err(err)
        }
    }
}

fn phases(
    set: &mut ConstraintSet,
    store: &mut dyn Store,
    boot: &mut Bootstrap,
    now: Timestamp,
) -> Result<Value, EngineError> {
    boot.ensure(store, now)?;
    cluster::resolve_keys(set, store, boot, now)?;
    cluster::check_unique(set, store, boot, now)?;

    let mut cx = align::AlignCx {
        store,
        boot,
        now,
        wrote_any: false,
    };
    let root = set.root();
    let (_, value) = align::align(set, root, &mut cx, None)?;
    store.commit()?;
    Ok(value)
}
