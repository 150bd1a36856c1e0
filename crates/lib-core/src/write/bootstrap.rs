use knotd_store::{Draft, Guid, Linkage, Store, Timestamp};
use smol_str::SmolStr;

use crate::error::EngineError;

pub const ROOT_NAMESPACE: &str = "ROOT_NAMESPACE";
pub const BOOTSTRAP_NAMESPACE: &str = "BOOTSTRAP_NAMESPACE";
pub const HAS_KEY: &str = "HAS_KEY";
pub const BOOTSTRAP_ANCHOR: &str = "BOOTSTRAP_ANCHOR";

/// The type namespace lives in the graph itself: a type name resolves by
/// following naming links (`typeguid = HAS_KEY`, `left` = a namespace,
/// `right` = the named node, `name` = the type name).
///
/// The three well-known guids are cached per store handle and must be
/// invalidated on checkpoint rollback, because they may have been assigned
/// by the very transaction being rolled back.
#[derive(Debug, Default)]
pub struct Bootstrap {
    has_key: Option<Guid>,
    root_namespace: Option<Guid>,
    bootstrap_namespace: Option<Guid>,
}

impl Bootstrap {
    pub fn new() -> Bootstrap {
        Bootstrap::default()
    }

    pub fn invalidate(&mut self) {
        *self = Bootstrap::default();
    }

    pub fn has_key_guid(&self) -> Option<Guid> {
        self.has_key
    }

    fn named_node(store: &dyn Store, name: &str) -> Option<Guid> {
        store
            .ids_with_name(name)
            .into_iter()
            .filter_map(|id| store.read(id).ok())
            .find(|p| p.is_live() && p.previous().is_none())
            .map(|p| p.guid())
    }

    /// Locate the namespace primitives if they exist. Idempotent; cheap
    /// once cached.
    pub fn initialize(&mut self, store: &dyn Store) -> bool {
        if self.has_key.is_some() {
            return true;
        }
        let (Some(has_key), Some(root), Some(boot)) = (
            Self::named_node(store, HAS_KEY),
            Self::named_node(store, ROOT_NAMESPACE),
            Self::named_node(store, BOOTSTRAP_NAMESPACE),
        ) else {
            return false;
        };
        self.has_key = Some(has_key);
        self.root_namespace = Some(root);
        self.bootstrap_namespace = Some(boot);
        true
    }

    fn is_namespace(&self, guid: Guid) -> bool {
        Some(guid) == self.root_namespace || Some(guid) == self.bootstrap_namespace
    }

    /// `type="name"` resolution: the `right` of a live naming link whose
    /// `left` is one of the namespaces.
    pub fn type_guid_from_name(&mut self, store: &dyn Store, name: &str) -> Option<Guid> {
        if !self.initialize(store) {
            return None;
        }
        let has_key = self.has_key?;
        store
            .ids_with_name(name)
            .into_iter()
            .filter_map(|id| store.read(id).ok())
            .find(|p| {
                p.is_live()
                    && p.linkage(Linkage::Typeguid) == Some(has_key)
                    && p.linkage(Linkage::Left).is_some_and(|ns| self.is_namespace(ns))
            })
            .and_then(|p| p.linkage(Linkage::Right))
    }

    /// The reverse walk: what is this typeguid called?
    pub fn type_value_from_guid(&mut self, store: &dyn Store, guid: Guid) -> Option<SmolStr> {
        if !self.initialize(store) {
            return None;
        }
        let has_key = self.has_key?;
        store
            .ids_with_linkage(Linkage::Right, guid)
            .into_iter()
            .filter_map(|id| store.read(id).ok())
            .find(|p| {
                p.is_live()
                    && p.linkage(Linkage::Typeguid) == Some(has_key)
                    && p.linkage(Linkage::Left).is_some_and(|ns| self.is_namespace(ns))
            })
            .and_then(|p| p.name().map(SmolStr::new))
    }

    /// Create the namespace primitives if missing. Runs at the front of
    /// the first write; the fixed order keeps restores byte-identical.
    pub fn ensure(&mut self, store: &mut dyn Store, now: Timestamp) -> Result<(), EngineError> {
        if self.initialize(store) {
            return Ok(());
        }
        let (_, root) = store.alloc(Draft::node(now).with_name(ROOT_NAMESPACE))?;
        let (_, has_key) = store.alloc(Draft::node(now).with_name(HAS_KEY))?;
        let (_, boot) = store.alloc(Draft::node(now).with_name(BOOTSTRAP_NAMESPACE))?;
        let (_, anchor) = store.alloc(Draft::node(now).with_name(BOOTSTRAP_ANCHOR))?;
        for ns in [root, boot] {
            store.alloc(
                Draft::node(now)
                    .with_linkage(Linkage::Typeguid, has_key)
                    .with_linkage(Linkage::Left, anchor)
                    .with_linkage(Linkage::Right, ns),
            )?;
        }
        self.has_key = Some(has_key);
        self.root_namespace = Some(root);
        self.bootstrap_namespace = Some(boot);
        Ok(())
    }

    /// Intern a type name: resolve it, or grow the root namespace by a
    /// fresh node and its naming link.
    pub fn intern_type(
        &mut self,
        store: &mut dyn Store,
        name: &str,
        now: Timestamp,
    ) -> Result<Guid, EngineError> {
        self.ensure(store, now)?;
        if let Some(existing) = self.type_guid_from_name(store, name) {
            return Ok(existing);
        }
        let has_key = self
            .has_key
            .ok_or_else(|| EngineError::internal("bootstrap vanished during intern"))?;
        let root = self
            .root_namespace
            .ok_or_else(|| EngineError::internal("bootstrap vanished during intern"))?;
        let (_, node) = store.alloc(Draft::node(now))?;
        store.alloc(
            Draft::node(now)
                .with_name(name)
                .with_linkage(Linkage::Typeguid, has_key)
                .with_linkage(Linkage::Left, root)
                .with_linkage(Linkage::Right, node),
        )?;
        Ok(node)
    }
}
