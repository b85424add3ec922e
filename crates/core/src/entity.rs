//! Entity trait: rows with a stable identity.

/// A persisted row addressed by a copyable key.
///
/// The in-memory store keys its tables by `Entity::id`.
pub trait Entity {
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> Self::Id;
}
