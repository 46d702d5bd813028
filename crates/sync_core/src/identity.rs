//! Stable synthetic identities for menu items.
//!
//! The pipeline never issues item keys. Later stages find the item they update by
//! repeating its original-language name under the same category, so identity is
//! derived from that name, with the item's position as the fallback key when the
//! name is blank or shared by several items.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use shared::domain::ItemId;

/// Trims, collapses inner whitespace (including full-width spaces) and lowercases.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Existing(ItemId),
    Minted(ItemId),
    /// The category no longer accepts new items.
    Rejected,
}

impl Resolution {
    pub fn item_id(&self) -> Option<&ItemId> {
        match self {
            Resolution::Existing(id) | Resolution::Minted(id) => Some(id),
            Resolution::Rejected => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Registered {
    id: ItemId,
    first_position: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
struct CategoryScope {
    /// Items per normalized name, in first-seen order.
    by_name: BTreeMap<String, Vec<Registered>>,
    /// First item seen at each position.
    by_position: BTreeMap<usize, ItemId>,
    known: BTreeSet<ItemId>,
}

impl CategoryScope {
    fn register(&mut self, key: &str, id: ItemId, position: usize) {
        if !key.is_empty() {
            self.by_name
                .entry(key.to_string())
                .or_default()
                .push(Registered {
                    id: id.clone(),
                    first_position: position,
                });
        }
        self.by_position.entry(position).or_insert_with(|| id.clone());
        self.known.insert(id);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentityResolver {
    scopes: BTreeMap<String, CategoryScope>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts resolving one category array from one payload. Entries resolved through
    /// the same batch never share an id.
    pub fn batch<'a>(&'a mut self, category: &'a str, frozen: bool) -> ResolveBatch<'a> {
        ResolveBatch {
            scope: self.scopes.entry(category.to_string()).or_default(),
            category,
            frozen,
            claimed: BTreeSet::new(),
        }
    }

    /// Single-entry lookup for an open category.
    pub fn resolve(&mut self, category: &str, original_name: &str, position: usize) -> ItemId {
        match self.batch(category, false).resolve(original_name, position) {
            Resolution::Existing(id) | Resolution::Minted(id) => id,
            Resolution::Rejected => ItemId::positional(category, position),
        }
    }

    pub fn known_items(&self, category: &str) -> usize {
        self.scopes
            .get(category)
            .map(|scope| scope.known.len())
            .unwrap_or(0)
    }
}

pub struct ResolveBatch<'a> {
    scope: &'a mut CategoryScope,
    category: &'a str,
    frozen: bool,
    claimed: BTreeSet<ItemId>,
}

impl ResolveBatch<'_> {
    pub fn resolve(&mut self, original_name: &str, position: usize) -> Resolution {
        let key = normalize_name(original_name);

        if let Some(id) = self.by_name(&key, position) {
            return self.claim(id, Resolution::Existing);
        }

        let duplicate = self.scope.by_name.contains_key(&key);
        if key.is_empty() || duplicate {
            if let Some(id) = self.by_position(&key, position) {
                return self.claim(id, Resolution::Existing);
            }
        }

        if self.frozen {
            return Resolution::Rejected;
        }

        let id = if key.is_empty() || duplicate {
            ItemId::positional(self.category, position)
        } else {
            ItemId::named(self.category, key.clone())
        };
        if self.scope.known.contains(&id) {
            // Only reachable when two entries of one batch fight over one position.
            return Resolution::Rejected;
        }
        self.scope.register(&key, id.clone(), position);
        self.claim(id, Resolution::Minted)
    }

    fn by_name(&self, key: &str, position: usize) -> Option<ItemId> {
        if key.is_empty() {
            return None;
        }
        let candidates: Vec<&Registered> = self
            .scope
            .by_name
            .get(key)?
            .iter()
            .filter(|entry| !self.claimed.contains(&entry.id))
            .collect();
        candidates
            .iter()
            .find(|entry| entry.first_position == position)
            .or_else(|| candidates.first())
            .map(|entry| entry.id.clone())
    }

    fn by_position(&self, key: &str, position: usize) -> Option<ItemId> {
        let positional = ItemId::positional(self.category, position);
        if self.scope.known.contains(&positional) && !self.claimed.contains(&positional) {
            return Some(positional);
        }
        // A named entry never borrows another item's identity.
        if !key.is_empty() {
            return None;
        }
        self.scope
            .by_position
            .get(&position)
            .filter(|id| !self.claimed.contains(*id))
            .cloned()
    }

    fn claim(&mut self, id: ItemId, wrap: fn(ItemId) -> Resolution) -> Resolution {
        self.claimed.insert(id.clone());
        wrap(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::ItemKey;

    #[test]
    fn normalization_collapses_whitespace_and_case() {
        assert_eq!(normalize_name("  Sake\u{3000} Nigori "), "sake nigori");
        assert_eq!(normalize_name("   "), "");
    }

    #[test]
    fn same_triple_resolves_to_same_id_across_events() {
        let mut resolver = IdentityResolver::new();
        let first = resolver.resolve("Appetizers", "焼き鳥", 0);
        let second = resolver.resolve("Appetizers", "焼き鳥", 0);
        assert_eq!(first, second);
        assert_eq!(first, ItemId::named("Appetizers", "焼き鳥"));
    }

    #[test]
    fn later_stage_finds_item_by_name_at_a_different_position() {
        let mut resolver = IdentityResolver::new();
        let yakitori = resolver.resolve("Appetizers", "焼き鳥", 4);
        let later = resolver.resolve("Appetizers", " 焼き鳥 ", 0);
        assert_eq!(yakitori, later);
    }

    #[test]
    fn duplicate_names_in_one_batch_fall_back_to_position() {
        let mut resolver = IdentityResolver::new();
        let (first, second) = {
            let mut batch = resolver.batch("Drinks", false);
            (batch.resolve("ビール", 3), batch.resolve("ビール", 7))
        };
        assert_eq!(first, Resolution::Minted(ItemId::named("Drinks", "ビール")));
        assert_eq!(second, Resolution::Minted(ItemId::positional("Drinks", 7)));

        let mut replay = resolver.batch("Drinks", false);
        assert_eq!(
            replay.resolve("ビール", 3),
            Resolution::Existing(ItemId::named("Drinks", "ビール"))
        );
        assert_eq!(
            replay.resolve("ビール", 7),
            Resolution::Existing(ItemId::positional("Drinks", 7))
        );
    }

    #[test]
    fn blank_names_use_position() {
        let mut resolver = IdentityResolver::new();
        let id = resolver.resolve("Desserts", "  ", 2);
        assert_eq!(id.key, ItemKey::Position(2));
        assert_eq!(resolver.resolve("Desserts", "", 2), id);
    }

    #[test]
    fn frozen_category_rejects_unknown_names_even_at_a_known_position() {
        let mut resolver = IdentityResolver::new();
        let original = resolver.resolve("Mains", "ラーメン", 0);

        let mut batch = resolver.batch("Mains", true);
        assert_eq!(batch.resolve("餃子", 0), Resolution::Rejected);
        assert_eq!(batch.resolve("ラーメン", 0), Resolution::Existing(original));
        assert_eq!(batch.resolve("チャーハン", 1), Resolution::Rejected);
        assert_eq!(resolver.known_items("Mains"), 1);
    }

    #[test]
    fn frozen_category_maps_blank_names_by_position() {
        let mut resolver = IdentityResolver::new();
        let original = resolver.resolve("Mains", "ラーメン", 0);

        let mut batch = resolver.batch("Mains", true);
        assert_eq!(batch.resolve("  ", 0), Resolution::Existing(original));
        assert_eq!(batch.resolve("", 1), Resolution::Rejected);
    }

    #[test]
    fn repeated_name_never_takes_over_a_different_item() {
        let mut resolver = IdentityResolver::new();
        {
            let mut batch = resolver.batch("Drinks", false);
            batch.resolve("ビール", 0);
            batch.resolve("日本酒", 1);
        }
        let mut batch = resolver.batch("Drinks", true);
        assert_eq!(
            batch.resolve("ビール", 0),
            Resolution::Existing(ItemId::named("Drinks", "ビール"))
        );
        // A second ビール at position 1 has no positional identity of its own.
        assert_eq!(batch.resolve("ビール", 1), Resolution::Rejected);
    }

    #[test]
    fn categories_are_separate_scopes() {
        let mut resolver = IdentityResolver::new();
        let a = resolver.resolve("Lunch", "カレー", 0);
        let b = resolver.resolve("Dinner", "カレー", 0);
        assert_ne!(a, b);
    }
}
