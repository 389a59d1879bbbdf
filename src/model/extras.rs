//! The polymorphic extras bag attached to hosts and locations.
//!
//! Extra configuration that doesn't warrant a dedicated field travels as a
//! tagged value: a scalar, an insertion-ordered string set, or a string
//! map. The merge rules are what make repeated re-adds of the same
//! container safe: lists union without duplicating, scalars replace, maps
//! merge key-wise, and the [`INJECTED`] key replaces wholesale so injected
//! directives cannot accumulate across re-adds.

use std::collections::BTreeMap;

/// The extras key carrying verbatim injected gateway directives.
pub const INJECTED: &str = "injected";

/// One extra value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraValue {
	/// A single string, replaced on merge
	Scalar(String),
	/// An insertion-ordered set of strings, unioned on merge
	List(Vec<String>),
	/// A string map, merged key-wise on merge
	Map(BTreeMap<String, String>),
}

/// A bag of named extra values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extras(BTreeMap<String, ExtraValue>);

impl Extras {
	/// An empty bag.
	#[must_use]
	pub const fn new() -> Self {
		Self(BTreeMap::new())
	}

	/// Whether the bag holds no values.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Get a value by key.
	#[must_use]
	pub fn get(&self, key: &str) -> Option<&ExtraValue> {
		self.0.get(key)
	}

	/// Set a value, replacing whatever was there.
	pub fn set(&mut self, key: impl Into<String>, value: ExtraValue) {
		self.0.insert(key.into(), value);
	}

	/// Append an item to the list under `key`, creating the list if absent
	/// and ignoring the item if already present.
	pub fn push_list(&mut self, key: &str, item: impl Into<String>) {
		let item = item.into();
		match self.0.get_mut(key) {
			Some(ExtraValue::List(list)) => {
				if !list.contains(&item) {
					list.push(item);
				}
			}
			_ => {
				self.0.insert(key.to_string(), ExtraValue::List(vec![item]));
			}
		}
	}

	/// Iterate over the values in key order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &ExtraValue)> {
		self.0.iter().map(|(key, value)| (key.as_str(), value))
	}

	/// Remove every value.
	pub fn clear(&mut self) {
		self.0.clear();
	}

	/// Merge `incoming` into this bag. Lists union preserving insertion
	/// order, scalars and mismatched types replace, maps merge key-wise
	/// with incoming values winning. The [`INJECTED`] key always replaces.
	pub fn merge(&mut self, incoming: Self) {
		for (key, value) in incoming.0 {
			if key == INJECTED {
				self.0.insert(key, value);
				continue;
			}

			match (self.0.get_mut(&key), value) {
				(Some(ExtraValue::List(existing)), ExtraValue::List(new)) => {
					for item in new {
						if !existing.contains(&item) {
							existing.push(item);
						}
					}
				}
				(Some(ExtraValue::Map(existing)), ExtraValue::Map(new)) => {
					existing.extend(new);
				}
				(_, value) => {
					self.0.insert(key, value);
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn list_merge_unions_in_order() {
		let mut a = Extras::new();
		a.push_list("headers", "one");
		a.push_list("headers", "two");

		let mut b = Extras::new();
		b.push_list("headers", "two");
		b.push_list("headers", "three");

		a.merge(b);

		assert_eq!(
			a.get("headers"),
			Some(&ExtraValue::List(vec![
				"one".to_string(),
				"two".to_string(),
				"three".to_string()
			]))
		);
	}

	#[test]
	fn scalar_merge_replaces() {
		let mut a = Extras::new();
		a.set("limit", ExtraValue::Scalar("10m".to_string()));

		let mut b = Extras::new();
		b.set("limit", ExtraValue::Scalar("50m".to_string()));

		a.merge(b);

		assert_eq!(a.get("limit"), Some(&ExtraValue::Scalar("50m".to_string())));
	}

	#[test]
	fn map_merge_is_keywise() {
		let mut a = Extras::new();
		a.set(
			"labels",
			ExtraValue::Map(BTreeMap::from([
				("tier".to_string(), "web".to_string()),
				("zone".to_string(), "a".to_string()),
			])),
		);

		let mut b = Extras::new();
		b.set(
			"labels",
			ExtraValue::Map(BTreeMap::from([("zone".to_string(), "b".to_string())])),
		);

		a.merge(b);

		let Some(ExtraValue::Map(map)) = a.get("labels") else {
			panic!("labels is not a map");
		};
		assert_eq!(map.get("tier").unwrap(), "web");
		assert_eq!(map.get("zone").unwrap(), "b");
	}

	#[test]
	fn injected_replaces_instead_of_accumulating() {
		let mut a = Extras::new();
		a.set(
			INJECTED,
			ExtraValue::List(vec!["gzip on".to_string(), "expires 1h".to_string()]),
		);

		let mut b = Extras::new();
		b.set(INJECTED, ExtraValue::List(vec!["gzip on".to_string()]));

		a.merge(b.clone());
		a.merge(b);

		assert_eq!(
			a.get(INJECTED),
			Some(&ExtraValue::List(vec!["gzip on".to_string()]))
		);
	}

	#[test]
	fn push_list_deduplicates() {
		let mut extras = Extras::new();
		extras.push_list("x", "same");
		extras.push_list("x", "same");

		assert_eq!(extras.get("x"), Some(&ExtraValue::List(vec!["same".to_string()])));
	}
}
