//! Static category lookup
//!
//! Codes 1..=4 are the known categories; anything else is reported under
//! [`FALLBACK_CATEGORY`]. The table is a `static` and never mutated.

/// Label used for codes that are not in the table
pub const FALLBACK_CATEGORY: &str = "Other";

/// Immutable code → display-name table.
#[derive(Debug)]
pub struct CategoryTable {
    entries: &'static [(i32, &'static str)],
    fallback: &'static str,
}

pub static CATEGORY_TABLE: CategoryTable = CategoryTable {
    entries: &[(1, "Electronica"), (2, "Ropa"), (3, "Hogar"), (4, "Belleza")],
    fallback: FALLBACK_CATEGORY,
};

impl CategoryTable {
    /// Resolve a code, falling back to `"Other"`.
    pub fn name(&self, code: i32) -> &'static str {
        self.entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| *name)
            .unwrap_or(self.fallback)
    }

    /// Known categories in code order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &'static str)> + '_ {
        self.entries.iter().copied()
    }

    pub fn fallback(&self) -> &'static str {
        self.fallback
    }
}

/// Shorthand for `CATEGORY_TABLE.name(code)`.
pub fn category_name(code: i32) -> &'static str {
    CATEGORY_TABLE.name(code)
}
