//! Maildir flag letters
//!
//! Flags live in the message filename after the `:2,` info separator,
//! one ASCII letter per flag. The letters used here are the standard
//! Maildir set: `S` (seen), `R` (replied), `T` (trashed), `F`
//! (flagged), `D` (draft), `P` (passed).

/// The letter marking a message as read.
pub const SEEN: char = 'S';

/// Canonical form of a flag string: letters sorted and deduplicated.
///
/// Filenames produced by other agents may carry flags in any order;
/// canonicalizing before comparing or writing keeps renames stable.
#[must_use]
pub fn canonical(flags: &str) -> String {
    let mut letters: Vec<char> = flags.chars().collect();
    letters.sort_unstable();
    letters.dedup();
    letters.into_iter().collect()
}

/// Union of two flag strings, in canonical form.
#[must_use]
pub fn union(a: &str, b: &str) -> String {
    let mut combined = String::with_capacity(a.len() + b.len());
    combined.push_str(a);
    combined.push_str(b);
    canonical(&combined)
}

/// Whether the flag string contains the seen marker.
#[must_use]
pub fn is_seen(flags: &str) -> bool {
    flags.contains(SEEN)
}

/// Whether two flag strings denote the same set of letters.
#[must_use]
pub fn same(a: &str, b: &str) -> bool {
    canonical(a) == canonical(b)
}
