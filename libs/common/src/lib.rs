//! String and collection helpers.
//!
//! Small pure functions used by the provisioners for comparing policy
//! lists, merging trust-list entries and addressing nested fields in
//! loosely typed documents. Nothing here performs I/O.

use sha2::{Digest, Sha256};

/// Errors from nested-field access.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FieldPathError {
    /// The path was empty.
    #[error("empty field path")]
    EmptyPath,

    /// An intermediate segment exists but is not an object.
    #[error("field {segment} in path {path} is not an object")]
    NotAnObject { path: String, segment: String },
}

/// Case-insensitive string comparison using Unicode lowercasing.
pub fn equal_fold(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Returns true if `slice` contains exactly `s`.
pub fn contains_string<S: AsRef<str>>(slice: &[S], s: &str) -> bool {
    slice.iter().any(|item| item.as_ref() == s)
}

/// Returns true if `slice` contains `s` under case folding.
pub fn contains_equal_fold<S: AsRef<str>>(slice: &[S], s: &str) -> bool {
    slice.iter().any(|item| equal_fold(item.as_ref(), s))
}

/// Hex-encoded SHA-256 digest of `s`.
pub fn string_hash(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Same length and every element of `x` is in `y`, ignoring case.
pub fn string_slice_equal_fold<S: AsRef<str>, T: AsRef<str>>(x: &[S], y: &[T]) -> bool {
    if x.len() != y.len() {
        return false;
    }
    x.iter().all(|element| contains_equal_fold(y, element.as_ref()))
}

/// Order-insensitive equality of two string slices.
pub fn string_slice_equals<S: AsRef<str>, T: AsRef<str>>(x: &[S], y: &[T]) -> bool {
    let mut a: Vec<&str> = x.iter().map(|s| s.as_ref()).collect();
    let mut b: Vec<&str> = y.iter().map(|s| s.as_ref()).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

/// Returns true if every element of `x` is contained in `y`.
pub fn string_slice_contains<S: AsRef<str>, T: AsRef<str>>(x: &[S], y: &[T]) -> bool {
    x.iter().all(|s| contains_string(y, s.as_ref()))
}

/// Set difference `a - b`, keeping the order of `a`.
pub fn difference<S: AsRef<str>, T: AsRef<str>>(a: &[S], b: &[T]) -> Vec<String> {
    let exclude: std::collections::HashSet<&str> = b.iter().map(|s| s.as_ref()).collect();
    a.iter()
        .map(|s| s.as_ref())
        .filter(|item| !exclude.contains(item))
        .map(str::to_string)
        .collect()
}

/// Set difference `a - b` under case folding, keeping the order of `a`.
pub fn difference_equal_fold<S: AsRef<str>, T: AsRef<str>>(a: &[S], b: &[T]) -> Vec<String> {
    a.iter()
        .map(|s| s.as_ref())
        .filter(|item| !contains_equal_fold(b, item))
        .map(str::to_string)
        .collect()
}

/// Appends `item` unless an equal element is already present.
pub fn append_unique<T: PartialEq>(mut slice: Vec<T>, item: T) -> Vec<T> {
    if !slice.contains(&item) {
        slice.push(item);
    }
    slice
}

/// Appends each element of `other` that is not already in `base`.
pub fn merge_slice_by_unique<T: PartialEq>(base: Vec<T>, other: Vec<T>) -> Vec<T> {
    other.into_iter().fold(base, append_unique)
}

/// Appends `item` unless an element with the same key exists.
///
/// Keys are compared case-insensitively. When a matching element exists
/// and `override_existing` is set, it is replaced in place.
pub fn append_unique_by_key<T, F>(
    mut slice: Vec<T>,
    item: T,
    key: F,
    override_existing: bool,
) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let item_key = key(&item).to_string();
    match slice.iter().position(|existing| equal_fold(key(existing), &item_key)) {
        Some(idx) => {
            if override_existing {
                slice[idx] = item;
            }
        }
        None => slice.push(item),
    }
    slice
}

/// Merges `other` into `base` keyed by `key`. See [`append_unique_by_key`].
pub fn merge_slice_by_key<T, F>(
    base: Vec<T>,
    other: Vec<T>,
    key: F,
    override_existing: bool,
) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    other
        .into_iter()
        .fold(base, |acc, item| append_unique_by_key(acc, item, &key, override_existing))
}

/// Last element of `s` split by `sep`; `s` itself when `sep` does not occur.
pub fn get_last_element_by<'a>(s: &'a str, sep: &str) -> &'a str {
    s.rsplit(sep).next().unwrap_or(s)
}

/// Joins non-empty, trimmed list entries with `delimiter`.
pub fn concatenate_list<S: AsRef<str>>(list: &[S], delimiter: &str) -> String {
    list.iter()
        .flat_map(|s| s.as_ref().split_whitespace())
        .collect::<Vec<_>>()
        .join(delimiter)
}

/// Splits a dotted field path into segments.
pub fn field_path(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Joins segments into a dotted field path.
pub fn field_path_string(path: &[&str]) -> String {
    path.join(".")
}

/// Returns a copy of the value at dotted `path`, if present.
pub fn field_value(path: &str, obj: &serde_json::Value) -> Option<serde_json::Value> {
    field_path(path)
        .into_iter()
        .try_fold(obj, |current, segment| current.get(segment))
        .cloned()
}

/// Sets the value at dotted `path`, creating intermediate objects.
pub fn set_field_value(
    path: &str,
    obj: &mut serde_json::Value,
    value: serde_json::Value,
) -> Result<(), FieldPathError> {
    if path.is_empty() {
        return Err(FieldPathError::EmptyPath);
    }

    let segments = field_path(path);
    let (last, parents) = segments.split_last().ok_or(FieldPathError::EmptyPath)?;

    let mut current = obj;
    for segment in parents {
        let map = current
            .as_object_mut()
            .ok_or_else(|| FieldPathError::NotAnObject {
                path: path.to_string(),
                segment: segment.to_string(),
            })?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
    }

    let map = current
        .as_object_mut()
        .ok_or_else(|| FieldPathError::NotAnObject {
            path: path.to_string(),
            segment: last.to_string(),
        })?;
    map.insert(last.to_string(), value);
    Ok(())
}

/// Current UTC time as `YYYYMMDDhhmmss`.
pub fn get_time_string() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
}
