/// Normalize a distribution name for comparison.
///
/// Lowercases the name and collapses every run of `-`, `_` and `.` into a
/// single `-`, so `Foo__Bar.baz` and `foo-bar-baz` compare equal.
pub fn canonicalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
                in_separator = true;
            }
        } else {
            out.push(ch.to_ascii_lowercase());
            in_separator = false;
        }
    }
    out
}

/// Strip an `[extras]` suffix following a project name.
pub fn strip_extras(name: &str) -> &str {
    name.split_once('[').map_or(name, |(base, _)| base)
}
