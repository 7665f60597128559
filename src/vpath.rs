//! Virtual path helpers.
//!
//! Archive entries are addressed by forward-slash virtual paths that compare
//! case-insensitively. Configs written on Windows may use backslashes, so every
//! comparison goes through [`normalize`] first.

/// Normalize separators to `/` and drop any leading slash.
pub fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Case-folded, separator-normalized lookup key.
pub fn key(path: &str) -> String {
    normalize(path).to_lowercase()
}

/// Case-insensitive equality after separator normalization.
pub fn eq(a: &str, b: &str) -> bool {
    key(a) == key(b)
}

/// Case-insensitive prefix test after separator normalization.
pub fn starts_with(path: &str, prefix: &str) -> bool {
    key(path).starts_with(&key(prefix))
}

/// Final path component.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Lowercased extension including the leading dot, e.g. `.hlsl`.
///
/// Dotfiles such as `.gitignore` have no extension.
pub fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(name[idx..].to_lowercase()),
    }
}

/// Normalize a configured extension so `hlsl`, `.HLSL` and `.hlsl` agree.
pub fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

/// Case-insensitive wildcard match where `*` matches any run of characters
/// (including none). No other metacharacters are recognized.
pub fn wildcard_match(input: &str, pattern: &str) -> bool {
    let input: Vec<char> = input.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();

    let (mut i, mut p) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while i < input.len() {
        if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = i;
            p += 1;
        } else if p < pattern.len() && pattern[p] == input[i] {
            i += 1;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            i = mark;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
