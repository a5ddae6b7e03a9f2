//! URL-safe encoding of endpoint paths, used as route parameters by the
//! configuration API (`/api/v1/_config/endpoints/<slug>`).
//!
//! Internal `/` becomes `-slash-`; a trailing `/` becomes a trailing
//! `-slash` marker. The leading `/` every path carries is implicit in the
//! slug. The empty path encodes as `empty`.

/// Marker for the empty path.
const EMPTY: &str = "empty";
/// Slug for the bare root path `/`.
const ROOT: &str = "-slash";

/// Encode an endpoint path as a slug.
pub fn path_to_slug(path: &str) -> String {
    if path.is_empty() {
        return EMPTY.to_string();
    }
    if path == "/" {
        return ROOT.to_string();
    }
    let rest = path.strip_prefix('/').unwrap_or(path);
    let (core, trailing) = match rest.strip_suffix('/') {
        Some(core) => (core, true),
        None => (rest, false),
    };
    let mut slug = core.replace('/', "-slash-");
    if trailing {
        slug.push_str("-slash");
    }
    slug
}

/// Decode a slug back into an endpoint path. Inverse of [`path_to_slug`].
pub fn slug_to_path(slug: &str) -> String {
    if slug == EMPTY {
        return String::new();
    }
    if slug == ROOT {
        return "/".to_string();
    }
    // Trailing-slash marker is checked before the internal replacement so
    // that `a-slash-b-slash` decodes to `/a/b/` and not `/a/b-slash`.
    let (core, trailing) = match slug.strip_suffix("-slash") {
        Some(core) if !core.ends_with("-slash") || core.ends_with("-slash-") => (core, true),
        _ => (slug, false),
    };
    let mut path = String::from("/");
    path.push_str(&core.replace("-slash-", "/"));
    if trailing {
        path.push('/');
    }
    path
}
