//! Tool-call identifiers that carry their function name.
//!
//! The backend may return function calls without an id, so the gateway mints
//! `<name>-<8 hex digits>`. A tool result that only carries the id recovers the
//! function name with [`decode`], without any lookup table.

const SUFFIX_LEN: usize = 8;

/// Mint a new id for a call to `name`.
pub fn encode(name: &str) -> String {
    format!("{}-{:08x}", name, rand::random::<u32>())
}

/// Recover the function name from an id produced by [`encode`].
///
/// Ids in any other shape are returned unchanged.
pub fn decode(id: &str) -> &str {
    match split(id) {
        Some(name) => name,
        None => {
            tracing::warn!(tool_call_id = %id, "Tool call id has no encoded name, using it verbatim");
            id
        }
    }
}

/// Keep a backend-supplied id when it already encodes `name`, otherwise mint one.
pub fn ensure(id: Option<&str>, name: &str) -> String {
    match id {
        Some(id) if split(id) == Some(name) => id.to_string(),
        _ => encode(name),
    }
}

/// Whether `id` is in the encoded shape.
pub fn is_encoded(id: &str) -> bool {
    split(id).is_some()
}

fn split(id: &str) -> Option<&str> {
    let idx = id.rfind('-')?;
    if idx == 0 {
        return None;
    }
    let suffix = &id[idx + 1..];
    if suffix.len() == SUFFIX_LEN && suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(&id[..idx])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for name in ["get_weather", "read-file", "a", "mcp__server__do-thing"] {
            let id = encode(name);
            assert!(is_encoded(&id));
            assert_eq!(decode(&id), name);
        }
    }

    #[test]
    fn test_encode_shape() {
        let id = encode("search");
        let suffix = id.strip_prefix("search-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_foreign_ids_pass_through() {
        assert_eq!(decode("toolu_01ABC"), "toolu_01ABC");
        assert_eq!(decode("call-xyz"), "call-xyz");
        assert_eq!(decode("-deadbeef"), "-deadbeef");
        assert_eq!(decode("name-deadbee"), "name-deadbee");
        assert!(!is_encoded("toolu_01ABC"));
    }

    #[test]
    fn test_ensure_keeps_matching_ids() {
        let id = encode("lookup");
        assert_eq!(ensure(Some(&id), "lookup"), id);

        let minted = ensure(Some("toolu_01ABC"), "lookup");
        assert_eq!(decode(&minted), "lookup");
        let minted = ensure(Some(&id), "other");
        assert_eq!(decode(&minted), "other");
        assert!(is_encoded(&ensure(None, "lookup")));
    }

    #[test]
    fn test_ids_are_unique_enough() {
        let a = encode("f");
        let b = encode("f");
        let c = encode("f");
        assert!(a != b || b != c);
    }
}
