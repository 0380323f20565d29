//! Idempotent marked-region replacement inside an issue's markdown body.
//!
//! A [`RegionKind`] bounds a region with a sentinel HTML-comment pair. The
//! engine never parses the region's content; it only ever replaces the
//! bytes strictly between the markers, leaving everything outside the
//! region byte-for-byte unchanged.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Research,
    Plan,
}

impl RegionKind {
    fn tag(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Plan => "plan",
        }
    }

    fn open(self) -> String {
        format!("<!-- kiln:{} -->", self.tag())
    }

    fn close(self) -> String {
        format!("<!-- /kiln:{} -->", self.tag())
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Idempotently insert-or-replace `kind`'s marked region in `body` with
/// `content`. If the region is absent, it is appended (with a blank-line
/// separator if `body` is non-empty); if present, only the bytes strictly
/// between the markers are replaced.
pub fn upsert_region(body: &str, kind: RegionKind, content: &str) -> String {
    let open = kind.open();
    let close = kind.close();

    if let Some(open_idx) = body.find(&open) {
        let after_open = open_idx + open.len();
        if let Some(close_rel_idx) = body[after_open..].find(&close) {
            let close_idx = after_open + close_rel_idx;
            let mut out = String::with_capacity(body.len() + content.len());
            out.push_str(&body[..after_open]);
            out.push('\n');
            out.push_str(content.trim());
            out.push('\n');
            out.push_str(&body[close_idx..]);
            return out;
        }
    }

    let mut out = body.to_string();
    if !out.is_empty() && !out.ends_with("\n\n") {
        if out.ends_with('\n') {
            out.push('\n');
        } else {
            out.push_str("\n\n");
        }
    }
    out.push_str(&open);
    out.push('\n');
    out.push_str(content.trim());
    out.push('\n');
    out.push_str(&close);
    out
}

/// Remove `kind`'s marked region (markers and content) entirely, used by
/// `reset`. A no-op if the region is absent.
pub fn strip_region(body: &str, kind: RegionKind) -> String {
    let open = kind.open();
    let close = kind.close();
    if let Some(open_idx) = body.find(&open)
        && let Some(close_rel_idx) = body[open_idx..].find(&close)
    {
        let close_idx = open_idx + close_rel_idx + close.len();
        let mut out = String::with_capacity(body.len());
        out.push_str(body[..open_idx].trim_end_matches('\n'));
        out.push_str(&body[close_idx..]);
        return out;
    }
    body.to_string()
}

pub fn strip_all_regions(body: &str) -> String {
    strip_region(&strip_region(body, RegionKind::Research), RegionKind::Plan)
}

/// Extract the current content of a region, if present, for before/after
/// diffing in the comment-processor reply.
pub fn extract_region(body: &str, kind: RegionKind) -> Option<&str> {
    let open = kind.open();
    let close = kind.close();
    let open_idx = body.find(&open)?;
    let after_open = open_idx + open.len();
    let close_rel_idx = body[after_open..].find(&close)?;
    Some(body[after_open..after_open + close_rel_idx].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserts_region_into_empty_body() {
        let out = upsert_region("", RegionKind::Research, "first draft");
        assert_eq!(
            out,
            "<!-- kiln:research -->\nfirst draft\n<!-- /kiln:research -->"
        );
    }

    #[test]
    fn appends_region_preserving_existing_body() {
        let out = upsert_region("Original issue text.", RegionKind::Plan, "the plan");
        assert!(out.starts_with("Original issue text."));
        assert!(out.contains("<!-- kiln:plan -->\nthe plan\n<!-- /kiln:plan -->"));
    }

    #[test]
    fn replacing_twice_is_idempotent() {
        let once = upsert_region("Body.", RegionKind::Research, "draft one");
        let twice = upsert_region(&once, RegionKind::Research, "draft one");
        assert_eq!(once, twice);
    }

    #[test]
    fn replace_preserves_bytes_outside_region() {
        let body = "Before.\n\n<!-- kiln:research -->\nold\n<!-- /kiln:research -->\n\nAfter.";
        let out = upsert_region(body, RegionKind::Research, "new content");
        assert!(out.starts_with("Before.\n\n<!-- kiln:research -->"));
        assert!(out.ends_with("<!-- /kiln:research -->\n\nAfter."));
        assert!(out.contains("new content"));
        assert!(!out.contains("old"));
    }

    #[test]
    fn replace_does_not_touch_other_region_kind() {
        let body = "<!-- kiln:plan -->\nkeep me\n<!-- /kiln:plan -->";
        let out = upsert_region(body, RegionKind::Research, "new research");
        assert!(out.contains("keep me"));
        assert!(out.contains("new research"));
    }

    #[test]
    fn strip_region_removes_markers_and_content() {
        let body = "Before.\n\n<!-- kiln:research -->\nstuff\n<!-- /kiln:research -->\n\nAfter.";
        let out = strip_region(body, RegionKind::Research);
        assert!(!out.contains("kiln:research"));
        assert!(!out.contains("stuff"));
        assert!(out.contains("Before."));
        assert!(out.contains("After."));
    }

    #[test]
    fn strip_region_is_noop_when_absent() {
        let body = "Nothing marked here.";
        assert_eq!(strip_region(body, RegionKind::Plan), body);
    }

    #[test]
    fn extract_region_returns_trimmed_content() {
        let body = "<!-- kiln:plan -->\n  indented plan  \n<!-- /kiln:plan -->";
        assert_eq!(extract_region(body, RegionKind::Plan), Some("indented plan"));
    }

    #[test]
    fn extract_region_none_when_absent() {
        assert_eq!(extract_region("no region", RegionKind::Research), None);
    }
}
