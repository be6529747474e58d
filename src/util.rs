use crossbeam::atomic::AtomicCell;
use lazy_static::lazy_static;
use regex::Regex;

pub static ID_COUNTER: AtomicCell<u64> = AtomicCell::new(1);

lazy_static! {
    static ref NON_SLUG_CHARS: Regex = Regex::new(r"[^a-z0-9-]+").expect("regex is valid");
    static ref REPEATED_HYPHENS: Regex = Regex::new(r"-{2,}").expect("regex is valid");
}

/// Normalizes a human-chosen room name into a url-safe slug.
///
/// Lowercases the input, maps anything outside `[a-z0-9-]` to a hyphen,
/// then collapses and trims hyphens. May return an empty string if the
/// input contains no usable characters.
pub fn slugify(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mapped = NON_SLUG_CHARS.replace_all(&lowered, "-");
    let collapsed = REPEATED_HYPHENS.replace_all(&mapped, "-");

    collapsed.trim_matches('-').to_string()
}

#[cfg(test)]
mod test {
    use super::slugify;

    #[test]
    fn slugs() {
        assert_eq!(slugify("Chill Vibes"), "chill-vibes");
        assert_eq!(slugify("  late night // drive  "), "late-night-drive");
        assert_eq!(slugify("already-a-slug"), "already-a-slug");
        assert_eq!(slugify("Füße & Beats"), "f-e-beats");
        assert_eq!(slugify("???"), "");
    }
}
