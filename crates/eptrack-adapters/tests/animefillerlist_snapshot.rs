use std::fs;
use std::path::{Path, PathBuf};

use eptrack_adapters::parse_episode_table;
use eptrack_core::EpisodeDraft;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/animefillerlist/sample")
}

fn read_snapshot(path: &Path) -> Vec<EpisodeDraft> {
    let text = fs::read_to_string(path).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

#[test]
fn listing_page_matches_golden_snapshot() {
    let html = fs::read_to_string(fixture_dir().join("listing.html")).expect("read listing");
    let drafts = parse_episode_table(&html).expect("parse listing");
    let expected = read_snapshot(&fixture_dir().join("snapshot.json"));
    assert_eq!(drafts, expected);
}

#[test]
fn listing_page_decodes_entities_and_drops_specials() {
    let html = fs::read_to_string(fixture_dir().join("listing.html")).expect("read listing");
    let drafts = parse_episode_table(&html).expect("parse listing");
    assert!(drafts.iter().all(|d| d.number > 0));
    assert!(drafts[0].title.starts_with("I'm Luffy!"));
    assert!(!drafts.iter().any(|d| d.title.contains("Ocean's Navel")));
}
