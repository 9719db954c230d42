use std::fs;
use std::path::{Path, PathBuf};

use eptrack_adapters::parse_api_page;
use eptrack_core::EpisodeDraft;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/onepiece-api/sample")
}

#[test]
fn api_listing_matches_golden_snapshot() {
    let body = fs::read(fixture_dir().join("episodes.json")).expect("read api fixture");
    let page = parse_api_page(&body).expect("parse api fixture");

    let snapshot = fs::read_to_string(fixture_dir().join("snapshot.json")).expect("read snapshot");
    let expected: Vec<EpisodeDraft> = serde_json::from_str(&snapshot).expect("parse snapshot");

    assert_eq!(page.drafts, expected);
    assert_eq!(page.skipped, 1);
    assert_eq!(page.next, None);
}
