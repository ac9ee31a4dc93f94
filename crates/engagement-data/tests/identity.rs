//! Integration tests for the identity dictionary lifecycle.
//!
//! These tests load, extend and persist dictionaries on disk and check that
//! every stored pseudonym survives a reload.

#![expect(
    clippy::expect_used,
    reason = "test code uses expect for clear failure messages"
)]

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs::Dir;
use engagement_data::{IdentityError, IdentityRegistry, PseudonymGenerator, RawIdentity};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const DICTIONARY: &str = "identities.json";

struct Scratch {
    _root: TempDir,
    dir: Dir,
}

#[fixture]
fn scratch() -> Scratch {
    let root = TempDir::new().expect("create temp dir");
    let dir = Dir::open_ambient_dir(root.path(), ambient_authority()).expect("open temp dir");
    Scratch { _root: root, dir }
}

fn generator(seed: u64) -> PseudonymGenerator {
    PseudonymGenerator::new(8, Some(seed)).expect("valid generator")
}

fn load(scratch: &Scratch, seed: u64) -> IdentityRegistry {
    IdentityRegistry::load(&scratch.dir, Utf8Path::new(DICTIONARY), generator(seed))
        .expect("load dictionary")
}

#[rstest]
fn missing_dictionary_starts_empty(scratch: Scratch) {
    let registry = load(&scratch, 1);
    assert!(registry.is_empty());
    assert!(!scratch.dir.exists(DICTIONARY));
}

#[rstest]
fn persisted_pseudonyms_are_reused(scratch: Scratch) {
    let named = RawIdentity::LoggedIn(42);
    let anonymous = RawIdentity::Anonymous("10.0.0.1".to_owned());

    let mut first = load(&scratch, 1);
    let named_pseudonym = first.resolve(&named).expect("resolve named");
    let anonymous_pseudonym = first.resolve(&anonymous).expect("resolve anonymous");
    first
        .persist(&scratch.dir, Utf8Path::new(DICTIONARY))
        .expect("persist");

    let mut second = load(&scratch, 2);
    assert_eq!(second.len(), 2);
    assert_eq!(second.lookup(&named), Some(&named_pseudonym));
    assert_eq!(
        second.resolve(&anonymous).expect("resolve anonymous"),
        anonymous_pseudonym
    );
    assert_eq!(second.added(), 0);
}

#[rstest]
fn persisted_dictionary_is_sorted_json(scratch: Scratch) {
    let mut registry = load(&scratch, 5);
    for id in [900, 3, 42] {
        registry
            .resolve(&RawIdentity::LoggedIn(id))
            .expect("resolve");
    }
    registry
        .persist(&scratch.dir, Utf8Path::new(DICTIONARY))
        .expect("persist");

    let json = scratch.dir.read_to_string(DICTIONARY).expect("read back");
    let value: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
    let keys: Vec<&str> = value
        .as_object()
        .expect("object")
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(keys, ["3", "42", "900"]);
    assert!(json.ends_with('\n'));
}

#[rstest]
#[case::duplicate_pseudonym(r#"{"1": "name:00000001", "2": "name:00000001"}"#)]
#[case::duplicate_key(r#"{"1": "name:00000001", "1": "name:00000002"}"#)]
#[case::unknown_prefix(r#"{"1": "user:00000001"}"#)]
#[case::not_an_object(r#"["name:00000001"]"#)]
fn corrupt_dictionaries_are_rejected(scratch: Scratch, #[case] contents: &str) {
    scratch.dir.write(DICTIONARY, contents).expect("write dictionary");

    let result = IdentityRegistry::load(&scratch.dir, Utf8Path::new(DICTIONARY), generator(1));

    assert!(matches!(
        result,
        Err(IdentityError::DuplicatePseudonym { .. }
            | IdentityError::DuplicateRawKey { .. }
            | IdentityError::MalformedPseudonym { .. }
            | IdentityError::Parse { .. })
    ));
}
