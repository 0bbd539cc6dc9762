//! Credential rotation against a filesystem roster.

use std::path::Path;
use std::sync::Arc;

use razar_core::rotation::{DEFAULT_PREFIX, DEFAULT_SUFFIX};
use razar_core::{resolve_credential, rotate_keys, MapEnv, RosterCache, RotationError};
use razar_state::{AgentEntry, AgentRoster, FsRosterStore, RosterStore};

fn seed_roster(path: &Path) {
    let roster = AgentRoster::new(
        "Kimi2",
        vec![
            AgentEntry::new("Kimi2")
                .with_endpoint("http://127.0.0.1:9/kimi")
                .with_credential_env("KIMI2_API_KEY"),
            AgentEntry::new("opencode").with_credential("${OPENCODE_TOKEN}"),
        ],
    );
    FsRosterStore::new(path).save(&roster).unwrap();
}

fn write_metadata(dir: &Path) {
    std::fs::create_dir_all(dir.join("remote")).unwrap();
    std::fs::write(
        dir.join("remote").join("agents.yaml"),
        "agents:\n  - name: kimi2\n    env: KIMI2_API_KEY\n  - name: opencode\n",
    )
    .unwrap();
}

#[test]
fn consecutive_rotations_differ_and_reload_sees_latest() {
    let dir = tempfile::tempdir().unwrap();
    let roster_path = dir.path().join("config").join("razar_ai_agents.json");
    let secrets = dir.path().join("secrets");
    seed_roster(&roster_path);
    write_metadata(&secrets);
    let env = MapEnv::new();

    let first = rotate_keys(&secrets, &roster_path, DEFAULT_PREFIX, DEFAULT_SUFFIX, true, &env)
        .unwrap();
    let second = rotate_keys(&secrets, &roster_path, DEFAULT_PREFIX, DEFAULT_SUFFIX, true, &env)
        .unwrap();

    assert_eq!(first.len(), 2);
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.agent, b.agent);
        assert_ne!(a.placeholder, b.placeholder);
        assert!(b.applied);
    }

    let cache = RosterCache::new(Arc::new(FsRosterStore::new(&roster_path)));
    let roster = cache.load().unwrap();

    let kimi = roster.find("kimi2").unwrap();
    assert_eq!(kimi.credential.as_deref(), Some(second[0].placeholder.as_str()));
    assert_eq!(kimi.endpoint.as_deref(), Some("http://127.0.0.1:9/kimi"));
    let live = MapEnv::from_pairs([("KIMI2_API_KEY", second[0].placeholder.clone())]);
    assert_eq!(
        resolve_credential(kimi, &live).unwrap().as_deref(),
        Some(second[0].placeholder.as_str())
    );

    // No env var: the placeholder in the roster is used as-is.
    let opencode = roster.find("opencode").unwrap();
    assert_eq!(
        resolve_credential(opencode, &env).unwrap().as_deref(),
        Some(second[1].placeholder.as_str())
    );
}

#[test]
fn dry_run_leaves_the_live_roster_alone() {
    let dir = tempfile::tempdir().unwrap();
    let roster_path = dir.path().join("roster.json");
    let secrets = dir.path().join("secrets");
    seed_roster(&roster_path);
    write_metadata(&secrets);
    let before = std::fs::read_to_string(&roster_path).unwrap();

    let results = rotate_keys(
        &secrets,
        &roster_path,
        DEFAULT_PREFIX,
        DEFAULT_SUFFIX,
        false,
        &MapEnv::new(),
    )
    .unwrap();

    assert!(results.iter().all(|r| !r.applied));
    assert_eq!(std::fs::read_to_string(&roster_path).unwrap(), before);
}

#[test]
fn relative_config_path_resolves_next_to_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = dir.path().join("secrets");
    std::fs::create_dir_all(&secrets).unwrap();
    seed_roster(&dir.path().join("rosters").join("local.json"));
    std::fs::write(
        secrets.join("meta.json"),
        r#"{"rotation": [{"name": "opencode", "config_path": "../rosters/local.json"}]}"#,
    )
    .unwrap();

    let results = rotate_keys(
        &secrets,
        &dir.path().join("unused.json"),
        "R",
        "K",
        true,
        &MapEnv::new(),
    )
    .unwrap();

    assert_eq!(results[0].config_path, secrets.join("../rosters/local.json"));
    assert!(results[0].placeholder.starts_with("R_OPENCODE_"));
    assert!(results[0].placeholder.ends_with("_K"));
}

#[test]
fn unknown_agent_and_empty_metadata_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    let roster_path = dir.path().join("roster.json");
    seed_roster(&roster_path);

    let empty = dir.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();
    let err = rotate_keys(&empty, &roster_path, "R", "K", true, &MapEnv::new()).unwrap_err();
    assert!(matches!(err, RotationError::Empty(_)));

    let secrets = dir.path().join("secrets");
    std::fs::create_dir_all(&secrets).unwrap();
    std::fs::write(secrets.join("ghost.yml"), "name: ghost\n").unwrap();
    let err = rotate_keys(&secrets, &roster_path, "R", "K", true, &MapEnv::new()).unwrap_err();
    assert!(matches!(err, RotationError::AgentMissing { .. }));
}
