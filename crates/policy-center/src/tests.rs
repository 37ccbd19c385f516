use crate::api::{InMemoryPolicyCenter, PolicyCenter};
use crate::defaults::default_snapshot;
use crate::errors::PolicyError;
use crate::loader::load_snapshot;
use crate::model::{PolicySource, RuntimeOverrideSpec};
use std::env;
use std::sync::{Arc, Mutex, OnceLock};

#[test]
fn default_snapshot_matches_sidebar_layout() {
    let snapshot = default_snapshot();
    assert_eq!(snapshot.layout.box_width, 200);
    assert_eq!(snapshot.layout.box_height, 200);
    assert_eq!(snapshot.layout.max_width, 800);
    assert_eq!(snapshot.layout.max_height, 600);
    assert_eq!(snapshot.convergence.max_rounds, 5);
    assert_eq!(snapshot.convergence.poll_interval_ms, 1_000);
    assert!(snapshot.sites.is_empty());
}

#[test]
fn file_can_only_tighten_round_budget() {
    let _guard = env_guard().lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let loose = dir.path().join("loose.yaml");
    std::fs::write(
        &loose,
        r#"convergence:
  max_rounds: 8
  poll_interval_ms: 250
"#,
    )
    .unwrap();
    let snapshot = load_snapshot(Some(&loose)).unwrap();
    assert_eq!(snapshot.convergence.max_rounds, 5);
    assert_eq!(snapshot.convergence.poll_interval_ms, 250);

    let tight = dir.path().join("tight.yaml");
    std::fs::write(&tight, "convergence:\n  max_rounds: 3\n").unwrap();
    let snapshot = load_snapshot(Some(&tight)).unwrap();
    assert_eq!(snapshot.convergence.max_rounds, 3);
    assert_eq!(
        snapshot
            .provenance
            .get("convergence.max_rounds")
            .expect("provenance")
            .source,
        PolicySource::File
    );
}

#[test]
fn site_rules_load_from_file() {
    let _guard = env_guard().lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("policy.yaml");
    std::fs::write(
        &file_path,
        r#"site_defaults:
  replay_inline_scripts_on_error: true
sites:
  - pattern: example.com
    refresh_third_party_ads: true
  - pattern: news.example.org
    override_page_ready_hook: true
"#,
    )
    .unwrap();

    let snapshot = load_snapshot(Some(&file_path)).unwrap();
    assert_eq!(snapshot.sites.len(), 2);

    let resolved = snapshot.site_overrides("http://www.example.com/");
    assert!(resolved.refresh_third_party_ads);
    assert!(resolved.replay_inline_scripts_on_error);

    let resolved = snapshot.site_overrides("https://news.example.org/a");
    assert!(resolved.override_page_ready_hook);
    assert!(!resolved.refresh_third_party_ads);
}

#[test]
fn invalid_ratio_is_rejected() {
    let _guard = env_guard().lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("policy.yaml");
    std::fs::write(&file_path, "convergence:\n  empty_refresh_ratio: 1.5\n").unwrap();
    assert!(load_snapshot(Some(&file_path)).is_err());
}

#[test]
fn degenerate_convergence_settings_fail_the_load() {
    let _guard = env_guard().lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("policy.yaml");

    std::fs::write(&file_path, "convergence:\n  max_rounds: 0\n").unwrap();
    assert!(matches!(
        load_snapshot(Some(&file_path)),
        Err(PolicyError::InvalidValue(_))
    ));

    std::fs::write(&file_path, "convergence:\n  poll_interval_ms: 0\n").unwrap();
    assert!(matches!(
        load_snapshot(Some(&file_path)),
        Err(PolicyError::InvalidValue(_))
    ));
}

#[test]
fn site_patterns_with_a_scheme_fail_the_load() {
    let _guard = env_guard().lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("policy.yaml");
    std::fs::write(
        &file_path,
        "sites:\n  - pattern: https://example.com/\n    refresh_third_party_ads: true\n",
    )
    .unwrap();
    let err = load_snapshot(Some(&file_path)).unwrap_err();
    assert!(err.to_string().contains("sites[0]"));
}

#[test]
fn unknown_path_is_rejected() {
    let _guard = env_guard().lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("policy.yaml");
    std::fs::write(&file_path, "layout:\n  depth: 4\n").unwrap();
    assert!(load_snapshot(Some(&file_path)).is_err());
}

#[tokio::test]
async fn override_updates_snapshot() {
    let center = InMemoryPolicyCenter::new(default_snapshot());
    let spec = RuntimeOverrideSpec {
        path: "general.autohide_seconds".into(),
        value: serde_json::json!(4),
        owner: "test".into(),
        reason: "unit test".into(),
        ttl_seconds: 0,
    };
    PolicyCenter::apply_override(&center, spec).await.unwrap();
    let snapshot = PolicyCenter::snapshot(&center).await;
    assert_eq!(snapshot.general.autohide_seconds, 4);
    assert_eq!(center.current().general.autohide_seconds, 4);
}

#[tokio::test]
async fn runtime_override_may_raise_round_budget() {
    let center = InMemoryPolicyCenter::new(default_snapshot());
    let spec = RuntimeOverrideSpec {
        path: "convergence.max_rounds".into(),
        value: serde_json::json!(9),
        owner: "test".into(),
        reason: "slow ad network".into(),
        ttl_seconds: 0,
    };
    PolicyCenter::apply_override(&center, spec).await.unwrap();
    let snapshot = PolicyCenter::snapshot(&center).await;
    assert_eq!(snapshot.convergence.max_rounds, 9);
}

#[tokio::test]
async fn rejected_override_leaves_snapshot_untouched() {
    let center = InMemoryPolicyCenter::new(default_snapshot());
    let spec = RuntimeOverrideSpec {
        path: "general.enabled".into(),
        value: serde_json::json!("sometimes"),
        owner: "test".into(),
        reason: "unit test".into(),
        ttl_seconds: 0,
    };
    assert!(PolicyCenter::apply_override(&center, spec).await.is_err());
    let snapshot = PolicyCenter::snapshot(&center).await;
    assert!(snapshot.general.enabled);
}

#[tokio::test]
async fn override_that_breaks_validation_is_rolled_back() {
    let center = InMemoryPolicyCenter::new(default_snapshot());
    let spec = RuntimeOverrideSpec {
        path: "convergence.max_rounds".into(),
        value: serde_json::json!(0),
        owner: "test".into(),
        reason: "unit test".into(),
        ttl_seconds: 0,
    };
    assert!(PolicyCenter::apply_override(&center, spec).await.is_err());
    assert_eq!(center.current().convergence.max_rounds, 5);
    let snapshot = PolicyCenter::snapshot(&center).await;
    assert_eq!(snapshot.convergence.max_rounds, 5);
}

#[tokio::test]
async fn subscribe_streams_updates() {
    let center = InMemoryPolicyCenter::new(default_snapshot());
    let mut rx = PolicyCenter::subscribe(&center);
    let original_rev = rx.borrow().rev;

    let spec = RuntimeOverrideSpec {
        path: "convergence.poll_interval_ms".into(),
        value: serde_json::json!(2500),
        owner: "test".into(),
        reason: "unit test".into(),
        ttl_seconds: 0,
    };
    PolicyCenter::apply_override(&center, spec).await.unwrap();
    rx.changed().await.unwrap();
    let snapshot = Arc::clone(&rx.borrow());
    assert_ne!((*snapshot).rev, original_rev);
    assert_eq!((*snapshot).convergence.poll_interval_ms, 2500);
}

#[tokio::test]
async fn guard_provides_sticky_view() {
    let center = InMemoryPolicyCenter::new(default_snapshot());
    let guard = center.guard().await;
    let snapshot = guard.snapshot();
    assert_eq!(guard.revision(), snapshot.rev);
}

#[test]
fn env_overlay_records_provenance() {
    let _guard = env_guard().lock().unwrap();
    let key = "ADSIDEBAR_POLICY__LAYOUT__VISIBLE_BOXES";
    env::set_var(key, "4");
    let snapshot = load_snapshot(None).expect("load snapshot");
    env::remove_var(key);
    assert_eq!(snapshot.layout.visible_boxes, 4);
    assert_eq!(
        snapshot
            .provenance
            .get("layout.visible_boxes")
            .expect("provenance")
            .source,
        PolicySource::Env
    );
    assert_eq!(
        snapshot
            .provenance
            .get("layout.box_width")
            .expect("provenance")
            .source,
        PolicySource::Builtin
    );
}

#[test]
fn cli_overrides_replace_and_record_provenance() {
    let _guard = env_guard().lock().unwrap();
    env::set_var(
        "ADSIDEBAR_POLICY_CLI_OVERRIDES",
        "general.enabled=false,convergence.max_rounds=7",
    );
    let snapshot = load_snapshot(None).expect("load snapshot with cli");
    env::remove_var("ADSIDEBAR_POLICY_CLI_OVERRIDES");
    assert!(!snapshot.general.enabled);
    assert_eq!(snapshot.convergence.max_rounds, 7);
    assert_eq!(
        snapshot.provenance.get("general.enabled").unwrap().source,
        PolicySource::Cli
    );
}

fn env_guard() -> &'static Mutex<()> {
    static ENV_GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_GUARD.get_or_init(|| Mutex::new(()))
}
