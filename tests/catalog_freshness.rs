//! Catalog freshness across profile edits: a changed server config must
//! invalidate exactly that server's cache slice, and a rebuild must repopulate
//! it while leaving unaffected servers intact.

mod common;

use common::{SCRIPTED_SERVER, build_stack, write_profile};
use patchbay::config::server_config_hash;

#[tokio::test]
async fn config_change_invalidates_one_server_and_retains_the_other() {
    let tmp = tempfile::TempDir::new().unwrap();
    write_profile(
        tmp.path(),
        "default",
        &[("alpha", SCRIPTED_SERVER), ("beta", SCRIPTED_SERVER)],
    );

    // Initial startup: probe both servers, persist the cache.
    let stack = build_stack(tmp.path(), "default");
    stack.catalog.rebuild(&stack.supervisor, "initial").await;
    let before = stack.catalog.snapshot();
    assert_eq!(before.len(), 4);
    let alpha_hash_before = before.metadata.per_server_hash["alpha"].clone();
    let beta_hash_before = before.metadata.per_server_hash["beta"].clone();
    stack.supervisor.stop_all().await;

    // The collaborator edits alpha's command (an extra no-op env read keeps
    // the script functional but changes the config content).
    let changed_script = format!(": \"$PATCHDUMMY\"; {}", SCRIPTED_SERVER);
    write_profile(
        tmp.path(),
        "default",
        &[("alpha", changed_script.as_str()), ("beta", SCRIPTED_SERVER)],
    );

    // Subsequent startup: the whole-profile hash mismatch schedules a rebuild.
    let restarted = build_stack(tmp.path(), "default");
    assert!(
        !restarted.catalog.load_cached(),
        "cache must not be authoritative after a config change"
    );
    restarted.catalog.rebuild(&restarted.supervisor, "config change").await;

    let after = restarted.catalog.snapshot();
    let alpha_hash_after = after.metadata.per_server_hash["alpha"].clone();
    let beta_hash_after = after.metadata.per_server_hash["beta"].clone();

    assert_ne!(alpha_hash_before, alpha_hash_after, "alpha's hash must change");
    assert_eq!(beta_hash_before, beta_hash_after, "beta's hash must not");
    assert_eq!(
        alpha_hash_after,
        server_config_hash(&restarted.profile.servers["alpha"])
    );

    // Alpha was re-probed and repopulated; beta's entries are intact.
    assert!(after.get("alpha:read_file").is_some());
    assert!(after.get("beta:read_file").is_some());
    assert!(after.get("beta:write_file").is_some());
    restarted.supervisor.stop_all().await;
}

#[tokio::test]
async fn removing_a_server_drops_its_tools_and_embeddings() {
    let tmp = tempfile::TempDir::new().unwrap();
    write_profile(
        tmp.path(),
        "default",
        &[("alpha", SCRIPTED_SERVER), ("beta", SCRIPTED_SERVER)],
    );

    let stack = build_stack(tmp.path(), "default");
    stack.catalog.rebuild(&stack.supervisor, "initial").await;
    stack
        .discovery
        .index_catalog(
            &stack.catalog.snapshot(),
            &patchbay::config::profile_hash(&stack.profile),
        )
        .await
        .unwrap();
    assert_eq!(stack.discovery.indexed_count(), 4);
    stack.supervisor.stop_all().await;

    // Remove beta from the profile.
    write_profile(tmp.path(), "default", &[("alpha", SCRIPTED_SERVER)]);
    let restarted = build_stack(tmp.path(), "default");
    restarted.catalog.rebuild(&restarted.supervisor, "server removed").await;
    restarted
        .discovery
        .index_catalog(
            &restarted.catalog.snapshot(),
            &patchbay::config::profile_hash(&restarted.profile),
        )
        .await
        .unwrap();

    let snapshot = restarted.catalog.snapshot();
    assert!(snapshot.get("beta:read_file").is_none());
    assert!(snapshot.get("alpha:read_file").is_some());
    assert_eq!(restarted.discovery.indexed_count(), 2);

    // And alpha still resolves through discovery.
    let results = restarted.discovery.search("read file", 5, None).await;
    assert!(results.iter().any(|c| c.tool_id == "alpha:read_file"));
    assert!(results.iter().all(|c| !c.tool_id.starts_with("beta:")));
    restarted.supervisor.stop_all().await;
}
