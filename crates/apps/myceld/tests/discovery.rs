//! Two nodes sharing one file-backed interface must discover each other's
//! identities within a few ticks.

use tokio_util::sync::CancellationToken;

use mycel_daemon::config::DaemonConfig;
use mycel_daemon::core::Core;
use mycel_overlay::Reachability;

fn node_config(instance: &std::path::Path, shared: &std::path::Path) -> DaemonConfig {
    let toml = format!(
        r#"
        instance_dir = "{}"
        http_port = 0
        interfaces = ["+>mesh"]

        [rhizome]
        enable = false

        [mdp]
        interface_folder = "{}"
        [mdp.tick_ms_overrides]
        "mesh" = 100
        "#,
        instance.display(),
        shared.display(),
    );
    DaemonConfig::from_toml(&toml).expect("config")
}

#[tokio::test]
async fn dummy_interface_peers_reach_broadcast() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let dir_a = tempfile::tempdir().expect("tempdir");
            let dir_b = tempfile::tempdir().expect("tempdir");
            let shared = tempfile::tempdir().expect("tempdir");

            let cancel_a = CancellationToken::new();
            let cancel_b = CancellationToken::new();
            let core_a = Core::bootstrap(&node_config(dir_a.path(), shared.path()), cancel_a.clone())
                .await
                .expect("bootstrap a");
            let core_b = Core::bootstrap(&node_config(dir_b.path(), shared.path()), cancel_b.clone())
                .await
                .expect("bootstrap b");
            let sid_a = core_a.sid();
            let sid_b = core_b.sid();
            assert_ne!(sid_a, sid_b);

            let task_a = tokio::task::spawn_local(core_a.run());
            let task_b = tokio::task::spawn_local(core_b.run());

            // three ticks of 100ms, with margin
            tokio::time::sleep(std::time::Duration::from_millis(700)).await;
            cancel_a.cancel();
            cancel_b.cancel();
            let core_a = task_a.await.expect("join a");
            let core_b = task_b.await.expect("join b");

            assert_eq!(core_a.reachability_of(&sid_b), Some(Reachability::Broadcast));
            assert_eq!(core_b.reachability_of(&sid_a), Some(Reachability::Broadcast));
        })
        .await;
}
