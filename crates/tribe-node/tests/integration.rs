//! End-to-end tribe node scenarios against in-process member clusters.

mod common;

use common::{get_doc, index_doc, wait_view, TestClusters};
use serde_json::json;
use std::time::Duration;
use tribe_node::{BlockReason, ConflictPolicy, FederationHealth, MemberState, Operation, TribeError};

mod blocks {
    use super::*;

    #[tokio::test]
    async fn test_global_write_block() {
        let clusters = TestClusters::new();
        clusters.c1.create_index("test1").unwrap();
        clusters.c2.create_index("test2").unwrap();
        let tribe = clusters
            .tribe(&["t1", "t2"], |c| c.blocks.write = true)
            .await;
        wait_view(&tribe, |v| v.has_index("test1") && v.has_index("test2")).await;

        for index in ["test1", "test2", "missing"] {
            let err = tribe.execute(index_doc(index)).await.unwrap_err();
            assert_eq!(err.block_reason(), Some(BlockReason::GlobalWrite));
            assert!(err.to_string().contains("tribe node, write not allowed"));
        }
        assert_eq!(clusters.c1.doc_count("test1"), 0);

        let response = tribe.execute(get_doc("test1")).await.unwrap();
        assert_eq!(response["found"], false);
        tribe.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_metadata_block() {
        let clusters = TestClusters::new();
        clusters.c1.create_index("test1").unwrap();
        let tribe = clusters
            .tribe(&["t1", "t2"], |c| c.blocks.metadata = true)
            .await;
        wait_view(&tribe, |v| v.has_index("test1")).await;

        for op in [
            Operation::ForceMerge {
                index: "test1".into(),
            },
            Operation::PutMapping {
                index: "test1".into(),
                doc_type: "type2".into(),
                mapping: json!({"properties": {}}),
            },
            Operation::Close {
                index: "test1".into(),
            },
        ] {
            let err = tribe.execute(op).await.unwrap_err();
            assert_eq!(err.block_reason(), Some(BlockReason::GlobalMetadata));
            assert!(err.to_string().contains("BAD_REQUEST/10/tribe node, metadata not allowed"));
        }

        assert!(tribe.execute(index_doc("test1")).await.is_ok());
        tribe.shutdown().await;
    }

    #[tokio::test]
    async fn test_index_write_block_pattern() {
        let clusters = TestClusters::new();
        for index in ["test1", "block_test1"] {
            clusters.c1.create_index(index).unwrap();
        }
        for index in ["test2", "block_test2"] {
            clusters.c2.create_index(index).unwrap();
        }
        let tribe = clusters
            .tribe(&["t1", "t2"], |c| {
                c.blocks.write_indices = vec!["block_*".to_string()]
            })
            .await;
        wait_view(&tribe, |v| v.index_names().len() == 4).await;

        for index in ["block_test1", "block_test2"] {
            let err = tribe.execute(index_doc(index)).await.unwrap_err();
            assert_eq!(err.code(), "pattern_write_block");
            assert!(err.to_string().contains("FORBIDDEN/8/index write (api)"));
        }
        for index in ["test1", "test2"] {
            assert!(tribe.execute(index_doc(index)).await.is_ok());
        }
        assert_eq!(clusters.c1.doc_count("block_test1"), 0);
        assert_eq!(clusters.c2.doc_count("test2"), 1);
        tribe.shutdown().await;
    }
}

mod conflicts {
    use super::*;

    async fn setup(policy: ConflictPolicy) -> (TestClusters, tribe_node::TribeNode) {
        let clusters = TestClusters::new();
        for index in ["test1", "conflict"] {
            clusters.c1.create_index(index).unwrap();
        }
        for index in ["test2", "conflict"] {
            clusters.c2.create_index(index).unwrap();
        }
        let tribe = clusters.tribe(&["t1", "t2"], |c| c.on_conflict = policy).await;
        wait_view(&tribe, |v| v.has_index("test1") && v.has_index("test2")).await;
        (clusters, tribe)
    }

    #[tokio::test]
    async fn test_on_conflict_drop() {
        let (clusters, tribe) = setup(ConflictPolicy::Drop).await;
        let view = tribe.view();
        assert!(!view.has_index("conflict"));
        assert_eq!(view.index("test1").unwrap().tribe_name(), Some("t1"));
        assert_eq!(view.index("test2").unwrap().tribe_name(), Some("t2"));

        let err = tribe.execute(index_doc("conflict")).await.unwrap_err();
        assert!(matches!(err, TribeError::UnknownIndex { .. }));

        clusters.c2.delete_index("conflict").unwrap();
        let view = wait_view(&tribe, |v| v.has_index("conflict")).await;
        assert_eq!(view.index("conflict").unwrap().tribe_name(), Some("t1"));
        tribe.shutdown().await;
    }

    #[tokio::test]
    async fn test_on_conflict_prefer_t1() {
        let (_clusters, tribe) = setup(ConflictPolicy::Prefer("t1".to_string())).await;
        let view = wait_view(&tribe, |v| v.has_index("conflict")).await;
        assert_eq!(view.index("conflict").unwrap().tribe_name(), Some("t1"));
        assert_eq!(view.owner_of("test2"), Some("t2"));
        tribe.shutdown().await;
    }

    #[tokio::test]
    async fn test_on_conflict_prefer_t2() {
        let (clusters, tribe) = setup(ConflictPolicy::Prefer("t2".to_string())).await;
        let view = wait_view(&tribe, |v| v.has_index("conflict")).await;
        assert_eq!(view.index("conflict").unwrap().tribe_name(), Some("t2"));

        tribe.execute(index_doc("conflict")).await.unwrap();
        assert_eq!(clusters.c2.doc_count("conflict"), 1);
        assert_eq!(clusters.c1.doc_count("conflict"), 0);

        clusters.c2.delete_index("conflict").unwrap();
        let view = wait_view(&tribe, |v| !v.has_index("conflict")).await;
        assert!(clusters.c1.facts().indices.contains_key("conflict"));
        assert!(view.has_index("test1"));
        tribe.shutdown().await;
    }
}

mod one_cluster {
    use super::*;

    #[tokio::test]
    async fn test_index_lifecycle_through_one_member() {
        let clusters = TestClusters::new();
        let tribe = clusters.tribe(&["t1"], |_| {}).await;
        assert!(tribe.view().index_names().is_empty());

        clusters.c1.create_index("test1").unwrap();
        let view = wait_view(&tribe, |v| v.has_index("test1")).await;
        assert_eq!(view.index("test1").unwrap().tribe_name(), Some("t1"));
        assert!(view.index("test1").unwrap().mapping("type1").is_none());

        tribe.execute(index_doc("test1")).await.unwrap();
        let view = wait_view(&tribe, |v| {
            v.index("test1").is_some_and(|i| i.mapping("type1").is_some())
        })
        .await;
        assert_eq!(
            view.index("test1").unwrap().mapping("type1").unwrap()["properties"]["field1"]["type"],
            "string"
        );
        let response = tribe.execute(get_doc("test1")).await.unwrap();
        assert_eq!(response["_source"]["field1"], "value1");

        let err = tribe
            .execute(Operation::CreateIndex {
                index: "test2".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TribeError::NoCoordinator { .. }));

        let err = tribe
            .execute(Operation::DeleteIndex {
                index: "test1".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "no_coordinator");
        assert!(clusters.c1.facts().indices.contains_key("test1"));

        clusters.c1.delete_index("test1").unwrap();
        wait_view(&tribe, |v| !v.has_index("test1")).await;
        tribe.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_and_open_index() {
        let clusters = TestClusters::new();
        clusters.c1.create_index("first").unwrap();
        clusters.c1.create_index("second").unwrap();
        let tribe = clusters.tribe(&["t1"], |_| {}).await;
        wait_view(&tribe, |v| v.index_names() == vec!["first", "second"]).await;

        tribe
            .execute(Operation::Close {
                index: "first".into(),
            })
            .await
            .unwrap();
        let view = wait_view(&tribe, |v| v.index("first").is_some_and(|i| !i.is_open())).await;
        assert!(view.index("second").unwrap().is_open());

        let err = tribe.execute(index_doc("first")).await.unwrap_err();
        assert!(matches!(err, TribeError::IndexClosed { .. }));

        tribe
            .execute(Operation::Open {
                index: "first".into(),
            })
            .await
            .unwrap();
        wait_view(&tribe, |v| v.index("first").is_some_and(|i| i.is_open())).await;
        assert!(tribe.execute(index_doc("first")).await.is_ok());
        tribe.shutdown().await;
    }
}

mod nodes {
    use super::*;

    async fn node_names(aliases: &[&str]) -> Vec<String> {
        let clusters = TestClusters::new();
        let tribe = clusters.tribe(aliases, |_| {}).await;
        let names = tribe.view().node_names();
        tribe.shutdown().await;
        names
    }

    #[tokio::test]
    async fn test_cluster_state_nodes() {
        assert_eq!(node_names(&[]).await, vec!["tribe_node"]);
        assert_eq!(
            node_names(&["t1"]).await,
            vec!["tribe_node", "node_1/t1", "node_2/t1", "tribe_node/t1"]
        );
        assert_eq!(
            node_names(&["t2"]).await,
            vec!["tribe_node", "node_1/t2", "node_2/t2", "tribe_node/t2"]
        );
        assert_eq!(
            node_names(&["t1", "t2"]).await,
            vec![
                "tribe_node",
                "node_1/t1",
                "node_1/t2",
                "node_2/t1",
                "node_2/t2",
                "tribe_node/t1",
                "tribe_node/t2",
            ]
        );
    }

    #[tokio::test]
    async fn test_nodes_follow_member_membership() {
        let clusters = TestClusters::new();
        let tribe = clusters.tribe(&["t1", "t2"], |_| {}).await;

        clusters.c1.add_node("node_3");
        let view = wait_view(&tribe, |v| v.node("node_3/t1").is_some()).await;
        assert_eq!(view.node("node_3/t1").unwrap().original_name, "node_3");

        assert!(clusters.c2.remove_node("node_1"));
        let view = wait_view(&tribe, |v| v.node("node_1/t2").is_none()).await;
        assert!(view.node("node_1/t1").is_some());
        tribe.shutdown().await;
    }
}

mod search {
    use super::*;

    #[tokio::test]
    async fn test_search_across_members_merges_hits() {
        let clusters = TestClusters::new();
        clusters.c1.create_index("test1").unwrap();
        clusters.c2.create_index("test2").unwrap();
        let tribe = clusters.tribe(&["t1", "t2"], |_| {}).await;
        wait_view(&tribe, |v| v.index_names().len() == 2).await;

        tribe.execute(index_doc("test1")).await.unwrap();
        tribe.execute(index_doc("test2")).await.unwrap();

        let response = tribe
            .execute(Operation::Search {
                index: None,
                query: json!({"match_all": {}}),
            })
            .await
            .unwrap();
        assert_eq!(response["hits"]["total"], 2);
        assert_eq!(response["members"]["t1"]["hits"]["total"], 1);
        assert_eq!(response["members"]["t2"]["hits"]["hits"][0]["_index"], "test2");

        let response = tribe
            .execute(Operation::Search {
                index: Some("test1".into()),
                query: json!({"match_all": {}}),
            })
            .await
            .unwrap();
        assert_eq!(response["hits"]["total"], 1);
        tribe.shutdown().await;
    }
}

mod connectivity {
    use super::*;

    #[tokio::test]
    async fn test_disconnect_and_reconnect_member() {
        let clusters = TestClusters::new();
        clusters.c1.create_index("test1").unwrap();
        clusters.c2.create_index("test2").unwrap();
        let tribe = clusters.tribe(&["t1", "t2"], |_| {}).await;
        wait_view(&tribe, |v| v.index_names().len() == 2).await;

        clusters.c2.disconnect();
        let view = wait_view(&tribe, |v| v.member_state("t2") != Some(MemberState::Synced)).await;
        assert_eq!(view.index_names(), vec!["test1"]);
        assert_eq!(
            view.node_names(),
            vec!["tribe_node", "node_1/t1", "node_2/t1", "tribe_node/t1"]
        );

        let err = tribe.execute(index_doc("test2")).await.unwrap_err();
        assert!(matches!(err, TribeError::UnknownIndex { .. }));

        clusters.c2.create_index("test3").unwrap();
        clusters.c2.restore();
        let view = wait_view(&tribe, |v| v.member_state("t2") == Some(MemberState::Synced)).await;
        assert_eq!(view.index_names(), vec!["test1", "test2", "test3"]);
        assert_eq!(view.node_count(), 6);

        let stats = tribe.link_stats().await;
        assert!(stats["t2"].reconnects >= 1);
        assert_eq!(stats["t1"].reconnects, 0);
        tribe.shutdown().await;
    }

    #[tokio::test]
    async fn test_member_down_at_startup_joins_later() {
        let clusters = TestClusters::new();
        clusters.c2.create_index("test2").unwrap();
        clusters.c2.disconnect();
        let tribe = clusters
            .tribe(&["t1", "t2"], |c| c.initial_state_timeout_ms = 100)
            .await;
        assert_eq!(tribe.health().unsynced(), vec!["t2"]);

        clusters.c2.restore();
        let view = wait_view(&tribe, |v| v.has_index("test2")).await;
        assert_eq!(view.owner_of("test2"), Some("t2"));
        assert!(tribe.health().unsynced().is_empty());
        tribe.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_members_stay_disconnected_while_retrying() {
        let clusters = TestClusters::new();
        clusters.c1.disconnect();
        clusters.c2.disconnect();
        let tribe = clusters
            .tribe(&["t1", "t2"], |c| c.initial_state_timeout_ms = 100)
            .await;
        wait_view(&tribe, |v| {
            v.member_state("t1") == Some(MemberState::Disconnected)
                && v.member_state("t2") == Some(MemberState::Disconnected)
        })
        .await;

        // Several backoff rounds later the members are still disconnected.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let view = tribe.view();
        assert_eq!(view.member_state("t1"), Some(MemberState::Disconnected));
        assert_eq!(view.member_state("t2"), Some(MemberState::Disconnected));
        assert_eq!(tribe.health().status, FederationHealth::Critical);
        assert!(tribe.link_stats().await["t1"].connect_failures > 2);

        clusters.c1.restore();
        wait_view(&tribe, |v| v.member_state("t1") == Some(MemberState::Synced)).await;
        assert_eq!(tribe.health().status, FederationHealth::Degraded);
        tribe.shutdown().await;
    }

    #[tokio::test]
    async fn test_versions_only_grow() {
        let clusters = TestClusters::new();
        let tribe = clusters.tribe(&["t1"], |_| {}).await;
        let mut last = tribe.view().version();
        for i in 0..5 {
            clusters.c1.create_index(&format!("idx{}", i)).unwrap();
            let view = wait_view(&tribe, |v| v.has_index(&format!("idx{}", i))).await;
            assert!(view.version() > last);
            last = view.version();
        }
        tribe.shutdown().await;
    }
}
