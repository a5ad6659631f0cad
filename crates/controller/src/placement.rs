//! Placement resolver (C4, §4.4).

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::store::ControllerStore;

/// `resolve(tags)`: empty tags means every online node with an agent;
/// non-empty tags means every online, has-agent node whose tag set
/// intersects the input. No ordering guarantee on the result (§4.4).
pub async fn resolve(store: &Arc<dyn ControllerStore>, tags: &BTreeSet<String>) -> anyhow::Result<Vec<String>> {
    let tag_vec: Vec<String> = tags.iter().cloned().collect();
    let nodes = if tag_vec.is_empty() {
        store.list_nodes(true).await?
    } else {
        store
            .list_nodes_by_tags(&tag_vec)
            .await?
            .into_iter()
            .filter(|n| n.online)
            .collect()
    };
    Ok(nodes.into_iter().filter(|n| n.has_agent).map(|n| n.hostname).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockStore, NodeRow};
    use chrono::Utc;

    fn node(hostname: &str, tags: &[&str], online: bool, has_agent: bool) -> NodeRow {
        NodeRow {
            hostname: hostname.to_string(),
            ip: None,
            tags_json: serde_json::to_string(&tags).unwrap(),
            online,
            has_agent,
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_tags_returns_all_online_agents() {
        let store: Arc<dyn ControllerStore> = Arc::new(MockStore::new());
        store.upsert_node(node("a", &["web"], true, true)).await.unwrap();
        store.upsert_node(node("b", &["db"], false, true)).await.unwrap();
        store.upsert_node(node("c", &[], true, false)).await.unwrap();

        let mut result = resolve(&store, &BTreeSet::new()).await.unwrap();
        result.sort();
        assert_eq!(result, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn tag_intersection_excludes_offline_and_agentless() {
        let store: Arc<dyn ControllerStore> = Arc::new(MockStore::new());
        store.upsert_node(node("a", &["web", "all"], true, true)).await.unwrap();
        store.upsert_node(node("b", &["db"], true, true)).await.unwrap();
        store.upsert_node(node("c", &["web"], false, true)).await.unwrap();
        store.upsert_node(node("d", &["web"], true, false)).await.unwrap();

        let tags: BTreeSet<String> = ["web"].iter().map(|s| s.to_string()).collect();
        let mut result = resolve(&store, &tags).await.unwrap();
        result.sort();
        assert_eq!(result, vec!["a".to_string()]);
    }
}
