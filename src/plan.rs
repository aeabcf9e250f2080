//! Configuration-upload payload and the normalized, atomically-swapped
//! plan it produces. The plan is loaded under a single-writer discipline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw upload payload as received over the HTTP boundary. String-int keys
/// are normalized to `u32`s by [`RawUploadPayload::normalize`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawUploadPayload {
    pub instance_info: InstanceInfo,
    pub deployment: BTreeMap<String, i64>,
    pub routes: BTreeMap<String, Vec<u32>>,
    pub metrics: UploadMetrics,
    pub wl_nodes: Vec<u32>,
    pub table_entries: BTreeMap<String, Vec<ClassifierEntryDoc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceInfo {
    pub nodes: u32,
    pub colors: u32,
    pub run_time: f64,
    pub solution_cost: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadMetrics {
    pub num_nodes_deployed: u32,
    pub average_path_weight: f64,
    pub percentage_covered: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierEntryDoc {
    pub table: String,
    pub action: String,
    pub match_fields: Vec<i64>,
    pub action_params: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct ClassifierEntry {
    pub table: String,
    pub action: String,
    pub match_fields: Vec<i64>,
    pub action_params: Vec<i64>,
}

impl From<ClassifierEntryDoc> for ClassifierEntry {
    fn from(d: ClassifierEntryDoc) -> Self {
        Self {
            table: d.table,
            action: d.action,
            match_fields: d.match_fields,
            action_params: d.action_params,
        }
    }
}

/// A host-pair route: the declared switch path and the host endpoints it
/// connects.
#[derive(Debug, Clone)]
pub struct Route {
    pub src_host: String,
    pub dst_host: String,
    pub path: Vec<String>,
}

impl Route {
    /// Numeric switch ids in visit order, for [`crate::rules::TunnelId`]
    /// derivation. Assumes switch names are `s<N>`.
    pub fn switch_path_ids(&self) -> Vec<u32> {
        self.path
            .iter()
            .filter_map(|s| s.trim_start_matches('s').parse().ok())
            .collect()
    }
}

/// The normalized, applied plan. One instance lives behind an `ArcSwap`
/// in the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub deployment: BTreeMap<String, i64>,
    pub routes: BTreeMap<String, Route>,
    pub wl_nodes: Vec<u32>,
    pub classifier_entries: BTreeMap<String, Vec<ClassifierEntry>>,
}

impl Plan {
    /// Normalize a raw upload: parse `"<src>,<dst>"` route keys into
    /// distinct endpoints, fold in the deployment/WL/classifier tables.
    pub fn from_raw(raw: RawUploadPayload) -> Self {
        let routes = raw
            .routes
            .into_iter()
            .filter_map(|(key, path_ids)| {
                let (src, dst) = key.split_once(',')?;
                let path = path_ids.iter().map(|id| format!("s{id}")).collect();
                Some((
                    key.clone(),
                    Route {
                        src_host: src.to_string(),
                        dst_host: dst.to_string(),
                        path,
                    },
                ))
            })
            .collect();

        let classifier_entries = raw
            .table_entries
            .into_iter()
            .map(|(node, entries)| (node, entries.into_iter().map(ClassifierEntry::from).collect()))
            .collect();

        Plan {
            deployment: raw.deployment,
            routes,
            wl_nodes: raw.wl_nodes,
            classifier_entries,
        }
    }

    /// Every unordered host pair gets two tunnels, one per direction.
    /// Returns `(forward_route, reverse_path)`.
    pub fn directional_tunnels(&self) -> Vec<(&Route, Vec<String>)> {
        self.routes
            .values()
            .map(|route| {
                let mut reverse = route.path.clone();
                reverse.reverse();
                (route, reverse)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raw() -> RawUploadPayload {
        RawUploadPayload {
            instance_info: InstanceInfo {
                nodes: 4,
                colors: 2,
                run_time: 1.0,
                solution_cost: 0.5,
            },
            deployment: BTreeMap::from([("1".to_string(), 0)]),
            routes: BTreeMap::from([("1,4".to_string(), vec![1, 2, 3, 4])]),
            metrics: UploadMetrics {
                num_nodes_deployed: 4,
                average_path_weight: 1.0,
                percentage_covered: 1.0,
            },
            wl_nodes: vec![2],
            table_entries: BTreeMap::new(),
        }
    }

    #[test]
    fn normalizes_route_key_into_switch_path() {
        let plan = Plan::from_raw(sample_raw());
        let route = plan.routes.get("1,4").unwrap();
        assert_eq!(route.path, vec!["s1", "s2", "s3", "s4"]);
        assert_eq!(route.switch_path_ids(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn directional_tunnels_include_the_reverse_path() {
        let plan = Plan::from_raw(sample_raw());
        let (_route, reverse) = &plan.directional_tunnels()[0];
        assert_eq!(reverse, &vec!["s4", "s3", "s2", "s1"]);
    }
}
