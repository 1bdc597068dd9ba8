//! Override-merge of generated container settings with user overrides
//!
//! Every merge keys items by identity (argument flag, env name, volume
//! name, mount name). Override items come first, followed by the base
//! items whose key the override does not mention, both in their original
//! order. An empty override returns the base untouched.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, Volume, VolumeMount};

fn merge_by_key<T: Clone>(base: &[T], overrides: &[T], key: impl Fn(&T) -> &str) -> Vec<T> {
    if overrides.is_empty() {
        return base.to_vec();
    }
    let overridden: HashSet<&str> = overrides.iter().map(&key).collect();
    overrides
        .iter()
        .cloned()
        .chain(
            base.iter()
                .filter(|item| !overridden.contains(key(item)))
                .cloned(),
        )
        .collect()
}

/// Identity of a command-line argument: the text before the first `=`
pub fn arg_key(arg: &str) -> &str {
    arg.split_once('=').map_or(arg, |(flag, _)| flag)
}

/// Merge command-line arguments, keyed by flag
pub fn merge_args(base: &[String], overrides: &[String]) -> Vec<String> {
    merge_by_key(base, overrides, |a| arg_key(a))
}

/// Merge environment variables, keyed by name
pub fn merge_envs(base: &[EnvVar], overrides: &[EnvVar]) -> Vec<EnvVar> {
    merge_by_key(base, overrides, |e| e.name.as_str())
}

/// Merge pod volumes, keyed by name
pub fn merge_volumes(base: &[Volume], overrides: &[Volume]) -> Vec<Volume> {
    merge_by_key(base, overrides, |v| v.name.as_str())
}

/// Merge container volume mounts, keyed by name
pub fn merge_volume_mounts(base: &[VolumeMount], overrides: &[VolumeMount]) -> Vec<VolumeMount> {
    merge_by_key(base, overrides, |m| m.name.as_str())
}

/// Merge resource requirements
///
/// `requests` and `limits` are each replaced wholesale when the override
/// sets a non-empty map; a partial override does not merge per resource.
pub fn merge_resources(
    base: Option<ResourceRequirements>,
    overrides: Option<&ResourceRequirements>,
) -> Option<ResourceRequirements> {
    let Some(overrides) = overrides else {
        return base;
    };
    let mut merged = base.unwrap_or_default();
    if let Some(requests) = overrides.requests.as_ref().filter(|r| !r.is_empty()) {
        merged.requests = Some(requests.clone());
    }
    if let Some(limits) = overrides.limits.as_ref().filter(|l| !l.is_empty()) {
        merged.limits = Some(limits.clone());
    }
    if merged == ResourceRequirements::default() {
        return None;
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    /// Story: a user pins one flag and adds another; generated flags survive
    #[test]
    fn story_user_flag_wins_and_generated_flags_follow() {
        let base = args(&["--api-addr=0.0.0.0:8888", "--log-level=info", "--debug"]);
        let overrides = args(&["--log-level=debug", "--extra=1"]);

        let merged = merge_args(&base, &overrides);
        assert_eq!(
            merged,
            args(&[
                "--log-level=debug",
                "--extra=1",
                "--api-addr=0.0.0.0:8888",
                "--debug",
            ])
        );
    }

    #[test]
    fn test_bare_flag_collides_with_valued_flag() {
        let merged = merge_args(&args(&["--debug=false"]), &args(&["--debug"]));
        assert_eq!(merged, args(&["--debug"]));
    }

    #[test]
    fn test_empty_override_returns_base() {
        let base = args(&["--a=1", "--b=2"]);
        assert_eq!(merge_args(&base, &[]), base);
        let envs = vec![env("A", "1")];
        assert_eq!(merge_envs(&envs, &[]), envs);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = vec![env("A", "1"), env("B", "2")];
        let overrides = vec![env("B", "3"), env("C", "4")];
        let once = merge_envs(&base, &overrides);
        let twice = merge_envs(&once, &overrides);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
        assert_eq!(once[0], env("B", "3"));
    }

    #[test]
    fn test_length_bound_without_collision() {
        let base = vec![env("A", "1")];
        let overrides = vec![env("B", "2")];
        assert_eq!(merge_envs(&base, &overrides).len(), 2);
    }

    #[test]
    fn test_volumes_and_mounts_keyed_by_name() {
        let base = vec![
            Volume {
                name: "data".to_string(),
                ..Default::default()
            },
            Volume {
                name: "logs".to_string(),
                ..Default::default()
            },
        ];
        let overrides = vec![Volume {
            name: "data".to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        }];
        let merged = merge_volumes(&base, &overrides);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].empty_dir.is_some());
        assert_eq!(merged[1].name, "logs");

        let mounts = merge_volume_mounts(
            &[VolumeMount {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
                ..Default::default()
            }],
            &[VolumeMount {
                name: "data".to_string(),
                mount_path: "/srv".to_string(),
                ..Default::default()
            }],
        );
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].mount_path, "/srv");
    }

    /// Story: overriding only limits keeps the generated requests
    #[test]
    fn story_limits_override_keeps_requests() {
        let base = ResourceRequirements {
            requests: Some(quantities(&[("cpu", "100m"), ("memory", "128Mi")])),
            limits: Some(quantities(&[("cpu", "1")])),
            ..Default::default()
        };
        let overrides = ResourceRequirements {
            limits: Some(quantities(&[("memory", "1Gi")])),
            ..Default::default()
        };

        let merged = merge_resources(Some(base.clone()), Some(&overrides))
            .expect("merged resources should be present");
        assert_eq!(merged.requests, base.requests);
        // whole map replaced, cpu limit is gone
        assert_eq!(merged.limits, Some(quantities(&[("memory", "1Gi")])));
    }

    #[test]
    fn test_empty_resource_override_is_ignored() {
        let base = ResourceRequirements {
            requests: Some(quantities(&[("cpu", "100m")])),
            ..Default::default()
        };
        let overrides = ResourceRequirements {
            requests: Some(BTreeMap::new()),
            ..Default::default()
        };
        assert_eq!(
            merge_resources(Some(base.clone()), Some(&overrides)),
            Some(base)
        );
        assert_eq!(merge_resources(None, None), None);
    }
}
