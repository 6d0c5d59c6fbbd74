//! Built-in target sets

use crate::types::TeardownTarget;

/// Id of the k3s preset
pub const K3S: &str = "k3s";

/// Ids of every built-in set
pub const NAMES: [&str; 1] = [K3S];

/// Look up a built-in set by id
pub fn preset(id: &str) -> Option<Vec<TeardownTarget>> {
    match id {
        K3S => Some(k3s()),
        _ => None,
    }
}

/// One-line summary of a built-in set
pub fn description(id: &str) -> Option<&'static str> {
    match id {
        K3S => Some("Remove a single-node k3s install and its network residue"),
        _ => None,
    }
}

/// Residue left by a single-node k3s install: the services, containerd
/// shims, CNI/flannel interfaces, pod mounts and data directories
pub fn k3s() -> Vec<TeardownTarget> {
    let mut targets = vec![
        TeardownTarget::StopService { name: "k3s".into() },
        TeardownTarget::StopService {
            name: "k3s-agent".into(),
        },
    ];
    targets.extend(
        ["containerd-shim", "k3s server", "k3s agent"]
            .into_iter()
            .map(|pattern| TeardownTarget::KillProcesses {
                pattern: pattern.into(),
            }),
    );
    targets.extend(
        ["cni0", "flannel.1", "flannel-v6.1", "flannel-wg", "flannel-wg-v6", "kube-ipvs0"]
            .into_iter()
            .map(|name| TeardownTarget::DeleteInterface { name: name.into() }),
    );
    targets.push(TeardownTarget::DeleteInterfaces {
        pattern: r"^veth[0-9a-f]+$".into(),
    });
    targets.push(TeardownTarget::DeleteNetns {
        prefix: "cni-".into(),
    });
    targets.extend(
        ["/run/k3s", "/var/lib/kubelet/pods", "/var/lib/kubelet/plugins"]
            .into_iter()
            .map(|prefix| TeardownTarget::Unmount {
                prefix: prefix.into(),
            }),
    );
    targets.extend(
        [
            "/var/lib/rancher/k3s",
            "/etc/rancher/k3s",
            "/run/k3s",
            "/run/flannel",
            "/var/lib/kubelet",
            "/var/lib/cni",
        ]
        .into_iter()
        .map(|path| TeardownTarget::RemovePath { path: path.into() }),
    );
    targets.push(TeardownTarget::RestartService {
        name: "systemd-networkd".into(),
    });
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Stage;

    #[test]
    fn test_k3s_preset_is_already_in_stage_order() {
        let targets = k3s();
        let stages: Vec<Stage> = targets.iter().map(TeardownTarget::stage).collect();
        let mut sorted = stages.clone();
        sorted.sort();
        assert_eq!(stages, sorted);
        assert_eq!(targets.first().map(ToString::to_string), Some("stop-service k3s".into()));
    }

    #[test]
    fn test_preset_lookup() {
        assert!(preset("k3s").is_some());
        assert!(preset("k8s").is_none());
        assert!(NAMES.iter().all(|name| preset(name).is_some()));
        assert!(NAMES.iter().all(|name| description(name).is_some()));
        assert!(description("k8s").is_none());
    }
}
