//! Provide/want ordering between processing phases. Processors that provide
//! data (Services, Secrets, IngressClasses) must run before processors that
//! want it; the manager turns those declarations into a deterministic order.

use std::fmt;

/// The closed set of capabilities one phase can provide to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Services,
    Secrets,
    IngressClasses,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Services => write!(f, "services"),
            Capability::Secrets => write!(f, "secrets"),
            Capability::IngressClasses => write!(f, "ingress-classes"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("provide/want cycle: capability {0} cannot be satisfied")]
    Unsatisfiable(Capability),
}

struct Participant {
    name: String,
    provides: Vec<Capability>,
    wants: Vec<Capability>,
}

/// Computes a processing order in which every provider of a capability
/// precedes every wanter of it, ties broken by registration order. A cycle
/// fails deterministically, naming a blocked capability; participants are
/// never silently dropped.
#[derive(Default)]
pub struct DependencyManager {
    participants: Vec<Participant>,
}

impl DependencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        provides: Vec<Capability>,
        wants: Vec<Capability>,
    ) {
        self.participants.push(Participant { name: name.into(), provides, wants });
    }

    /// A valid processing order over participant names (Kahn's algorithm,
    /// lowest registration index first among the ready set).
    pub fn sorted_keys(&self) -> Result<Vec<String>, DependencyError> {
        let n = self.participants.len();

        // Edge provider -> wanter for every shared capability.
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree: Vec<usize> = vec![0; n];

        for (pi, provider) in self.participants.iter().enumerate() {
            for (wi, wanter) in self.participants.iter().enumerate() {
                if pi == wi {
                    continue;
                }
                let edges = wanter
                    .wants
                    .iter()
                    .filter(|c| provider.provides.contains(c))
                    .count();
                if edges > 0 {
                    successors[pi].push(wi);
                    indegree[wi] += edges;
                }
            }
        }

        let mut order = Vec::with_capacity(n);
        let mut placed = vec![false; n];

        while order.len() < n {
            let next = (0..n).find(|&i| !placed[i] && indegree[i] == 0);

            let Some(i) = next else {
                // Every remaining participant is blocked. Report the first
                // blocked capability of the first remaining participant so
                // the failure is stable.
                let cap = self
                    .participants
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !placed[*i])
                    .flat_map(|(_, p)| p.wants.iter())
                    .next()
                    .copied()
                    .unwrap_or(Capability::Services);
                return Err(DependencyError::Unsatisfiable(cap));
            };

            placed[i] = true;
            order.push(self.participants[i].name.clone());

            let provider = &self.participants[i];
            for &wi in &successors[i] {
                let edges = self.participants[wi]
                    .wants
                    .iter()
                    .filter(|c| provider.provides.contains(c))
                    .count();
                indegree[wi] -= edges;
            }
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn providers_precede_wanters() {
        let mut deps = DependencyManager::new();
        deps.register("ingress", vec![], vec![Capability::Services, Capability::IngressClasses]);
        deps.register("service", vec![Capability::Services], vec![]);
        deps.register("ingress-class", vec![Capability::IngressClasses], vec![]);

        let order = deps.sorted_keys().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();

        assert!(pos("service") < pos("ingress"));
        assert!(pos("ingress-class") < pos("ingress"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let mut deps = DependencyManager::new();
        deps.register("b", vec![], vec![]);
        deps.register("a", vec![], vec![]);

        assert_eq!(deps.sorted_keys().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn three_cycle_fails_naming_a_capability() {
        let mut deps = DependencyManager::new();
        deps.register("a", vec![Capability::Services], vec![Capability::IngressClasses]);
        deps.register("b", vec![Capability::Secrets], vec![Capability::Services]);
        deps.register("c", vec![Capability::IngressClasses], vec![Capability::Secrets]);

        match deps.sorted_keys() {
            Err(DependencyError::Unsatisfiable(cap)) => {
                assert_eq!(cap, Capability::IngressClasses)
            }
            Ok(order) => panic!("cycle not detected, got {order:?}"),
        }
    }

    #[test]
    fn wanting_an_unprovided_capability_is_not_a_cycle() {
        let mut deps = DependencyManager::new();
        deps.register("lonely", vec![], vec![Capability::Secrets]);
        assert_eq!(deps.sorted_keys().unwrap(), vec!["lonely"]);
    }
}
