//! Mode routing: where a session is, and how to get somewhere else.
//!
//! Routes go through the lowest common ancestor of the two modes, so they use
//! the fewest mode changes the tree allows.

use std::cmp::Reverse;
use std::collections::HashSet;

use log::{debug, trace, warn};

use crate::error::CliError;
use crate::mode::{ModeId, ModeRegistry};
use crate::session::{Session, last_line};

/// One mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Leave the mode for its parent.
    Down(ModeId),
    /// Enter the mode from its parent.
    Up(ModeId),
}

impl Step {
    pub fn apply<S: Session + ?Sized>(
        &self,
        registry: &ModeRegistry,
        session: &mut S,
    ) -> Result<(), CliError> {
        match *self {
            Step::Down(mode) => registry.step_down(mode, session),
            Step::Up(mode) => registry.step_up(mode, session),
        }
    }

    /// The mode a session is in once this step succeeded.
    pub fn destination(&self, registry: &ModeRegistry) -> ModeId {
        match *self {
            Step::Down(mode) => registry.mode(mode).parent().unwrap_or(mode),
            Step::Up(mode) => mode,
        }
    }
}

/// Steps leading from `current` to `target`.
///
/// Steps down from `current` until reaching the lowest common ancestor, then
/// up through each mode below it until `target`. Empty when both are equal.
pub fn calculate_route_steps(registry: &ModeRegistry, current: ModeId, target: ModeId) -> Vec<Step> {
    if current == target {
        return Vec::new();
    }

    let current_chain = registry.ancestors(current);
    let target_chain = registry.ancestors(target);
    let target_set = target_chain.iter().copied().collect::<HashSet<_>>();

    // Both chains end at the root, so a common node always exists.
    let lca = current_chain
        .iter()
        .copied()
        .find(|mode| target_set.contains(mode))
        .unwrap_or_else(|| registry.root());

    let mut steps = current_chain
        .iter()
        .take_while(|mode| **mode != lca)
        .map(|mode| Step::Down(*mode))
        .collect::<Vec<_>>();

    let mut ups = target_chain
        .iter()
        .take_while(|mode| **mode != lca)
        .map(|mode| Step::Up(*mode))
        .collect::<Vec<_>>();
    ups.reverse();
    steps.extend(ups);

    trace!(
        "Route {} -> {} via {}: {:?}",
        registry.name(current),
        registry.name(target),
        registry.name(lca),
        steps
    );
    steps
}

/// Finds the mode whose prompt best matches `prompt_line`.
///
/// When several prompts match, the longest matched text wins, then the
/// deeper mode, then the mode registered first.
pub fn identify_prompt(registry: &ModeRegistry, prompt_line: &str) -> Option<ModeId> {
    registry
        .iter()
        .filter_map(|(id, mode)| {
            mode.prompt_regex()
                .find(prompt_line)
                .map(|m| (id, m.len(), mode.depth()))
        })
        .max_by_key(|(id, len, depth)| (*len, *depth, Reverse(*id)))
        .map(|(id, _, _)| id)
}

/// Probes the session with an empty command and identifies its mode from the
/// returned prompt, falling back to `default` when no prompt matches or none
/// shows up before the session times out. Other session errors are returned.
pub fn determine_current_mode<S: Session + ?Sized>(
    session: &mut S,
    registry: &ModeRegistry,
    default: ModeId,
) -> Result<ModeId, CliError> {
    let output = match session.send_and_expect("", registry.prompts_pattern(), None, None) {
        Ok(output) => output,
        Err(CliError::ExpectTimeout(output)) => {
            warn!(
                "No known prompt in probe output {:?}, assuming {}",
                last_line(&output),
                registry.name(default)
            );
            return Ok(default);
        }
        Err(err) => return Err(err),
    };
    let prompt = last_line(&output);
    match identify_prompt(registry, prompt) {
        Some(mode) => {
            debug!("Prompt {:?} identified as mode {}", prompt, registry.name(mode));
            Ok(mode)
        }
        None => {
            debug!(
                "Prompt {:?} matches no mode, assuming {}",
                prompt,
                registry.name(default)
            );
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Step, calculate_route_steps, identify_prompt};
    use crate::mode::{ModeDefinition, ModeRegistry};

    // root -> enable -> config -> interface
    //                          -> vlan
    //      -> diag
    fn registry() -> ModeRegistry {
        ModeRegistry::new(vec![
            ModeDefinition::new("root", r">\s*$"),
            ModeDefinition::new("enable", r"#\s*$")
                .parent("root")
                .enter("enable")
                .exit("disable"),
            ModeDefinition::new("config", r"\(config\)#\s*$")
                .parent("enable")
                .enter("configure terminal")
                .exit("exit"),
            ModeDefinition::new("interface", r"\(config-if\)#\s*$")
                .parent("config")
                .enter("interface Gi0/1")
                .exit("exit"),
            ModeDefinition::new("vlan", r"\(config-vlan\)#\s*$")
                .parent("config")
                .enter("vlan 10")
                .exit("exit"),
            ModeDefinition::new("diag", r"\(diag\)>\s*$")
                .parent("root")
                .enter("diagnose")
                .exit("quit"),
        ])
        .expect("valid tree")
    }

    fn names(registry: &ModeRegistry, steps: &[Step]) -> Vec<String> {
        steps
            .iter()
            .map(|step| match step {
                Step::Down(m) => format!("down:{}", registry.name(*m)),
                Step::Up(m) => format!("up:{}", registry.name(*m)),
            })
            .collect()
    }

    #[test]
    fn same_mode_needs_no_steps() {
        let registry = registry();
        let config = registry.id("config").unwrap();
        assert!(calculate_route_steps(&registry, config, config).is_empty());
    }

    #[test]
    fn sibling_route_goes_through_common_parent() {
        let registry = registry();
        let interface = registry.id("interface").unwrap();
        let vlan = registry.id("vlan").unwrap();

        let steps = calculate_route_steps(&registry, interface, vlan);
        assert_eq!(names(&registry, &steps), vec!["down:interface", "up:vlan"]);
    }

    #[test]
    fn cross_branch_route_descends_to_root() {
        let registry = registry();
        let interface = registry.id("interface").unwrap();
        let diag = registry.id("diag").unwrap();

        let steps = calculate_route_steps(&registry, interface, diag);
        assert_eq!(
            names(&registry, &steps),
            vec!["down:interface", "down:config", "down:enable", "up:diag"]
        );
    }

    #[test]
    fn route_length_matches_depth_formula_for_every_pair() {
        let registry = registry();
        for (a, mode_a) in registry.iter() {
            for (b, mode_b) in registry.iter() {
                let chain_b = registry.ancestors(b);
                let lca = registry
                    .ancestors(a)
                    .into_iter()
                    .find(|m| chain_b.contains(m))
                    .unwrap();
                let lca_depth = registry.mode(lca).depth();
                let steps = calculate_route_steps(&registry, a, b);
                assert_eq!(steps.len(), mode_a.depth() + mode_b.depth() - 2 * lca_depth);

                let landed = steps
                    .iter()
                    .fold(a, |_, step| step.destination(&registry));
                assert_eq!(landed, b);
            }
        }
    }

    #[test]
    fn longest_prompt_match_wins() {
        let registry = registry();
        // "#" alone matches enable; the config prompts match more text.
        assert_eq!(
            identify_prompt(&registry, "sw1(config-if)#"),
            registry.id("interface").ok()
        );
        assert_eq!(identify_prompt(&registry, "sw1#"), registry.id("enable").ok());
        assert_eq!(identify_prompt(&registry, "sw1(diag)>"), registry.id("diag").ok());
        assert_eq!(identify_prompt(&registry, "Password:"), None);
    }

    #[test]
    fn equal_matches_prefer_deeper_then_earlier_mode() {
        let registry = ModeRegistry::new(vec![
            ModeDefinition::new("root", r"#\s*$"),
            ModeDefinition::new("shell", r"#\s*$")
                .parent("root")
                .enter("start shell")
                .exit("exit"),
            ModeDefinition::new("other", r"#\s*$")
                .parent("root")
                .enter("other")
                .exit("exit"),
        ])
        .expect("valid tree");

        assert_eq!(identify_prompt(&registry, "host#"), registry.id("shell").ok());
    }
}
