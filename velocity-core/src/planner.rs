use crate::constraint::{ConstraintStore, DepOp, Scope, Target};
use crate::error::{self, Result};
use crate::graph::ImageGraph;
use crate::image::Image;
use petgraph::graph::NodeIndex;
use snafu::ensure;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Selects a valid, dependency-ordered build tuple from a set of requested targets.
///
/// See the module-level algorithm description: a pre-burner planning pass establishes which
/// images are tentatively in the build, a build-scope constraint fixed point then fans
/// conditional constraints out globally, and a final planning pass produces the recipe.
pub struct RecipePlanner;

impl RecipePlanner {
    pub fn create_build_recipe(
        images: &[Image],
        constraints: &ConstraintStore,
        targets: &[Target],
    ) -> Result<(Vec<Image>, ImageGraph)> {
        // 1. Deep-copy so mutation stays local to this planning call.
        let mut working: Vec<Image> = images.to_vec();

        // 2. Pre-burner: apply every non-build-scope constraint once, then build a graph
        // linking each dependency name to its highest-preferred satisfying image.
        apply_non_build_constraints(&mut working, constraints)?;
        let pre_graph = build_dependency_graph(&working)?;

        // 3. Pre-plan a tentative tuple to learn build membership.
        let tentative = plan(&working, &pre_graph, targets)?;

        // 4. Build-scope constraint fixed point.
        loop {
            let mut changed = false;

            for c in constraints.by_scope(Scope::Build) {
                let activates = tentative
                    .iter()
                    .any(|img| img.satisfies(&c.effective_when()).unwrap_or(false));
                if !activates {
                    continue;
                }
                for img in working.iter_mut() {
                    if img.apply_payload(&c.kind, &c.payload).dependency_added() {
                        changed = true;
                    }
                }
            }

            for c in constraints.not_scope(Scope::Build) {
                let when = c.effective_when();
                for img in working.iter_mut() {
                    if img.apply_constraint(&when, &c.kind, &c.payload)?.dependency_added() {
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        // 5. Rebuild the graph from the final image set.
        let final_graph = build_dependency_graph(&working)?;

        // 6. Re-plan.
        let mut tuple = plan(&working, &final_graph, targets)?;

        for img in tuple.iter_mut() {
            img.resolve_template_hash()?;
        }

        let mut underlay = 0u64;
        for img in tuple.iter_mut() {
            img.underlay = underlay;
            underlay += img.id_numeric();
        }

        Ok((tuple, final_graph))
    }
}

fn apply_non_build_constraints(images: &mut [Image], constraints: &ConstraintStore) -> Result<()> {
    for c in constraints.not_scope(Scope::Build) {
        let when = c.effective_when();
        for img in images.iter_mut() {
            img.apply_constraint(&when, &c.kind, &c.payload)?;
        }
    }
    Ok(())
}

fn preferred_order(a: &Image, b: &Image) -> Ordering {
    if a.version.preferred(&b.version) {
        Ordering::Greater
    } else if b.version.preferred(&a.version) {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Build a graph over `images` with one edge per dependency name, pointed at the
/// highest-preferred image satisfying that name.
fn build_dependency_graph(images: &[Image]) -> Result<ImageGraph> {
    let mut graph = ImageGraph::new();
    let mut node_by_id: HashMap<String, NodeIndex> = HashMap::new();

    for img in images {
        let idx = graph.add_node(img.clone());
        node_by_id.insert(img.id(), idx);
    }

    for img in images {
        let from = node_by_id[&img.id()];
        for dep_name in &img.dependencies {
            let best = images
                .iter()
                .filter(|c| &c.name == dep_name)
                .max_by(|a, b| preferred_order(a, b));
            let Some(best) = best else {
                return error::CannotFindDependencySnafu {
                    image: img.name.clone(),
                    dep: dep_name.clone(),
                }
                .fail();
            };
            let to = node_by_id[&best.id()];
            graph.add_edge(from, to)?;
        }
    }

    Ok(graph)
}

/// One planning pass: seed a build set from the targets, saturate it with transitive
/// dependencies, apply each target's version constraint, then search name-group
/// permutations for a valid, dependency-ordered tuple.
fn plan(images: &[Image], graph: &ImageGraph, targets: &[Target]) -> Result<Vec<Image>> {
    for t in targets {
        ensure!(
            images.iter().any(|i| i.name == t.name),
            error::NoAvailableBuildSnafu {
                targets: targets.iter().map(|t| t.name.clone()).collect::<Vec<_>>()
            }
        );
    }

    let build_names = saturate_build_names(graph, targets);

    let mut survivors: Vec<Image> = images
        .iter()
        .filter(|img| build_names.contains(&img.name))
        .cloned()
        .collect();

    for target in targets {
        survivors.retain(|img| img.name != target.name || target_allows(img, target));
    }

    let mut groups: BTreeMap<String, Vec<Image>> = BTreeMap::new();
    for img in survivors {
        groups.entry(img.name.clone()).or_default().push(img);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| preferred_order(a, b));
        group.reverse();
    }

    let names: Vec<String> = groups.keys().cloned().collect();
    let group_values: Vec<Vec<Image>> = names.iter().map(|n| groups[n].clone()).collect();

    let mut chosen = Vec::with_capacity(group_values.len());
    if let Some(ordered) = search(&group_values, 0, &mut chosen, targets, graph) {
        return Ok(ordered);
    }

    error::NoAvailableBuildSnafu {
        targets: targets.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
    }
    .fail()
}

fn target_allows(img: &Image, target: &Target) -> bool {
    match target.op {
        DepOp::Un => true,
        DepOp::Eq => target.version.as_ref().map_or(true, |v| &img.version == v),
        DepOp::Ge => target.version.as_ref().map_or(true, |v| img.version.ge(v)),
        DepOp::Le => target.version.as_ref().map_or(true, |v| img.version.le(v)),
    }
}

fn saturate_build_names(graph: &ImageGraph, targets: &[Target]) -> HashSet<String> {
    let mut names: HashSet<String> = targets.iter().map(|t| t.name.clone()).collect();
    loop {
        let mut grew = false;
        let current: Vec<String> = names.iter().cloned().collect();
        for name in &current {
            for idx in graph.get_similar_nodes(name) {
                for dep in graph.get_dependencies(idx) {
                    if names.insert(dep.name.clone()) {
                        grew = true;
                    }
                }
            }
        }
        if !grew {
            return names;
        }
    }
}

/// Depth-first search over one-image-per-name-group permutations, trying each group's most
/// preferred candidates first so the first valid tuple found is also the most preferred one.
fn search(
    groups: &[Vec<Image>],
    index: usize,
    chosen: &mut Vec<Image>,
    targets: &[Target],
    graph: &ImageGraph,
) -> Option<Vec<Image>> {
    if index == groups.len() {
        return validate_and_order(chosen, targets, graph);
    }
    for candidate in &groups[index] {
        chosen.push(candidate.clone());
        if let Some(result) = search(groups, index + 1, chosen, targets, graph) {
            return Some(result);
        }
        chosen.pop();
    }
    None
}

fn validate_and_order(candidate: &[Image], targets: &[Target], graph: &ImageGraph) -> Option<Vec<Image>> {
    let target_nodes: Vec<NodeIndex> = candidate
        .iter()
        .filter(|img| targets.iter().any(|t| t.name == img.name))
        .filter_map(|img| graph.node_by_id(&img.id()))
        .collect();

    if target_nodes.is_empty() {
        return None;
    }

    let pruned: Vec<Image> = candidate
        .iter()
        .filter(|img| {
            graph
                .node_by_id(&img.id())
                .map(|idx| target_nodes.iter().any(|&t| graph.is_above(t, idx)))
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    let names: HashSet<&str> = pruned.iter().map(|i| i.name.as_str()).collect();
    for img in &pruned {
        for dep in &img.dependencies {
            if !names.contains(dep.as_str()) {
                return None;
            }
        }
    }

    let mut remaining = pruned;
    let mut processed: HashSet<String> = HashSet::new();
    let mut ordered = Vec::new();

    while !remaining.is_empty() {
        let mut level: Vec<Image> = remaining
            .iter()
            .filter(|img| img.dependencies.iter().all(|d| processed.contains(d)))
            .cloned()
            .collect();

        if level.is_empty() {
            return None;
        }

        level.sort_by(|a, b| preferred_order(a, b).reverse());

        let level_names: HashSet<String> = level.iter().map(|i| i.name.clone()).collect();
        processed.extend(level_names.iter().cloned());
        remaining.retain(|img| !level_names.contains(&img.name));
        ordered.extend(level);
    }

    Some(ordered)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constraint::Constraint;
    use crate::image::ConstraintKind;
    use std::path::PathBuf;
    use velocity_version::Version;

    fn image(name: &str, version: &str) -> Image {
        Image::new(name, Version::parse(version).unwrap(), PathBuf::from("."))
    }

    #[test]
    fn name_only_target_resolves_to_highest_version() {
        let images = vec![image("gcc", "11.2"), image("gcc", "12.3")];
        let store = ConstraintStore::new();
        let targets = vec![Target::parse("gcc").unwrap()];
        let (tuple, _) = RecipePlanner::create_build_recipe(&images, &store, &targets).unwrap();
        assert_eq!(tuple.len(), 1);
        assert_eq!(tuple[0].version.to_string(), "12.3");
    }

    #[test]
    fn version_constraint_restricts_selection() {
        let images = vec![image("gcc", "11.2"), image("gcc", "12.3")];
        let store = ConstraintStore::new();
        let targets = vec![Target::parse("gcc@:11.5").unwrap()];
        let (tuple, _) = RecipePlanner::create_build_recipe(&images, &store, &targets).unwrap();
        assert_eq!(tuple.len(), 1);
        assert_eq!(tuple[0].version.to_string(), "11.2");
    }

    #[test]
    fn transitive_dependency_is_pulled_in_order() {
        let mut gcc = image("gcc", "12.3");
        gcc.dependencies.insert("ubuntu".to_string());
        let ubuntu = image("ubuntu", "22.04");
        let images = vec![gcc, ubuntu];
        let store = ConstraintStore::new();
        let targets = vec![Target::parse("gcc").unwrap()];

        let (tuple, _) = RecipePlanner::create_build_recipe(&images, &store, &targets).unwrap();
        assert_eq!(tuple.len(), 2);
        assert_eq!(tuple[0].name, "ubuntu");
        assert_eq!(tuple[1].name, "gcc");
    }

    #[test]
    fn conditional_dependency_from_constraint_respects_system() {
        let app = image("app", "1");
        let rocm = image("rocm", "5");
        let images = vec![app, rocm];

        let mut store = ConstraintStore::new();
        store.push(Constraint::new(
            "app",
            "system=frontier",
            ConstraintKind::Dependency,
            "rocm",
            Scope::Image,
        ));

        let targets = vec![Target::parse("app").unwrap()];

        let mut frontier_images = images.clone();
        for img in frontier_images.iter_mut() {
            img.system = "frontier".to_string();
        }
        let (tuple, _) = RecipePlanner::create_build_recipe(&frontier_images, &store, &targets).unwrap();
        assert!(tuple.iter().any(|i| i.name == "rocm"));

        let mut laptop_images = images;
        for img in laptop_images.iter_mut() {
            img.system = "laptop".to_string();
        }
        let (tuple, _) = RecipePlanner::create_build_recipe(&laptop_images, &store, &targets).unwrap();
        assert!(!tuple.iter().any(|i| i.name == "rocm"));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut a = image("a", "1");
        a.dependencies.insert("b".to_string());
        let mut b = image("b", "1");
        b.dependencies.insert("a".to_string());
        let images = vec![a, b];
        let store = ConstraintStore::new();
        let targets = vec![Target::parse("a").unwrap()];
        let err = RecipePlanner::create_build_recipe(&images, &store, &targets).unwrap_err();
        assert!(err.to_string().contains("cycle") || err.to_string().contains("acyclicity"));
    }

    #[test]
    fn underlay_is_monotonic_across_stages() {
        let mut gcc = image("gcc", "12.3");
        gcc.dependencies.insert("ubuntu".to_string());
        let ubuntu = image("ubuntu", "22.04");
        let images = vec![gcc, ubuntu];
        let store = ConstraintStore::new();
        let targets = vec![Target::parse("gcc").unwrap()];

        let (tuple, _) = RecipePlanner::create_build_recipe(&images, &store, &targets).unwrap();
        assert_eq!(tuple[0].underlay, 0);
        if tuple[0].id_numeric() > 0 {
            assert!(tuple[1].underlay > tuple[0].underlay);
        }
    }
}
